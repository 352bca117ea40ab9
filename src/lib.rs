//! Playlist and renderer management for a media player front end.
//!
//! Components talk over one `tokio::sync::broadcast` bus carrying
//! [`protocol::Message`]. The [`playlist_manager::PlaylistManager`] owns the
//! queue and drives the player, the P2P engine and renderer selection.

pub mod app_bootstrap;
pub mod config;
pub mod error;
pub mod media;
pub mod navigation;
pub mod p2p;
pub mod player;
pub mod playlist_manager;
pub mod protocol;
pub mod renderer_discovery;
pub mod renderer_registry;
pub mod settings_store;
pub mod update_coalescer;

pub use media::{MediaItem, MediaKind, MediaList};
pub use playlist_manager::PlaylistManager;
pub use protocol::{Message, RepeatMode};
pub use renderer_registry::{RendererItem, RendererRegistry};
pub use settings_store::SettingsStore;
