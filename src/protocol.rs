//! Event-bus protocol shared by all runtime components.
//!
//! This module defines the message payloads exchanged between the playlist
//! manager, the player and P2P collaborators, the renderer registry, and
//! whatever front end is listening on the bus. Everything travels over one
//! broadcast channel so listeners observe events in the order they were issued.

use crate::media::{ListKind, MediaItem};
use crate::renderer_registry::RendererItem;

/// Repeat behavior applied when navigating beyond the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    None, // Stop after reaching the end of playlist
    One,  // Repeat current item
    All,  // Repeat playlist from the beginning
}

impl RepeatMode {
    /// Integer code used by the settings store.
    pub fn as_code(self) -> i64 {
        match self {
            RepeatMode::None => 0,
            RepeatMode::One => 1,
            RepeatMode::All => 2,
        }
    }

    /// Unknown codes fall back to `None`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => RepeatMode::One,
            2 => RepeatMode::All,
            _ => RepeatMode::None,
        }
    }
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Playlist(PlaylistMessage),
    Player(PlayerEvent),
    P2p(P2pMessage),
    Renderer(RendererMessage),
    Notice(Notice),
}

/// Lifecycle of the active playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
}

/// Options for tearing down playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Release the player entirely instead of restarting it.
    pub system_exit: bool,
    /// Drop the playlist and reset the cursor.
    pub clear_playlist: bool,
    /// Persist position and item metadata before stopping.
    pub save_metadata: bool,
    /// Keep a temporary renderer selection instead of restoring the global one.
    pub keep_renderer: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            system_exit: false,
            clear_playlist: true,
            save_metadata: true,
            keep_renderer: false,
        }
    }
}

/// Snapshot of the list pushed through the update coalescer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistSnapshot {
    pub items: Vec<MediaItem>,
    pub current_index: Option<usize>,
}

/// Structural difference between two applied snapshots, keyed by item id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListDiff {
    /// Positions in the old list whose item no longer exists.
    pub removed: Vec<usize>,
    /// Positions in the new list whose item did not exist before.
    pub inserted: Vec<usize>,
    /// Surviving items whose relative order changed, as (old, new) positions.
    pub moved: Vec<(usize, usize)>,
}

impl ListDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty() && self.moved.is_empty()
    }
}

/// Playlist-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum PlaylistMessage {
    LoadLocations {
        locations: Vec<String>,
        position: usize,
        start: bool,
    },
    Load {
        items: Vec<MediaItem>,
        position: usize,
        start: bool,
    },
    LoadLastPlaylist(ListKind),
    Play,
    Pause,
    Next,
    Previous {
        force: bool,
    },
    PlayIndex(usize),
    Stop(StopOptions),
    SetShuffle(bool),
    ToggleShuffle,
    SetRepeatMode(RepeatMode),
    Append(Vec<MediaItem>),
    InsertNext(Vec<MediaItem>),
    InsertItem {
        position: usize,
        item: MediaItem,
    },
    MoveItem {
        from: usize,
        to: usize,
    },
    RemoveItem(usize),
    RemoveLocation(String),
    SwitchStream(i32),
    PlaylistLoaded {
        size: usize,
        current_index: Option<usize>,
    },
    IndicesChanged {
        current_index: Option<usize>,
        next_index: Option<usize>,
        prev_index: Option<usize>,
        shuffle: bool,
        repeat_mode: RepeatMode,
    },
    PlaybackStateChanged(PlaybackState),
    NewPlayback {
        index: usize,
        item_id: String,
    },
    /// Playback of a P2P item was handed to a remote P2P-capable renderer.
    RemotePlaybackRequested {
        index: usize,
        renderer_id: String,
        from_start: bool,
    },
    ListUpdated {
        snapshot: PlaylistSnapshot,
        diff: ListDiff,
    },
    /// The navigation ran off the end; any open player view should close.
    ExitPlayer,
    PlaybackStopped,
}

/// Events reported by the native player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Playing,
    Paused,
    EndReached,
    EncounteredError,
}

/// P2P session lifecycle, published for listeners and consumed by the
/// playlist manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pMessage {
    SessionStarting {
        item_id: String,
    },
    SessionStarted {
        item_id: String,
        playback_url: String,
    },
    PrebufferingDone {
        item_id: String,
        index: Option<usize>,
    },
    SessionFailed {
        item_id: String,
        message: String,
    },
}

/// Renderer registry notifications.
#[derive(Debug, Clone)]
pub enum RendererMessage {
    RenderersChanged { empty: bool },
    RendererChanged {
        from_user: bool,
        renderer: Option<RendererItem>,
    },
    /// Discovery was restarted after connectivity came back.
    Reloaded,
}

/// User-facing notices (toasts in a graphical front end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    InvalidLocation(String),
    InternalError,
    LastPlaylistLoadFailed,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::InvalidLocation(location) => write!(f, "Invalid location: {location}"),
            Notice::InternalError => write!(f, "Internal error"),
            Notice::LastPlaylistLoadFailed => write!(f, "Failed to load last playlist"),
        }
    }
}
