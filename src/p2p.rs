//! Contract of the P2P streaming engine.
//!
//! The engine runs its sessions elsewhere and reports back through
//! [`P2pSessionEvents`], which posts [`P2pMessage`]s on the shared bus. The
//! playlist manager reacts to those messages on its own thread.

use log::debug;
use tokio::sync::broadcast::Sender;

use crate::error::P2pError;
use crate::media::P2pSource;
use crate::protocol::{Message, P2pMessage};

/// Everything the engine needs to open a session for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pSessionRequest {
    pub item_id: String,
    pub source: P2pSource,
    /// File indexes the engine may prefetch after the current one.
    pub next_file_indexes: Vec<u32>,
    /// Alternative stream to switch to inside the same transport.
    pub stream_index: Option<i32>,
}

/// Bus-backed callback handed to the engine for one session.
#[derive(Clone)]
pub struct P2pSessionEvents {
    item_id: String,
    index: Option<usize>,
    bus_producer: Sender<Message>,
}

impl P2pSessionEvents {
    pub fn new(
        item_id: impl Into<String>,
        index: Option<usize>,
        bus_producer: Sender<Message>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            index,
            bus_producer,
        }
    }

    /// The engine produced a URL the player can open.
    pub fn on_started(&self, playback_url: impl Into<String>) {
        self.send(P2pMessage::SessionStarted {
            item_id: self.item_id.clone(),
            playback_url: playback_url.into(),
        });
    }

    pub fn on_prebuffering_done(&self) {
        self.send(P2pMessage::PrebufferingDone {
            item_id: self.item_id.clone(),
            index: self.index,
        });
    }

    pub fn on_error(&self, message: impl Into<String>) {
        self.send(P2pMessage::SessionFailed {
            item_id: self.item_id.clone(),
            message: message.into(),
        });
    }

    fn send(&self, message: P2pMessage) {
        if self.bus_producer.send(Message::P2p(message)).is_err() {
            debug!("P2pSessionEvents: no bus listeners for item {}", self.item_id);
        }
    }
}

/// P2P engine operations used by the playlist manager.
pub trait P2pEngine: Send {
    /// Requests a session. Progress is reported through `events`.
    fn start_session(
        &mut self,
        request: P2pSessionRequest,
        events: P2pSessionEvents,
    ) -> Result<(), P2pError>;

    /// Stops any running session.
    fn stop_session(&mut self);

    /// Playback URL of the running session when it streams `source`.
    fn active_session_url(&self, source: &P2pSource) -> Option<String>;
}
