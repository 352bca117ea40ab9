//! Media entries and the ordered list the playlist manager plays from.

use uuid::Uuid;

/// Location prefix of P2P items backed by a transient content provider.
/// Those cannot be resolved after a restart, so they are never persisted.
pub const TRANSIENT_P2P_LOCATION_PREFIX: &str = "acestream:?data=content%3A%2F%2F";

/// Broad media category used for audio/video routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Stream,
}

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "oga", "opus", "wav", "m4a", "aac"];
const STREAM_SCHEMES: &[&str] = &["http", "https", "rtsp", "rtmp", "mms", "udp"];

impl MediaKind {
    /// Best guess for an item created from a bare location.
    pub fn from_location(location: &str) -> Self {
        let location = location.trim();
        if let Some((scheme, _)) = location.split_once("://") {
            if STREAM_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
                return MediaKind::Stream;
            }
        }
        let path = location.split(['?', '#']).next().unwrap_or(location);
        let extension = path
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .unwrap_or_default();
        if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            MediaKind::Audio
        } else {
            MediaKind::Video
        }
    }
}

/// Which saved playlist slot a list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Audio,
    Media,
}

/// Per-item playback flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MediaFlags {
    /// Start paused when the item is restored.
    #[serde(default)]
    pub paused: bool,
    /// Item was last shown with a video surface.
    #[serde(default)]
    pub video: bool,
    /// Play audio only even if the item has video.
    #[serde(default)]
    pub force_audio: bool,
}

/// Identity of a P2P-backed item inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct P2pSource {
    /// Content id or infohash understood by the P2P engine.
    pub content_id: String,
    /// File index inside a multi-file transport.
    #[serde(default)]
    pub file_index: Option<u32>,
}

/// One playlist entry.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MediaItem {
    pub id: String,
    pub location: String,
    #[serde(default)]
    pub title: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub flags: MediaFlags,
    #[serde(default)]
    pub p2p: Option<P2pSource>,
    /// Resolved URL for the current P2P session. Never persisted.
    #[serde(skip)]
    pub playback_url: Option<String>,
    #[serde(default)]
    pub time_ms: i64,
    #[serde(default)]
    pub length_ms: i64,
    #[serde(default)]
    pub seen: u32,
    #[serde(default)]
    pub audio_delay_us: i64,
    #[serde(default)]
    pub subtitle_delay_us: i64,
    #[serde(default = "default_subtitle_track")]
    pub subtitle_track: i32,
}

fn default_subtitle_track() -> i32 {
    -1
}

impl MediaItem {
    pub fn new(location: impl Into<String>, kind: MediaKind) -> Self {
        let location = location.into();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title_from_location(&location),
            location,
            kind,
            flags: MediaFlags::default(),
            p2p: None,
            playback_url: None,
            time_ms: 0,
            length_ms: 0,
            seen: 0,
            audio_delay_us: 0,
            subtitle_delay_us: 0,
            subtitle_track: default_subtitle_track(),
        }
    }

    /// Builds an item for a P2P transport file.
    pub fn p2p(
        location: impl Into<String>,
        kind: MediaKind,
        content_id: impl Into<String>,
        file_index: Option<u32>,
    ) -> Self {
        let mut item = Self::new(location, kind);
        item.p2p = Some(P2pSource {
            content_id: content_id.into(),
            file_index,
        });
        item
    }

    pub fn is_p2p(&self) -> bool {
        self.p2p.is_some()
    }

    /// File index hint for the P2P engine.
    ///
    /// Uses the explicit source index, falling back to the `index` query
    /// parameter of the location.
    pub fn p2p_file_index(&self) -> Option<u32> {
        let source = self.p2p.as_ref()?;
        if let Some(index) = source.file_index {
            return Some(index);
        }
        query_parameter(&self.location, "index").and_then(|value| value.parse().ok())
    }

    /// URL handed to the player: the P2P session URL when one is active.
    pub fn playable_location(&self) -> &str {
        self.playback_url.as_deref().unwrap_or(&self.location)
    }

    pub fn is_persistable(&self) -> bool {
        !self.location.starts_with(TRANSIENT_P2P_LOCATION_PREFIX)
    }
}

fn title_from_location(location: &str) -> String {
    location
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .map(|segment| segment.split('?').next().unwrap_or(segment))
        .filter(|segment| !segment.is_empty())
        .unwrap_or(location)
        .to_string()
}

fn query_parameter<'a>(location: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = location.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Checks that a user-supplied location looks playable before building an item.
pub fn validate_location(location: &str) -> bool {
    let location = location.trim();
    if location.is_empty() {
        return false;
    }
    if location.starts_with('/') {
        return true;
    }
    match location.split_once(':') {
        Some((scheme, rest)) => {
            !rest.is_empty()
                && scheme.len() > 1
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Structural change reported by every `MediaList` mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaListEvent {
    ItemAdded { index: usize },
    ItemRemoved { index: usize },
    ItemMoved { from: usize, to: usize },
}

/// Ordered, mutable media sequence.
#[derive(Debug, Clone, Default)]
pub struct MediaList {
    items: Vec<MediaItem>,
}

impl MediaList {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MediaItem> {
        self.items.get_mut(index)
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn add(&mut self, item: MediaItem) -> MediaListEvent {
        self.items.push(item);
        MediaListEvent::ItemAdded {
            index: self.items.len() - 1,
        }
    }

    /// Inserts at `index`, clamped to the end of the list.
    pub fn insert(&mut self, index: usize, item: MediaItem) -> MediaListEvent {
        let index = index.min(self.items.len());
        self.items.insert(index, item);
        MediaListEvent::ItemAdded { index }
    }

    pub fn remove(&mut self, index: usize) -> Option<(MediaItem, MediaListEvent)> {
        if index >= self.items.len() {
            return None;
        }
        let item = self.items.remove(index);
        Some((item, MediaListEvent::ItemRemoved { index }))
    }

    /// Removes every item with the given location, reporting one event per item.
    pub fn remove_location(&mut self, location: &str) -> Vec<MediaListEvent> {
        let mut events = Vec::new();
        let mut index = 0;
        while index < self.items.len() {
            if self.items[index].location == location {
                self.items.remove(index);
                events.push(MediaListEvent::ItemRemoved { index });
            } else {
                index += 1;
            }
        }
        events
    }

    /// Moves the item at `from` so that it ends up at `to`.
    pub fn move_item(&mut self, from: usize, to: usize) -> Option<MediaListEvent> {
        if from >= self.items.len() || to >= self.items.len() || from == to {
            return None;
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        Some(MediaListEvent::ItemMoved { from, to })
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// A list is an audio list when it is non-empty and holds only audio items.
    pub fn is_audio_list(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.kind == MediaKind::Audio)
    }

    pub fn location(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(|item| item.location.as_str())
    }

    pub fn find_position_by_file_index(&self, file_index: u32) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.p2p_file_index() == Some(file_index))
    }

    /// Drops session URLs for every P2P item except the one at `keep`.
    pub fn reset_p2p_items(&mut self, keep: Option<usize>) {
        for (index, item) in self.items.iter_mut().enumerate() {
            if item.is_p2p() && Some(index) != keep {
                item.playback_url = None;
            }
        }
    }
}
