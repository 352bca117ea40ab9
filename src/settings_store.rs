//! Durable key-value settings store backed by SQLite.
//!
//! Saved playlists and playback positions live here, one slot per
//! [`ListKind`]. Values are stored as text; list payloads are JSON. All
//! access goes through one connection behind a mutex, and the compound
//! saved-position record is written in a single transaction.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::media::{ListKind, MediaItem};
use crate::protocol::RepeatMode;

const VIDEO_PAUSED_KEY: &str = "video_paused";
const VIDEO_SPEED_KEY: &str = "video_speed";
const AUDIO_REPEAT_MODE_KEY: &str = "audio_repeat_mode";

/// Settings keys of one saved list slot.
struct ListKeys {
    list: &'static str,
    shuffling: &'static str,
    repeating: &'static str,
    position: &'static str,
    time: &'static str,
    current: &'static str,
}

fn list_keys(kind: ListKind) -> ListKeys {
    match kind {
        ListKind::Audio => ListKeys {
            list: "audio_list",
            shuffling: "audio_shuffling",
            repeating: "audio_repeating",
            position: "position_in_audio_list",
            time: "position_in_song",
            current: "current_song",
        },
        ListKind::Media => ListKeys {
            list: "media_list",
            shuffling: "media_shuffling",
            repeating: "media_repeating",
            position: "position_in_media_list",
            time: "position_in_media",
            current: "current_media",
        },
    }
}

/// Persisted snapshot of playback position for one list slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedPosition {
    pub shuffle: bool,
    pub repeat_mode: RepeatMode,
    pub index: usize,
    /// Elapsed time in milliseconds, `-1` when unknown.
    pub time_ms: i64,
    /// Playback rate. Only kept for media lists.
    pub rate: f32,
    /// Paused flag. Only kept for media lists.
    pub paused: bool,
}

impl Default for SavedPosition {
    fn default() -> Self {
        Self {
            shuffle: false,
            repeat_mode: RepeatMode::None,
            index: 0,
            time_ms: -1,
            rate: 1.0,
            paused: false,
        }
    }
}

/// Shared handle to the settings database.
#[derive(Clone)]
pub struct SettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SettingsStore {
    /// Opens the store in the user's data directory.
    pub fn new() -> Result<Self, StoreError> {
        let data_dir = dirs::data_dir()
            .ok_or(StoreError::NoDataDir)?
            .join("castqueue");
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir)?;
        }
        Self::open(&data_dir.join("settings.db"))
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        debug!("SettingsStore: opening {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        put(&conn, key, value)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_string(key)?.is_some())
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get_string(key)? else {
            return Ok(None);
        };
        match raw.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!("SettingsStore: ignoring malformed value for '{}': {}", key, raw);
                Ok(None)
            }
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.get_parsed(key)
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.get_parsed(key)
    }

    pub fn get_f32(&self, key: &str) -> Result<Option<f32>, StoreError> {
        self.get_parsed(key)
    }

    /// Saves the persistable items of `items` as the list of `kind`.
    pub fn save_media_list(&self, kind: ListKind, items: &[MediaItem]) -> Result<(), StoreError> {
        let keys = list_keys(kind);
        let persisted: Vec<&MediaItem> = items.iter().filter(|item| item.is_persistable()).collect();
        let payload = serde_json::to_string(&persisted).map_err(|source| StoreError::Payload {
            key: keys.list.to_string(),
            source,
        })?;
        self.put_string(keys.list, &payload)
    }

    /// Loads the saved list of `kind`. `Ok(None)` when nothing (or an empty
    /// list) was saved.
    pub fn load_media_list(&self, kind: ListKind) -> Result<Option<Vec<MediaItem>>, StoreError> {
        let keys = list_keys(kind);
        let Some(payload) = self.get_string(keys.list)? else {
            return Ok(None);
        };
        let items: Vec<MediaItem> =
            serde_json::from_str(&payload).map_err(|source| StoreError::Payload {
                key: keys.list.to_string(),
                source,
            })?;
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(items))
    }

    pub fn has_last_playlist(&self) -> Result<bool, StoreError> {
        self.contains(list_keys(ListKind::Media).list)
    }

    /// Writes every field of the saved-position record atomically.
    pub fn save_position(&self, kind: ListKind, position: &SavedPosition) -> Result<(), StoreError> {
        let keys = list_keys(kind);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        put(&tx, keys.shuffling, &position.shuffle.to_string())?;
        put(&tx, keys.repeating, &position.repeat_mode.as_code().to_string())?;
        put(&tx, keys.position, &position.index.to_string())?;
        put(&tx, keys.time, &position.time_ms.to_string())?;
        if kind == ListKind::Media {
            put(&tx, VIDEO_PAUSED_KEY, &position.paused.to_string())?;
            put(&tx, VIDEO_SPEED_KEY, &position.rate.to_string())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads the saved-position record, defaulting every missing field.
    pub fn load_position(&self, kind: ListKind) -> Result<SavedPosition, StoreError> {
        let keys = list_keys(kind);
        let defaults = SavedPosition::default();
        let mut position = SavedPosition {
            shuffle: self.get_bool(keys.shuffling)?.unwrap_or(defaults.shuffle),
            repeat_mode: self
                .get_i64(keys.repeating)?
                .map(RepeatMode::from_code)
                .unwrap_or(defaults.repeat_mode),
            index: self
                .get_i64(keys.position)?
                .and_then(|index| usize::try_from(index).ok())
                .unwrap_or(defaults.index),
            time_ms: self.get_i64(keys.time)?.unwrap_or(defaults.time_ms),
            ..defaults
        };
        if kind == ListKind::Media {
            position.paused = self.get_bool(VIDEO_PAUSED_KEY)?.unwrap_or(defaults.paused);
            position.rate = self.get_f32(VIDEO_SPEED_KEY)?.unwrap_or(defaults.rate);
        }
        Ok(position)
    }

    pub fn save_current_media(&self, kind: ListKind, location: &str) -> Result<(), StoreError> {
        self.put_string(list_keys(kind).current, location)
    }

    #[cfg(test)]
    pub fn current_media(&self, kind: ListKind) -> Result<Option<String>, StoreError> {
        self.get_string(list_keys(kind).current)
    }

    pub fn save_audio_repeat_mode(&self, repeat_mode: RepeatMode) -> Result<(), StoreError> {
        self.put_string(AUDIO_REPEAT_MODE_KEY, &repeat_mode.as_code().to_string())
    }

    pub fn audio_repeat_mode(&self) -> Result<Option<RepeatMode>, StoreError> {
        Ok(self.get_i64(AUDIO_REPEAT_MODE_KEY)?.map(RepeatMode::from_code))
    }
}

fn put(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, TRANSIENT_P2P_LOCATION_PREFIX};

    #[test]
    fn test_missing_position_keys_fall_back_to_defaults() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        let position = store
            .load_position(ListKind::Audio)
            .expect("load should succeed");
        assert_eq!(position, SavedPosition::default());
        assert_eq!(position.time_ms, -1);
        assert_eq!(position.repeat_mode, RepeatMode::None);
    }

    #[test]
    fn test_position_record_is_kept_per_list_kind() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        let media = SavedPosition {
            shuffle: true,
            repeat_mode: RepeatMode::All,
            index: 3,
            time_ms: 42_000,
            rate: 1.5,
            paused: true,
        };
        store
            .save_position(ListKind::Media, &media)
            .expect("save should succeed");

        assert_eq!(
            store.load_position(ListKind::Media).expect("load should succeed"),
            media
        );
        assert_eq!(
            store.load_position(ListKind::Audio).expect("load should succeed"),
            SavedPosition::default()
        );
    }

    #[test]
    fn test_audio_position_does_not_store_rate_or_paused() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        let audio = SavedPosition {
            shuffle: false,
            repeat_mode: RepeatMode::One,
            index: 1,
            time_ms: 10,
            rate: 2.0,
            paused: true,
        };
        store
            .save_position(ListKind::Audio, &audio)
            .expect("save should succeed");
        let loaded = store
            .load_position(ListKind::Audio)
            .expect("load should succeed");
        assert_eq!(loaded.repeat_mode, RepeatMode::One);
        assert_eq!(loaded.rate, 1.0);
        assert!(!loaded.paused);
        assert!(!store.contains(VIDEO_SPEED_KEY).expect("contains should succeed"));
    }

    #[test]
    fn test_media_list_round_trip_skips_transient_items() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        let items = vec![
            MediaItem::new("/music/a.mp3", MediaKind::Audio),
            MediaItem::new(
                format!("{TRANSIENT_P2P_LOCATION_PREFIX}x"),
                MediaKind::Video,
            ),
            MediaItem::new("/music/b.mp3", MediaKind::Audio),
        ];
        store
            .save_media_list(ListKind::Audio, &items)
            .expect("save should succeed");
        let loaded = store
            .load_media_list(ListKind::Audio)
            .expect("load should succeed")
            .expect("list should exist");
        let locations: Vec<_> = loaded.iter().map(|item| item.location.as_str()).collect();
        assert_eq!(locations, vec!["/music/a.mp3", "/music/b.mp3"]);
        assert!(store
            .load_media_list(ListKind::Media)
            .expect("load should succeed")
            .is_none());
    }

    #[test]
    fn test_corrupt_media_list_is_reported_as_payload_error() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        store
            .put_string("media_list", "{not json")
            .expect("put should succeed");
        let result = store.load_media_list(ListKind::Media);
        assert!(matches!(result, Err(StoreError::Payload { .. })));
    }

    #[test]
    fn test_malformed_scalar_is_treated_as_missing() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        store
            .put_string("position_in_media_list", "three")
            .expect("put should succeed");
        let position = store
            .load_position(ListKind::Media)
            .expect("load should succeed");
        assert_eq!(position.index, 0);
    }

    #[test]
    fn test_put_string_overwrites_existing_value() {
        let store = SettingsStore::new_in_memory().expect("failed to create in-memory store");
        store.put_string("k", "1").expect("put should succeed");
        store.put_string("k", "2").expect("put should succeed");
        assert_eq!(
            store.get_string("k").expect("get should succeed"),
            Some("2".to_string())
        );
    }
}
