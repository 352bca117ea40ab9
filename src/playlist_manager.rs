use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::config::PlaybackConfig;
use crate::error::StoreError;
use crate::media::{validate_location, ListKind, MediaItem, MediaKind, MediaList, MediaListEvent};
use crate::navigation::Navigator;
use crate::p2p::{P2pEngine, P2pSessionEvents, P2pSessionRequest};
use crate::player::PlayerController;
use crate::protocol::{
    Message, Notice, P2pMessage, PlaybackState, PlayerEvent, PlaylistMessage, PlaylistSnapshot,
    RendererMessage, RepeatMode, StopOptions,
};
use crate::renderer_registry::{RendererKind, RendererRegistry};
use crate::settings_store::{SavedPosition, SettingsStore};
use crate::update_coalescer::UpdateCoalescer;

/// Share of an item that must have played for it to count as seen.
const SEEN_PROGRESS_RATIO: f32 = 0.95;
/// Remaining time under which an item counts as seen.
const SEEN_REMAINING_MS: i64 = 10_000;
/// A saved resume time is only honored below this share of the length.
const RESUME_MAX_RATIO: f64 = 0.95;

#[derive(Debug, Clone)]
struct PendingSession {
    item_id: String,
    replay_on_start: bool,
}

pub struct PlaylistManager {
    media_list: MediaList,
    navigator: Navigator,
    current_index: Option<usize>,
    state: PlaybackState,
    player: Box<dyn PlayerController>,
    p2p_engine: Box<dyn P2pEngine>,
    settings: SettingsStore,
    renderers: RendererRegistry,
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    updates: UpdateCoalescer,
    config: PlaybackConfig,
    saved_time_ms: i64,
    new_media: bool,
    expanding: bool,
    video_background: bool,
    loading_last_playlist: bool,
    pending_session: Option<PendingSession>,
}

impl PlaylistManager {
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        player: Box<dyn PlayerController>,
        p2p_engine: Box<dyn P2pEngine>,
        settings: SettingsStore,
        renderers: RendererRegistry,
        config: PlaybackConfig,
    ) -> Self {
        let mut navigator = Navigator::new();
        if config.save_audio_repeat {
            match settings.audio_repeat_mode() {
                Ok(Some(repeat_mode)) => {
                    navigator.set_repeat_mode(repeat_mode);
                }
                Ok(None) => {}
                Err(err) => warn!("PlaylistManager: failed to read audio repeat mode: {}", err),
            }
        }

        Self {
            media_list: MediaList::new(),
            navigator,
            current_index: None,
            state: PlaybackState::Idle,
            player,
            p2p_engine,
            settings,
            renderers,
            updates: UpdateCoalescer::new(bus_producer.clone()),
            bus_consumer,
            bus_producer,
            config,
            saved_time_ms: 0,
            new_media: false,
            expanding: false,
            video_background: false,
            loading_last_playlist: false,
            pending_session: None,
        }
    }

    pub fn has_media(&self) -> bool {
        !self.media_list.is_empty()
    }

    pub fn has_current_media(&self) -> bool {
        self.current_index.is_some_and(|index| self.is_valid_position(index))
    }

    pub fn has_playlist(&self) -> bool {
        self.media_list.len() > 1
    }

    pub fn can_shuffle(&self) -> bool {
        self.media_list.len() > 2
    }

    pub fn has_next(&self) -> bool {
        self.navigator.next().is_some()
    }

    pub fn has_previous(&self) -> bool {
        self.navigator.prev().is_some()
    }

    fn is_valid_position(&self, position: usize) -> bool {
        position < self.media_list.len()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn next_index(&self) -> Option<usize> {
        self.navigator.next()
    }

    pub fn prev_index(&self) -> Option<usize> {
        self.navigator.prev()
    }

    pub fn shuffle(&self) -> bool {
        self.navigator.shuffle()
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.navigator.repeat_mode()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_media(&self) -> Option<&MediaItem> {
        self.media_list.get(self.current_index?)
    }

    pub fn next_media(&self) -> Option<&MediaItem> {
        self.media_list.get(self.navigator.next()?)
    }

    pub fn prev_media(&self) -> Option<&MediaItem> {
        self.media_list.get(self.navigator.prev()?)
    }

    pub fn media(&self, position: usize) -> Option<&MediaItem> {
        self.media_list.get(position)
    }

    pub fn media_list(&self) -> &[MediaItem] {
        self.media_list.items()
    }

    pub fn media_list_size(&self) -> usize {
        self.media_list.len()
    }

    pub fn is_audio_list(&self) -> bool {
        !self.player.can_switch_to_video() && self.media_list.is_audio_list()
    }

    fn list_kind(&self) -> ListKind {
        if self.is_audio_list() {
            ListKind::Audio
        } else {
            ListKind::Media
        }
    }

    pub fn find_position_by_file_index(&self, file_index: u32) -> Option<usize> {
        self.media_list.find_position_by_file_index(file_index)
    }

    pub fn update_current_index(&mut self, index: Option<usize>) {
        self.current_index = index;
        self.determine_indices(false);
    }

    pub fn has_last_playlist(&self) -> bool {
        self.settings.has_last_playlist().unwrap_or_else(|err| {
            warn!("PlaylistManager: failed to query saved playlist: {}", err);
            false
        })
    }

    pub fn load_locations(&mut self, locations: Vec<String>, position: usize, start: bool) {
        let mut items = Vec::with_capacity(locations.len());
        for location in locations {
            if !validate_location(&location) {
                warn!("PlaylistManager: invalid location {}", location);
                self.notify(Notice::InvalidLocation(location));
                continue;
            }
            trace!("PlaylistManager: creating on-the-fly item for {}", location);
            let kind = MediaKind::from_location(&location);
            items.push(MediaItem::new(location, kind));
        }
        self.load(items, position, start);
    }

    /// Replaces the playlist. An out-of-range `position` starts at 0.
    pub fn load(&mut self, items: Vec<MediaItem>, position: usize, start: bool) {
        self.media_list.clear();
        self.navigator.clear_history();
        for item in items {
            self.media_list.add(item);
        }
        if !self.has_media() {
            warn!("PlaylistManager: empty media list, nothing to play");
            return;
        }

        self.current_index = Some(if self.is_valid_position(position) {
            position
        } else {
            0
        });
        if start {
            self.play_index(position);
        }
        self.on_playlist_loaded();
    }

    fn on_playlist_loaded(&mut self) {
        self.publish(PlaylistMessage::PlaylistLoaded {
            size: self.media_list.len(),
            current_index: self.current_index,
        });
        self.determine_indices(false);
        self.submit_update();
    }

    pub fn get_last_playlist(&self, kind: ListKind) -> Option<Vec<MediaItem>> {
        match self.settings.load_media_list(kind) {
            Ok(Some(items)) => Some(items),
            Ok(None) => {
                trace!("PlaylistManager: no saved {:?} playlist", kind);
                None
            }
            Err(err @ StoreError::Payload { .. }) => {
                error!("PlaylistManager: failed to load last playlist: {}", err);
                self.notify(Notice::LastPlaylistLoadFailed);
                None
            }
            Err(err) => {
                error!("PlaylistManager: failed to read last playlist: {}", err);
                None
            }
        }
    }

    pub fn load_last_playlist(&mut self, kind: ListKind) {
        debug!(
            "PlaylistManager: load last playlist kind={:?} loading={}",
            kind, self.loading_last_playlist
        );
        if self.loading_last_playlist {
            return;
        }
        self.loading_last_playlist = true;

        let Some(mut items) = self.get_last_playlist(kind) else {
            self.loading_last_playlist = false;
            return;
        };
        info!("PlaylistManager: restoring {} saved item(s)", items.len());

        let saved = self.settings.load_position(kind).unwrap_or_else(|err| {
            warn!("PlaylistManager: failed to read saved position: {}", err);
            SavedPosition::default()
        });
        self.navigator.set_shuffle(saved.shuffle);
        self.navigator.set_repeat_mode(saved.repeat_mode);
        self.saved_time_ms = saved.time_ms;
        if kind == ListKind::Media {
            if saved.paused {
                if let Some(item) = items.get_mut(saved.index) {
                    item.flags.paused = true;
                }
            }
            if saved.rate != 1.0 {
                self.player.set_rate(saved.rate);
            }
        }

        self.load(items, saved.index, true);
        self.loading_last_playlist = false;
    }

    pub fn play(&mut self) {
        if self.has_media() {
            self.player.play();
        }
    }

    pub fn pause(&mut self) {
        if self.player.pause() {
            self.save_position(false);
        }
    }

    pub fn next(&mut self) {
        if let Some(index) = self.advance() {
            self.play_index(index);
        }
    }

    // Stops playback when there is no next item.
    fn advance(&mut self) -> Option<usize> {
        let size = self.media_list.len();
        if let Some(current) = self.current_index.filter(|index| *index < size) {
            self.navigator.push_history(current);
        }
        if self.has_current_media() {
            trace!("PlaylistManager: saving meta before next, current={:?}", self.current_index);
            self.save_media_meta();
        }

        self.current_index = self.navigator.next();
        let Some(index) = self.current_index.filter(|index| *index < size) else {
            warn!("PlaylistManager: invalid next index, aborted");
            self.publish(PlaylistMessage::ExitPlayer);
            self.stop(StopOptions::default());
            return None;
        };
        self.navigator.forget(index);
        self.video_background = !self.player.is_video_playing() && self.player.can_switch_to_video();
        Some(index)
    }

    /// Navigates back, or restarts the current item once it played past the
    /// configured limit (unless forced or not seekable).
    pub fn previous(&mut self, force: bool) {
        let seekable = self.player.is_seekable();
        let time_ms = self.player.time_ms();
        debug!(
            "PlaylistManager: previous has_previous={} current={:?} force={} seekable={} time={}",
            self.has_previous(),
            self.current_index,
            force,
            seekable,
            time_ms
        );

        let within_limit = time_ms < self.config.previous_limit_delay_ms;
        if !(self.has_previous() && (force || !seekable || within_limit)) {
            self.player.set_position(0.0);
            return;
        }

        let size = self.media_list.len();
        if self.has_current_media() {
            self.save_media_meta();
        }
        self.current_index = self.navigator.prev();
        let Some(index) = self.current_index.filter(|index| *index < size) else {
            warn!("PlaylistManager: invalid previous index, aborted");
            self.player.stop();
            return;
        };
        self.navigator.forget(index);
        self.play_index(index);
    }

    pub fn stop(&mut self, options: StopOptions) {
        debug!("PlaylistManager: stop {:?}", options);
        if options.save_metadata && self.has_current_media() {
            self.save_position(false);
            self.save_media_meta();
            self.save_media_list();
        }
        self.player.release_media();

        if !options.keep_renderer && !self.renderers.is_global_selection() {
            self.renderers.restore_renderer(false);
        }

        if options.clear_playlist {
            self.navigator.clear_history();
            self.current_index = None;
            self.media_list.clear();
            self.pending_session = None;
            self.p2p_engine.stop_session();
            self.navigator.determine(None, 0);
            self.submit_update();
        }

        if options.system_exit {
            self.player.release();
        } else {
            self.player.restart();
        }
        self.set_state(if options.clear_playlist {
            PlaybackState::Idle
        } else {
            PlaybackState::Stopped
        });
        self.publish(PlaylistMessage::PlaybackStopped);
    }

    pub fn toggle_shuffle(&mut self) {
        let shuffle = !self.navigator.shuffle();
        self.set_shuffle(shuffle);
    }

    pub fn set_shuffle(&mut self, shuffle: bool) {
        if !self.navigator.set_shuffle(shuffle) {
            return;
        }
        self.save_position(false);
        self.determine_indices(false);
    }

    pub fn set_repeat_mode(&mut self, repeat_mode: RepeatMode) {
        if !self.navigator.set_repeat_mode(repeat_mode) {
            return;
        }
        if self.is_audio_list() && self.config.save_audio_repeat {
            if let Err(err) = self.settings.save_audio_repeat_mode(repeat_mode) {
                error!("PlaylistManager: failed to persist audio repeat mode: {}", err);
            }
        }
        self.save_position(false);
        self.determine_indices(false);
    }

    pub fn play_index(&mut self, index: usize) {
        self.play_index_with(index, false);
    }

    pub fn play_index_with(&mut self, index: usize, from_start: bool) {
        let mut index = index;
        // At most one pass over the list.
        for _ in 0..self.media_list.len().max(1) {
            let Some((position, item)) = self.prepare_item(index) else {
                return;
            };
            if !(item.flags.force_audio && self.player.audio_tracks_count() == 0) {
                self.start_item(position, item, from_start);
                return;
            }
            debug!("PlaylistManager: forced audio without audio track, skipping");
            self.determine_indices(true);
            if self.navigator.next() == self.current_index {
                break;
            }
            match self.advance() {
                Some(next) => index = next,
                None => return,
            }
        }
        warn!("PlaylistManager: no playable audio left, stopping");
        self.stop(StopOptions::default());
    }

    fn prepare_item(&mut self, index: usize) -> Option<(usize, MediaItem)> {
        if self.media_list.is_empty() {
            warn!("PlaylistManager: empty media list, nothing to play");
            return None;
        }
        let index = if self.is_valid_position(index) {
            index
        } else {
            warn!("PlaylistManager: index {} out of bounds", index);
            0
        };
        self.current_index = Some(index);
        self.media_list.reset_p2p_items(Some(index));

        let is_video_playing = self
            .media_list
            .get(index)
            .is_some_and(|item| item.kind == MediaKind::Video)
            && self.player.is_video_playing();
        let video_background = self.video_background;
        let item = self.media_list.get_mut(index)?;
        if !video_background && is_video_playing {
            item.flags.video = true;
        }
        if video_background {
            item.flags.force_audio = true;
        }
        let item = item.clone();
        debug!(
            "PlaylistManager: play index={} p2p={} location={} playback_url={:?}",
            index,
            item.is_p2p(),
            item.location,
            item.playback_url
        );

        self.set_state(PlaybackState::Loading);
        let selected = self.renderers.selected_renderer();
        self.player.set_renderer(selected.as_ref());
        Some((index, item))
    }

    fn start_item(&mut self, index: usize, item: MediaItem, from_start: bool) {
        if item.is_p2p() && item.playback_url.is_none() {
            self.start_p2p_playback(index, &item, from_start);
            return;
        }

        let selected = self.renderers.selected_renderer();
        if let Some(device) = selected.filter(|renderer| {
            renderer.kind == RendererKind::P2pDevice { ace_cast: false }
        }) {
            if !item.is_p2p() {
                let Some(cast_renderer) = self.renderers.find_by_address(&device.address, false)
                else {
                    error!(
                        "PlaylistManager: no cast renderer at {} to switch back to",
                        device.address
                    );
                    self.notify(Notice::InternalError);
                    return;
                };
                debug!(
                    "PlaylistManager: switching from {} to cast renderer {}",
                    device, cast_renderer
                );
                self.player.set_renderer(Some(&cast_renderer));
                self.renderers.select_renderer(false, Some(cast_renderer), false);
            }
        }

        trace!("PlaylistManager: start item at {}", item.playable_location());
        self.player.start_playback(&item);
        self.playback_post_init(index);
    }

    fn start_p2p_playback(&mut self, index: usize, item: &MediaItem, from_start: bool) {
        let Some(source) = item.p2p.clone() else {
            return;
        };

        let remote_selected = self
            .renderers
            .selected_renderer()
            .is_some_and(|renderer| renderer.is_p2p_device());
        if !remote_selected {
            if let Some(url) = self.p2p_engine.active_session_url(&source) {
                debug!("PlaylistManager: reusing active p2p session for {}", item.id);
                if let Some(entry) = self.media_list.get_mut(index) {
                    entry.playback_url = Some(url);
                }
                self.play_index_with(index, from_start);
                return;
            }
        }

        self.determine_indices(false);
        let _ = self.bus_producer.send(Message::P2p(P2pMessage::SessionStarting {
            item_id: item.id.clone(),
        }));

        let next_file_indexes: Vec<u32> = self
            .next_media()
            .filter(|next| next.is_p2p())
            .and_then(MediaItem::p2p_file_index)
            .into_iter()
            .collect();

        if let Some(cast_renderer) = self
            .renderers
            .selected_renderer()
            .filter(|renderer| renderer.kind == RendererKind::Cast)
        {
            let Some(device) = self.renderers.find_by_address(&cast_renderer.address, true) else {
                error!(
                    "PlaylistManager: no p2p device at {} for {}",
                    cast_renderer.address, cast_renderer
                );
                self.notify(Notice::InternalError);
                return;
            };
            debug!(
                "PlaylistManager: switching from {} to p2p device {}",
                cast_renderer, device
            );
            self.player.set_renderer(Some(&device));
            self.renderers.select_renderer(false, Some(device), false);
        }

        if let Some(device) = self
            .renderers
            .selected_renderer()
            .filter(|renderer| renderer.is_p2p_device())
        {
            debug!(
                "PlaylistManager: handing item {} to remote device {} from_start={}",
                item.id, device, from_start
            );
            self.player.stop();
            self.playback_post_init(index);
            self.publish(PlaylistMessage::RemotePlaybackRequested {
                index,
                renderer_id: device.id,
                from_start,
            });
            return;
        }

        debug!("PlaylistManager: starting local p2p session for {}", item.id);
        self.pending_session = Some(PendingSession {
            item_id: item.id.clone(),
            replay_on_start: true,
        });
        let request = P2pSessionRequest {
            item_id: item.id.clone(),
            source,
            next_file_indexes,
            stream_index: None,
        };
        let events = P2pSessionEvents::new(item.id.clone(), Some(index), self.bus_producer.clone());
        if let Err(err) = self.p2p_engine.start_session(request, events) {
            error!("PlaylistManager: failed to start engine session: {}", err);
            self.pending_session = None;
            let _ = self.bus_producer.send(Message::P2p(P2pMessage::SessionFailed {
                item_id: item.id.clone(),
                message: err.to_string(),
            }));
        }
    }

    pub fn switch_stream(&mut self, stream_index: i32) {
        let Some(index) = self.current_index.filter(|index| self.is_valid_position(*index)) else {
            return;
        };
        let time_ms = self.player.time_ms();
        let next_file_indexes: Vec<u32> = self
            .next_media()
            .and_then(MediaItem::p2p_file_index)
            .into_iter()
            .collect();
        let Some(item) = self.media_list.get_mut(index) else {
            return;
        };
        let Some(source) = item.p2p.clone() else {
            warn!("PlaylistManager: cannot switch stream of non-p2p item {}", item.id);
            return;
        };
        item.time_ms = time_ms;
        let item_id = item.id.clone();
        self.saved_time_ms = time_ms;

        let _ = self.bus_producer.send(Message::P2p(P2pMessage::SessionStarting {
            item_id: item_id.clone(),
        }));
        self.pending_session = Some(PendingSession {
            item_id: item_id.clone(),
            replay_on_start: false,
        });
        let request = P2pSessionRequest {
            item_id: item_id.clone(),
            source,
            next_file_indexes,
            stream_index: Some(stream_index),
        };
        let events = P2pSessionEvents::new(item_id.clone(), Some(index), self.bus_producer.clone());
        if let Err(err) = self.p2p_engine.start_session(request, events) {
            error!("PlaylistManager: failed to switch stream: {}", err);
            self.pending_session = None;
            let _ = self.bus_producer.send(Message::P2p(P2pMessage::SessionFailed {
                item_id,
                message: err.to_string(),
            }));
        }
    }

    fn playback_post_init(&mut self, index: usize) {
        self.determine_indices(false);
        if let Some(item) = self.media_list.get(index) {
            let item_id = item.id.clone();
            self.publish(PlaylistMessage::NewPlayback { index, item_id });
        }
        self.save_current_media();
        self.save_media_list();
        self.new_media = true;
    }

    pub fn on_service_destroyed(&mut self) {
        self.media_list.reset_p2p_items(None);
        self.player.release();
    }

    pub fn append(&mut self, items: Vec<MediaItem>) {
        if !self.has_current_media() {
            self.load(items, 0, true);
            return;
        }
        let events: Vec<_> = items
            .into_iter()
            .map(|item| self.media_list.add(item))
            .collect();
        self.on_list_events(&events);
    }

    pub fn insert_next(&mut self, items: Vec<MediaItem>) {
        let Some(current) = self.current_index.filter(|index| self.is_valid_position(*index))
        else {
            self.load(items, 0, true);
            return;
        };
        let start = current + 1;
        let events: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(offset, item)| self.media_list.insert(start + offset, item))
            .collect();
        self.on_list_events(&events);
    }

    pub fn insert_item(&mut self, position: usize, item: MediaItem) {
        let event = self.media_list.insert(position, item);
        self.on_list_events(&[event]);
    }

    pub fn move_item(&mut self, from: usize, to: usize) {
        match self.media_list.move_item(from, to) {
            Some(event) => self.on_list_events(&[event]),
            None => debug!("PlaylistManager: ignoring move {} -> {}", from, to),
        }
    }

    pub fn remove(&mut self, position: usize) {
        match self.media_list.remove(position) {
            Some((_, event)) => self.on_list_events(&[event]),
            None => warn!("PlaylistManager: cannot remove index {}", position),
        }
    }

    pub fn remove_location(&mut self, location: &str) {
        let events = self.media_list.remove_location(location);
        self.on_list_events(&events);
    }

    // One cursor refresh, update and save per batch.
    fn on_list_events(&mut self, events: &[MediaListEvent]) {
        if events.is_empty() {
            return;
        }
        trace!("PlaylistManager: {} list event(s)", events.len());
        let mut current_removed = false;
        let mut reordered = false;
        for event in events {
            let Some(current) = self.current_index else {
                reordered |= matches!(event, MediaListEvent::ItemMoved { .. });
                continue;
            };
            match *event {
                MediaListEvent::ItemAdded { index } => {
                    if current >= index && !self.expanding {
                        self.current_index = Some(current + 1);
                    }
                }
                MediaListEvent::ItemRemoved { index } => {
                    current_removed |= current == index;
                    if current >= index && !self.expanding {
                        self.current_index = current.checked_sub(1);
                    }
                }
                MediaListEvent::ItemMoved { from, to } => {
                    reordered = true;
                    self.current_index = Some(if current == from {
                        to
                    } else if from < current && current <= to {
                        current - 1
                    } else if to <= current && current < from {
                        current + 1
                    } else {
                        current
                    });
                }
            }
        }
        // Visited entries no longer point at the same items.
        if reordered {
            self.navigator.clear_history();
        }
        self.determine_indices(false);
        if current_removed && !self.expanding {
            if self.navigator.next().is_some() {
                self.next();
            } else if let Some(current) = self.current_index {
                self.play_index(current);
            } else {
                self.stop(StopOptions::default());
            }
        }
        self.submit_update();
        self.save_media_list();
    }

    fn determine_indices(&mut self, expand: bool) {
        let expanded = if expand && self.has_current_media() {
            self.expanding = true;
            let expanded = self.expand_current();
            self.expanding = false;
            expanded
        } else {
            None
        };

        match expanded {
            Some(index) => self.navigator.set_next(Some(index)),
            None => {
                self.navigator
                    .determine(self.current_index, self.media_list.len());
            }
        }
        self.publish(PlaylistMessage::IndicesChanged {
            current_index: self.current_index,
            next_index: self.navigator.next(),
            prev_index: self.navigator.prev(),
            shuffle: self.navigator.shuffle(),
            repeat_mode: self.navigator.repeat_mode(),
        });
    }

    fn expand_current(&mut self) -> Option<usize> {
        let index = self.current_index?;
        let children = self.player.expand()?;
        if children.is_empty() {
            return None;
        }
        debug!(
            "PlaylistManager: expanding index {} into {} item(s)",
            index,
            children.len()
        );
        let mut events = Vec::with_capacity(children.len() + 1);
        if let Some((_, event)) = self.media_list.remove(index) {
            events.push(event);
        }
        for child in children.into_iter().rev() {
            events.push(self.media_list.insert(index, child));
        }
        self.on_list_events(&events);
        Some(index)
    }

    pub fn save_media_meta(&mut self) {
        let Some(index) = self.current_index.filter(|index| self.is_valid_position(*index)) else {
            return;
        };
        let can_switch_to_video = self.player.can_switch_to_video();
        let time_ms = self.player.time_ms();
        let length_ms = self.player.length_ms();
        let audio_delay_us = self.player.audio_delay_us();
        let subtitle_delay_us = self.player.subtitle_delay_us();
        let subtitle_track = self.player.subtitle_track();
        let save_audio_delay = self.config.save_individual_audio_delay;
        let Some(item) = self.media_list.get_mut(index) else {
            return;
        };

        if item.kind == MediaKind::Video || can_switch_to_video {
            let mut progress = if time_ms > 0 && length_ms > 0 {
                time_ms as f32 / length_ms as f32
            } else {
                0.0
            };
            if progress > SEEN_PROGRESS_RATIO
                || (length_ms > 0 && length_ms - time_ms < SEEN_REMAINING_MS)
            {
                item.seen += 1;
                progress = 0.0;
            }
            item.time_ms = if progress == 0.0 { 0 } else { time_ms };
            if item.is_p2p() {
                item.length_ms = length_ms;
            }
            trace!(
                "PlaylistManager: saved meta for {} time={} length={} seen={}",
                item.id,
                item.time_ms,
                length_ms,
                item.seen
            );
        }
        if can_switch_to_video {
            if save_audio_delay {
                item.audio_delay_us = audio_delay_us;
            }
            item.subtitle_delay_us = subtitle_delay_us;
            item.subtitle_track = subtitle_track;
        }
    }

    fn load_media_meta(&mut self, index: usize) {
        if !self.player.can_switch_to_video() {
            return;
        }
        let Some(item) = self.media_list.get(index) else {
            return;
        };
        let (audio_delay_us, subtitle_track, subtitle_delay_us) =
            (item.audio_delay_us, item.subtitle_track, item.subtitle_delay_us);
        if self.config.save_individual_audio_delay {
            self.player.set_audio_delay_us(audio_delay_us);
        }
        self.player.set_subtitle_track(subtitle_track);
        self.player.set_subtitle_delay_us(subtitle_delay_us);
    }

    fn seek_to_resume(&mut self, index: usize) {
        let length_ms = self.player.length_ms();
        if self.saved_time_ms > 0 {
            if (self.saved_time_ms as f64) < RESUME_MAX_RATIO * length_ms as f64 {
                debug!("PlaylistManager: resuming at saved time {}", self.saved_time_ms);
                self.player.seek(self.saved_time_ms);
            }
            self.saved_time_ms = 0;
            return;
        }
        if !self.config.playback_history {
            return;
        }
        let resume_ms = self.media_list.get(index).map_or(0, |item| item.time_ms);
        if resume_ms > 0 && length_ms > 0 {
            debug!("PlaylistManager: resuming item at {}", resume_ms);
            self.player.seek(resume_ms);
        }
    }

    fn save_position(&mut self, reset: bool) {
        if !self.has_media() {
            return;
        }
        let kind = self.list_kind();
        let position = SavedPosition {
            shuffle: self.navigator.shuffle(),
            repeat_mode: self.navigator.repeat_mode(),
            index: if reset {
                0
            } else {
                self.current_index.unwrap_or(0)
            },
            time_ms: if reset { 0 } else { self.player.time_ms() },
            rate: self.player.rate(),
            paused: !self.player.is_playing(),
        };
        if let Err(err) = self.settings.save_position(kind, &position) {
            error!("PlaylistManager: failed to persist position: {}", err);
        }
    }

    fn save_current_media(&self) {
        let index = self.current_index.unwrap_or(0);
        let Some(location) = self.media_list.location(index) else {
            return;
        };
        if let Err(err) = self.settings.save_current_media(self.list_kind(), location) {
            error!("PlaylistManager: failed to persist current media: {}", err);
        }
    }

    fn save_media_list(&self) {
        if self.current_media().is_none() {
            return;
        }
        trace!("PlaylistManager: saving media list");
        if let Err(err) = self
            .settings
            .save_media_list(self.list_kind(), self.media_list.items())
        {
            error!("PlaylistManager: failed to persist media list: {}", err);
        }
    }

    fn publish(&self, message: PlaylistMessage) {
        let _ = self.bus_producer.send(Message::Playlist(message));
    }

    fn notify(&self, notice: Notice) {
        let _ = self.bus_producer.send(Message::Notice(notice));
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        trace!("PlaylistManager: state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.publish(PlaylistMessage::PlaybackStateChanged(state));
    }

    fn submit_update(&self) {
        self.updates.submit(PlaylistSnapshot {
            items: self.media_list.items().to_vec(),
            current_index: self.current_index,
        });
    }

    fn on_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Playing => {
                self.video_background = false;
                self.set_state(PlaybackState::Playing);
                if self.new_media {
                    if let Some(index) = self.current_index {
                        self.seek_to_resume(index);
                        self.load_media_meta(index);
                    }
                    self.save_media_list();
                    self.save_position(true);
                    self.save_current_media();
                    self.new_media = false;
                }
            }
            PlayerEvent::Paused => self.set_state(PlaybackState::Paused),
            PlayerEvent::EndReached => {
                self.save_media_meta();
                self.determine_indices(true);
                if self.navigator.next().is_none() {
                    self.save_position(true);
                }
                self.next();
            }
            PlayerEvent::EncounteredError => {
                let location = self
                    .current_media()
                    .map(|item| item.location.clone())
                    .unwrap_or_default();
                warn!("PlaylistManager: player error on {}", location);
                self.notify(Notice::InvalidLocation(location));
                self.next();
            }
        }
    }

    fn on_p2p_message(&mut self, message: P2pMessage) {
        match message {
            P2pMessage::SessionStarted {
                item_id,
                playback_url,
            } => {
                let Some(pending) = self
                    .pending_session
                    .take_if(|pending| pending.item_id == item_id)
                else {
                    debug!("PlaylistManager: ignoring stale session start for {}", item_id);
                    return;
                };
                let Some(position) = self
                    .media_list
                    .items()
                    .iter()
                    .position(|item| item.id == item_id)
                else {
                    debug!("PlaylistManager: session item {} left the playlist", item_id);
                    return;
                };
                if let Some(item) = self.media_list.get_mut(position) {
                    item.playback_url = Some(playback_url);
                }
                if pending.replay_on_start {
                    self.play_index(position);
                }
            }
            P2pMessage::SessionFailed { item_id, message } => {
                if self
                    .pending_session
                    .as_ref()
                    .is_some_and(|pending| pending.item_id == item_id)
                {
                    self.pending_session = None;
                }
                error!(
                    "PlaylistManager: engine session for {} failed: {}",
                    item_id, message
                );
            }
            P2pMessage::PrebufferingDone { item_id, index } => {
                trace!("PlaylistManager: prebuffering done for {} at {:?}", item_id, index);
            }
            P2pMessage::SessionStarting { .. } => {}
        }
    }

    fn on_playlist_message(&mut self, message: PlaylistMessage) {
        match message {
            PlaylistMessage::LoadLocations {
                locations,
                position,
                start,
            } => self.load_locations(locations, position, start),
            PlaylistMessage::Load {
                items,
                position,
                start,
            } => self.load(items, position, start),
            PlaylistMessage::LoadLastPlaylist(kind) => self.load_last_playlist(kind),
            PlaylistMessage::Play => self.play(),
            PlaylistMessage::Pause => self.pause(),
            PlaylistMessage::Next => self.next(),
            PlaylistMessage::Previous { force } => self.previous(force),
            PlaylistMessage::PlayIndex(index) => self.play_index(index),
            PlaylistMessage::Stop(options) => self.stop(options),
            PlaylistMessage::SetShuffle(shuffle) => self.set_shuffle(shuffle),
            PlaylistMessage::ToggleShuffle => self.toggle_shuffle(),
            PlaylistMessage::SetRepeatMode(repeat_mode) => self.set_repeat_mode(repeat_mode),
            PlaylistMessage::Append(items) => self.append(items),
            PlaylistMessage::InsertNext(items) => self.insert_next(items),
            PlaylistMessage::InsertItem { position, item } => self.insert_item(position, item),
            PlaylistMessage::MoveItem { from, to } => self.move_item(from, to),
            PlaylistMessage::RemoveItem(position) => self.remove(position),
            PlaylistMessage::RemoveLocation(location) => self.remove_location(&location),
            PlaylistMessage::SwitchStream(stream_index) => self.switch_stream(stream_index),
            // Notifications published by this manager.
            PlaylistMessage::PlaylistLoaded { .. }
            | PlaylistMessage::IndicesChanged { .. }
            | PlaylistMessage::PlaybackStateChanged(_)
            | PlaylistMessage::NewPlayback { .. }
            | PlaylistMessage::RemotePlaybackRequested { .. }
            | PlaylistMessage::ListUpdated { .. }
            | PlaylistMessage::ExitPlayer
            | PlaylistMessage::PlaybackStopped => {}
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Playlist(message) => self.on_playlist_message(message),
            Message::Player(event) => self.on_player_event(event),
            Message::P2p(message) => self.on_p2p_message(message),
            Message::Renderer(RendererMessage::RendererChanged { renderer, .. }) => {
                self.player.set_renderer(renderer.as_ref());
            }
            Message::Renderer(_) | Message::Notice(_) => {}
        }
    }

    /// Starts the blocking event loop for playlist commands and collaborator events.
    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "PlaylistManager lagged on control bus, skipped {} message(s)",
                        skipped
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("PlaylistManager: bus closed");
                    break;
                }
            }
        }
    }
}
