use std::{
    any::Any,
    thread::{self, JoinHandle},
};

use tokio::sync::broadcast;

use crate::{
    config::PlaybackConfig, p2p::P2pEngine, player::PlayerController,
    playlist_manager::PlaylistManager, protocol::Message, renderer_registry::RendererRegistry,
    settings_store::SettingsStore,
};

pub struct BackgroundServicesConfig {
    pub bus_sender: broadcast::Sender<Message>,
    pub settings: SettingsStore,
    pub renderers: RendererRegistry,
    pub playback: PlaybackConfig,
    pub player: Box<dyn PlayerController>,
    pub p2p_engine: Box<dyn P2pEngine>,
    /// Start renderer discovery on a background thread.
    pub start_discovery: bool,
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

/// Spawns the playlist manager on the bus. Returns its thread handle.
pub fn spawn_background_services(
    config: BackgroundServicesConfig,
) -> std::io::Result<JoinHandle<()>> {
    let BackgroundServicesConfig {
        bus_sender,
        settings,
        renderers,
        playback,
        player,
        p2p_engine,
        start_discovery,
    } = config;

    if start_discovery {
        renderers.start_in_background()?;
    }

    // Subscribe before returning so commands sent right after spawning are seen.
    let playlist_manager_bus_receiver = bus_sender.subscribe();
    let playlist_manager_bus_sender = bus_sender.clone();
    thread::Builder::new()
        .name("playlist-manager".to_string())
        .spawn(move || {
            let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut playlist_manager = PlaylistManager::new(
                    playlist_manager_bus_receiver,
                    playlist_manager_bus_sender,
                    player,
                    p2p_engine,
                    settings,
                    renderers,
                    playback,
                );
                playlist_manager.run();
            }));
            if let Err(payload) = run_result {
                log::error!(
                    "PlaylistManager thread terminated due to panic: {}",
                    panic_payload_to_string(payload.as_ref())
                );
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use crate::error::P2pError;
    use crate::media::{MediaItem, MediaKind, P2pSource};
    use crate::p2p::{P2pSessionEvents, P2pSessionRequest};
    use crate::protocol::{PlaybackState, PlaylistMessage};
    use crate::renderer_registry::{RendererDiscoverer, RendererItem};
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::error::TryRecvError;

    struct SilentPlayer;

    impl PlayerController for SilentPlayer {
        fn start_playback(&mut self, _item: &MediaItem) {}
        fn play(&mut self) {}
        fn pause(&mut self) -> bool {
            true
        }
        fn stop(&mut self) {}
        fn seek(&mut self, _time_ms: i64) {}
        fn set_position(&mut self, _position: f32) {}
        fn set_rate(&mut self, _rate: f32) {}
        fn rate(&self) -> f32 {
            1.0
        }
        fn time_ms(&self) -> i64 {
            0
        }
        fn length_ms(&self) -> i64 {
            0
        }
        fn is_seekable(&self) -> bool {
            true
        }
        fn is_playing(&self) -> bool {
            true
        }
        fn is_video_playing(&self) -> bool {
            false
        }
        fn can_switch_to_video(&self) -> bool {
            false
        }
        fn audio_tracks_count(&self) -> usize {
            1
        }
        fn audio_delay_us(&self) -> i64 {
            0
        }
        fn set_audio_delay_us(&mut self, _delay: i64) {}
        fn subtitle_track(&self) -> i32 {
            -1
        }
        fn set_subtitle_track(&mut self, _track: i32) {}
        fn subtitle_delay_us(&self) -> i64 {
            0
        }
        fn set_subtitle_delay_us(&mut self, _delay: i64) {}
        fn set_renderer(&mut self, _renderer: Option<&RendererItem>) {}
        fn expand(&mut self) -> Option<Vec<MediaItem>> {
            None
        }
        fn release_media(&mut self) {}
        fn release(&mut self) {}
        fn restart(&mut self) {}
    }

    struct NoP2pEngine;

    impl P2pEngine for NoP2pEngine {
        fn start_session(
            &mut self,
            _request: P2pSessionRequest,
            _events: P2pSessionEvents,
        ) -> Result<(), P2pError> {
            Err(P2pError::EngineUnavailable)
        }
        fn stop_session(&mut self) {}
        fn active_session_url(&self, _source: &P2pSource) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_spawned_manager_answers_bus_commands() {
        let (bus_sender, _) = broadcast::channel(1024);
        let mut receiver = bus_sender.subscribe();
        let renderers = RendererRegistry::new(
            bus_sender.clone(),
            &RendererConfig::default(),
            Box::new(Vec::<Box<dyn RendererDiscoverer>>::new),
        );
        let settings = SettingsStore::new_in_memory().expect("failed to create in-memory store");

        spawn_background_services(BackgroundServicesConfig {
            bus_sender: bus_sender.clone(),
            settings,
            renderers,
            playback: PlaybackConfig::default(),
            player: Box::new(SilentPlayer),
            p2p_engine: Box::new(NoP2pEngine),
            start_discovery: false,
        })
        .expect("failed to spawn services");

        bus_sender
            .send(Message::Playlist(PlaylistMessage::Load {
                items: vec![MediaItem::new("/videos/a.mkv", MediaKind::Video)],
                position: 0,
                start: true,
            }))
            .expect("failed to send message to bus");

        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for playback state");
            match receiver.try_recv() {
                Ok(Message::Playlist(PlaylistMessage::PlaybackStateChanged(
                    PlaybackState::Loading,
                ))) => break,
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Closed) => panic!("bus closed"),
            }
        }
    }

    #[test]
    fn test_panic_payload_to_string() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(
            panic_payload_to_string(payload.as_ref()),
            "non-string panic payload"
        );
    }
}
