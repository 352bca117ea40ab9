//! Contract of the native player wrapped by the playlist manager.
//!
//! The decoder/renderer itself lives outside this crate. Implementations
//! report playback events back by posting [`crate::protocol::PlayerEvent`]
//! onto the bus.

use crate::media::MediaItem;
use crate::renderer_registry::RendererItem;

/// Native player operations used by the playlist manager.
pub trait PlayerController: Send {
    /// Opens `item` (at its playable location) and starts playing it.
    fn start_playback(&mut self, item: &MediaItem);
    fn play(&mut self);
    /// Returns `true` when the player actually paused.
    fn pause(&mut self) -> bool;
    fn stop(&mut self);
    fn seek(&mut self, time_ms: i64);
    /// Moves to a relative position in `0.0..=1.0`.
    fn set_position(&mut self, position: f32);
    fn set_rate(&mut self, rate: f32);
    fn rate(&self) -> f32;
    fn time_ms(&self) -> i64;
    fn length_ms(&self) -> i64;
    fn is_seekable(&self) -> bool;
    fn is_playing(&self) -> bool;
    fn is_video_playing(&self) -> bool;
    fn can_switch_to_video(&self) -> bool;
    fn audio_tracks_count(&self) -> usize;
    fn audio_delay_us(&self) -> i64;
    fn set_audio_delay_us(&mut self, delay: i64);
    fn subtitle_track(&self) -> i32;
    fn set_subtitle_track(&mut self, track: i32);
    fn subtitle_delay_us(&self) -> i64;
    fn set_subtitle_delay_us(&mut self, delay: i64);
    /// Routes output to a renderer, or back to the local surface with `None`.
    fn set_renderer(&mut self, renderer: Option<&RendererItem>);
    /// Resolves the current item into sub-items (a playlist file, a stream
    /// with several entries). `None` when there is nothing to expand.
    fn expand(&mut self) -> Option<Vec<MediaItem>>;
    /// Drops the current media but keeps the player usable.
    fn release_media(&mut self);
    /// Tears the player down for good.
    fn release(&mut self);
    /// Resets the player after a stop so it can be reused.
    fn restart(&mut self);
}
