//! Persistent application configuration model and defaults.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::ConfigError;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Playlist navigation and persistence preferences.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Renderer discovery behavior.
    pub renderer: RendererConfig,
}

/// Playlist navigation and persistence preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// `previous()` restarts the current item instead of navigating once
    /// playback went past this point, unless forced.
    #[serde(default = "default_previous_limit_delay_ms")]
    pub previous_limit_delay_ms: i64,
    /// Persist the repeat mode of audio lists across sessions.
    #[serde(default = "default_true")]
    pub save_audio_repeat: bool,
    /// Remember the audio delay per item instead of resetting it.
    #[serde(default)]
    pub save_individual_audio_delay: bool,
    /// Store resume positions and seen counters on items.
    #[serde(default = "default_true")]
    pub playback_history: bool,
}

/// Renderer discovery behavior.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RendererConfig {
    #[serde(default = "default_discovery_retry_attempts")]
    pub discovery_retry_attempts: u32,
    #[serde(default = "default_discovery_retry_delay_ms")]
    pub discovery_retry_delay_ms: u64,
    /// How long the diagnostic binary browses before reporting.
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            previous_limit_delay_ms: default_previous_limit_delay_ms(),
            save_audio_repeat: true,
            save_individual_audio_delay: false,
            playback_history: true,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            discovery_retry_attempts: default_discovery_retry_attempts(),
            discovery_retry_delay_ms: default_discovery_retry_delay_ms(),
            discovery_window_ms: default_discovery_window_ms(),
            service_type: default_service_type(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_previous_limit_delay_ms() -> i64 {
    5_000
}

fn default_discovery_retry_attempts() -> u32 {
    5
}

fn default_discovery_retry_delay_ms() -> u64 {
    1_000
}

fn default_discovery_window_ms() -> u64 {
    3_000
}

fn default_service_type() -> String {
    "_googlecast._tcp.local.".to_string()
}

/// Clamps values that would make the runtime misbehave.
pub fn sanitize_config(config: Config) -> Config {
    let service_type = if config.renderer.service_type.trim().is_empty() {
        default_service_type()
    } else {
        config.renderer.service_type.trim().to_string()
    };

    Config {
        playback: PlaybackConfig {
            previous_limit_delay_ms: config.playback.previous_limit_delay_ms.clamp(0, 60_000),
            ..config.playback
        },
        renderer: RendererConfig {
            discovery_retry_attempts: config.renderer.discovery_retry_attempts.clamp(1, 20),
            discovery_retry_delay_ms: config.renderer.discovery_retry_delay_ms.min(30_000),
            discovery_window_ms: config.renderer.discovery_window_ms.clamp(250, 60_000),
            service_type,
        },
    }
}

/// Default location: `<config dir>/castqueue/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("castqueue").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Reads `path`, writing a default config there first when it does not exist.
pub fn load_or_create_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string(&Config::default())?)?;
    }

    let content = std::fs::read_to_string(path)?;
    let parsed = toml::from_str::<Config>(&content)?;
    Ok(sanitize_config(parsed))
}
