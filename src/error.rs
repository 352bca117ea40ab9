//! Error types shared across the playlist, persistence, and renderer layers.

use thiserror::Error;

/// Failures raised by the durable settings store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("settings payload for '{key}' is not valid JSON: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not resolve a data directory for the settings store")]
    NoDataDir,
    #[error("could not create settings directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings store lock poisoned")]
    Poisoned,
}

/// Failures raised while starting or stopping renderer discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discoverer '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },
    #[error("discoverer '{name}' has been released")]
    Released { name: String },
    #[error("mDNS daemon error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// Failures raised when a P2P streaming session cannot be requested.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("p2p engine is not connected")]
    EngineUnavailable,
    #[error("p2p session request rejected: {0}")]
    Rejected(String),
}

/// Failures raised while loading the TOML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not resolve a config directory")]
    NoConfigDir,
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
