//! Error types for the packtap engine

use packtap_api::PackId;
use packtap_host::{EnvPatternError, LoaderError};
use thiserror::Error;

/// Setup failures, reported by [`crate::Packtap`] construction and `load()`
///
/// Fatal to setup and never retried.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Network and logging are both disabled, no telemetry would be captured")]
    NoOutputs,

    #[error("Network output is enabled but no secret was provided")]
    MissingSecret,

    #[error("packtap has already been initialized")]
    AlreadyInitialized,

    #[error("Pack {0} cannot be added after initialization")]
    RegistryFrozen(PackId),

    #[error("Pack {pack}: invalid domain pattern '{pattern}': {source}")]
    InvalidDomain {
        pack: PackId,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Pack {pack}: {source}")]
    InvalidEnvironment {
        pack: PackId,
        #[source]
        source: EnvPatternError,
    },

    #[error("Plugin host setup failed: {0}")]
    Host(#[from] LoaderError),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("Telemetry transport setup failed: {0}")]
    Transport(#[source] TransportError),
}

/// Failures moving bytes over the network
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collector responded with status {0}")]
    Status(u16),

    #[error("Failed to encode telemetry batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Local log sink failures
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
