use svclog_core::RingError;
use thiserror::Error;

/// Errors surfaced by pullers, gatherers, clients, and the manager.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown target type {0:?}")]
    UnknownTargetType(String),

    #[error("invalid target location {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("loki server rejected the batch with an unrecoverable status {status}")]
    LokiUnrecoverable { status: u16 },

    #[error("loki server asked us to retry (status {status})")]
    LokiRetryable { status: u16 },
}
