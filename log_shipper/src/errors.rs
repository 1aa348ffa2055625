//! Error types for the log shipping pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShipperError>;

#[derive(Debug, Error)]
pub enum ShipperError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built or a request failed outright
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Index name template could not be parsed
    #[error("Invalid index template: {0}")]
    IndexTemplate(String),
}

/// Outcome of a failed delivery attempt, classified by what the worker should do next.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Worth retrying: network errors, timeouts, 408/429/5xx
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// The sink cannot work until it is reconfigured
    #[error("permanent sink failure: {0}")]
    Permanent(String),

    /// The backend refused this batch; retrying the same payload will not help
    #[error("batch rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("missing context: {0}")]
    MissingContext(String),

    #[error("enricher panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

/// A single event could not be encoded for a sink.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}
