use thiserror::Error;

/// Result type for batchling operations.
pub type Result<T> = std::result::Result<T, BatchlingError>;

/// Errors that can occur in the batching system.
#[derive(Debug, Error)]
pub enum BatchlingError {
    /// Request body is missing a field the provider requires (e.g. model)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or rejected credential. Fatal for the whole batch.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Provider-side failure on submission or poll
    #[error("Provider error: {0}")]
    Provider(String),

    /// Batch reached a terminal state but some requests were absent from results
    #[error("Batch {batch_id} ended in state '{state}' without a result for this request")]
    ProviderIncomplete { batch_id: String, state: String },

    /// Caller dropped interest in a pending request
    #[error("Request canceled")]
    Canceled,

    /// Intake attempted after the engine was closed
    #[error("Batching engine is closed")]
    EngineClosed,

    /// Only polling work remains; the scope may exit and resume from cache.
    /// A control-flow signal rather than a failure.
    #[error("Deferred exit: only polling work remains")]
    DeferredExit,

    /// Cache database operation failed
    #[error("Cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// HTTP transport failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
