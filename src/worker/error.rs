use thiserror::Error;

/// Errors raised synchronously by the worker bridge.
///
/// Failures that happen inside a spawned context (load errors, uncaught
/// exceptions, crashes) never show up here; they arrive as `error` events.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Unsupported worker reference '{0}'")]
    UnsupportedReferenceKind(String),

    #[error("Malformed data: reference: {0}")]
    MalformedDataReference(String),

    #[error("DataCloneError: {0}")]
    UncloneableValue(String),

    #[error("Failed to materialize worker entry: {0}")]
    Materialize(#[source] std::io::Error),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
