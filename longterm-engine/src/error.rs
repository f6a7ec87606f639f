use thiserror::Error;

/// Errors that may occur when driving a page session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("page session is closed")]
    Closed,
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Failure of an upstream live query. Delivered through the composite stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("period query `{key}` failed: {reason}")]
    Base { key: String, reason: String },
    #[error("goal query for period `{period_id}` failed: {reason}")]
    Child { period_id: String, reason: String },
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// An instant that cannot be placed on the configured calendar.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("timestamp {0} ms is out of the representable range")]
    OutOfRange(i64),
}
