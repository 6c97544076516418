use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinewError {
    /// The pool could not be brought up at construction time.
    #[error("failed to initialize connection pool: {0}")]
    ConnectionInit(String),
    /// No pooled connection became available within the configured wait.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    ConnectionTimeout(Duration),
    /// The query could not be sent or its response could not be read; the
    /// session's connection has been dropped from the pool.
    #[error("query failed: {0}")]
    Query(String),
    #[error("transaction is no longer active")]
    TransactionInactive,
    #[error("cannot send more than {0} parameters in one request")]
    TooManyParams(usize),
}
