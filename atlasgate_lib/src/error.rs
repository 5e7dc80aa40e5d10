//! Error types for the proxy library.

use thiserror::Error;

/// Errors from the counter store backing the downstream limiter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The Redis backend failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// The store did not answer the startup ping within the deadline.
    #[error("counter store did not answer the ping in time")]
    PingTimeout,
}

/// Refusals and failures of the downstream admission gate.
///
/// Each variant maps to one response status: missing secret 400, unknown
/// secret 403, exhausted budget 429, everything else 500.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("missing caller secret")]
    MissingSecret,
    #[error("unknown caller secret")]
    UnknownSecret,
    #[error("requests per second exceeded")]
    TooManyRequests,
    #[error("count transaction kept conflicting")]
    TxnRetriesExhausted,
    #[error("counter store failure: {0}")]
    Store(#[from] StoreError),
}
