//! Library layer for atlasgate, a rate-limiting reverse proxy in front of
//! the Atlas esports data API.
//!
//! Wires the `atlas_api` client and upstream limiter together with the shared
//! counter store, the per-secret downstream limiter, and the forwarding HTTP
//! surface. The binary crate only adds settings and process plumbing.

pub mod downstream;
pub mod error;
pub mod proxy;
pub mod secrets;
pub mod store;

pub use atlas_api;

pub use downstream::{DownstreamLimiter, RateHeaders};
pub use error::{GateError, StoreError};
pub use proxy::{router, AppState, CALLER_SECRET_HEADER};
pub use secrets::{
    count_key, load_secrets, parse_secrets, publish_secrets, secret_key, SecretsError,
};
pub use store::{
    CountObservation, CounterStore, MemoryStore, RedisSettings, RedisStore, TxnCommand,
};
