//! HTTP client for the Atlas esports data API.
//!
//! Provides a thin client for the live read endpoints (series, players,
//! teams), a startup probe that learns the upstream rate limits from response
//! headers, and an upstream rate limiter that paces local callers so the
//! proxy never outruns the budget Atlas advertises.

mod client;
mod errors;
mod rate_limit;

pub use self::client::{AtlasClient, LiveEndpoint, PageQuery, DEFAULT_BASE_URL, MAX_TAKE, SECRET_HEADER};
pub use self::errors::AtlasError;
pub use self::rate_limit::{
    RateLimitInfo, UpstreamLimiter, BURST_HEADER, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER,
    RETRY_AFTER_HEADER,
};
