//! Upstream rate limiting for the Atlas API.
//!
//! Atlas advertises its rate discipline in response headers. [`RateLimitInfo`]
//! is the parsed form of those headers; [`UpstreamLimiter`] turns them into a
//! local admission gate so the proxy never sends a request the upstream would
//! refuse. The gate tracks one burst window at a time (capacity, occupancy,
//! reset and backoff deadlines) and lets a bounded number of callers wait for
//! the next window instead of failing outright.

use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::errors::AtlasError;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const BURST_HEADER: &str = "X-RateLimit-Burst";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// How long a caller may wait for an upstream slot before giving up.
const SLOT_WAIT_TIMEOUT: Duration = Duration::from_secs(4);

/// Cadence at which waiters re-check the burst state.
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waiter bound when none is configured, as a multiple of the initial limit.
const WAITERS_PER_SLOT: u64 = 10;

/// Rate-limit information collected from Atlas response headers.
///
/// Absent headers decode to zero. A header that is present but not numeric is
/// a hard error; silently misreading the upstream budget is worse than
/// skipping one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Declared requests per window, from `X-RateLimit-Limit`.
    pub limit: u64,
    /// Declared burst capacity, from `X-RateLimit-Burst`.
    pub burst: u64,
    /// Slots left in the current window, from `X-RateLimit-Remaining`.
    pub remaining: u64,
    /// Milliseconds until the window resets, from `X-RateLimit-Reset`.
    pub reset: u64,
    /// Seconds to back off before any further request, from `Retry-After`.
    pub retry_after: u64,
}

impl RateLimitInfo {
    /// Parses the rate-limit headers of an Atlas response.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AtlasError> {
        Ok(Self {
            limit: numeric_header(headers, LIMIT_HEADER)?,
            burst: numeric_header(headers, BURST_HEADER)?,
            remaining: numeric_header(headers, REMAINING_HEADER)?,
            reset: numeric_header(headers, RESET_HEADER)?,
            retry_after: numeric_header(headers, RETRY_AFTER_HEADER)?,
        })
    }
}

fn numeric_header(headers: &HeaderMap, name: &'static str) -> Result<u64, AtlasError> {
    let Some(value) = headers.get(name) else {
        return Ok(0);
    };
    let text = value
        .to_str()
        .map_err(|_| AtlasError::MalformedRateLimitHeader {
            name,
            value: format!("{value:?}"),
        })?;
    if text.is_empty() {
        return Ok(0);
    }
    text.parse().map_err(|_| AtlasError::MalformedRateLimitHeader {
        name,
        value: text.to_string(),
    })
}

/// One upstream window: capacity, occupancy, and deadlines.
///
/// Deadlines are passive timestamps checked under the gate lock; nothing
/// mutates this struct from a timer callback.
#[derive(Debug)]
struct Burst {
    limit: u64,
    slots: u64,
    next_reset: Option<Instant>,
    next_retry: Option<Instant>,
    info_count: u64,
}

impl Burst {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            slots: 0,
            next_reset: None,
            next_retry: None,
            info_count: 0,
        }
    }

    /// Claims one admission in the current window.
    fn slot(&mut self, now: Instant) -> bool {
        if self.next_retry.is_some_and(|at| now < at) {
            return false;
        }
        if self.slots < self.limit {
            self.slots += 1;
            return true;
        }
        false
    }

    /// Folds one upstream response into the window state.
    fn update(&mut self, info: &RateLimitInfo, now: Instant) {
        self.info_count += 1;
        // The upstream may change its limit on the fly.
        self.limit = info.limit;
        if info.retry_after > 0 {
            let retry_at = now + Duration::from_secs(info.retry_after);
            // Deadlines only ever move forward; a late-arriving response must
            // not shorten an active backoff.
            if self.next_retry.map_or(true, |at| retry_at > at) {
                self.next_retry = Some(retry_at);
            }
        }
        let reset_at = now + Duration::from_millis(info.reset);
        if self.next_reset.map_or(true, |at| reset_at > at) {
            self.next_reset = Some(reset_at);
        }
    }

    /// Whether the window may be replaced with a fresh one.
    ///
    /// A passed backoff always opens a new window. A passed reset only counts
    /// once at least `limit` upstream responses have confirmed the window;
    /// resetting earlier would re-open capacity the upstream never granted.
    fn reset_due(&self, now: Instant) -> bool {
        if self.next_retry.is_some_and(|at| now > at) {
            return true;
        }
        self.next_reset.is_some_and(|at| now > at) && self.info_count >= self.limit
    }

    /// A fresh window carrying over only the advertised limit.
    fn renewed(&self) -> Self {
        Self::new(self.limit)
    }
}

struct Gate {
    burst: Burst,
    waiting: u64,
}

/// Admission gate in front of the Atlas API.
///
/// `slot()` grants at most `limit` admissions per upstream window. When the
/// window is exhausted, up to `max_waiting` callers poll for the next window
/// for at most four seconds; everyone else is refused immediately. No order
/// among waiters is promised.
pub struct UpstreamLimiter {
    gate: Mutex<Gate>,
    max_waiting: u64,
}

impl UpstreamLimiter {
    /// Builds the gate from the rate limits learned by the startup probe.
    ///
    /// `max_waiting` bounds the waiter queue; when `None`, it defaults to
    /// ten waiters per slot of the initial limit.
    pub fn new(initial: &RateLimitInfo, max_waiting: Option<u64>) -> Self {
        let mut burst = Burst::new(initial.limit);
        burst.update(initial, Instant::now());
        Self {
            gate: Mutex::new(Gate { burst, waiting: 0 }),
            max_waiting: max_waiting.unwrap_or(initial.limit.saturating_mul(WAITERS_PER_SLOT)),
        }
    }

    /// Tries to claim an upstream admission, waiting for the next window if
    /// the current one is exhausted and the waiter queue has room.
    pub async fn slot(&self) -> bool {
        {
            let mut gate = self.gate.lock().await;
            let now = Instant::now();
            if gate.burst.reset_due(now) {
                gate.burst = gate.burst.renewed();
            }
            if gate.burst.slot(now) {
                return true;
            }
            if gate.waiting >= self.max_waiting {
                tracing::debug!(waiting = gate.waiting, "slot queue is full");
                return false;
            }
            gate.waiting += 1;
        }
        let granted = self.wait_for_slot().await;
        self.gate.lock().await.waiting -= 1;
        granted
    }

    async fn wait_for_slot(&self) -> bool {
        let deadline = Instant::now() + SLOT_WAIT_TIMEOUT;
        loop {
            sleep(SLOT_POLL_INTERVAL).await;
            let mut gate = self.gate.lock().await;
            let now = Instant::now();
            if gate.burst.reset_due(now) {
                gate.burst = gate.burst.renewed();
            }
            if gate.burst.slot(now) {
                return true;
            }
            if now >= deadline {
                return false;
            }
        }
    }

    /// Folds the rate-limit headers of an upstream response into the gate.
    ///
    /// Unreadable headers are logged and skipped; the gate keeps its current
    /// view rather than adopting a bogus one.
    pub async fn update(&self, headers: &HeaderMap) {
        let info = match RateLimitInfo::from_headers(headers) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(%err, "ignoring unreadable rate limit headers");
                return;
            }
        };
        tracing::debug!(
            limit = info.limit,
            remaining = info.remaining,
            reset_ms = info.reset,
            retry_after = info.retry_after,
            "upstream rate limit headers"
        );
        let mut gate = self.gate.lock().await;
        let now = Instant::now();
        gate.burst.update(&info, now);
        if gate.burst.reset_due(now) {
            gate.burst = gate.burst.renewed();
        }
    }
}
