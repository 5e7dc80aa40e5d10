//! Downstream admission: the per-secret request budget.
//!
//! Each authenticated caller gets a fixed number of requests per wall-clock
//! second, counted in the shared store so every proxy instance sees the same
//! number. The count entry is seeded with a one-second TTL on the first
//! request of a window and incremented (TTL untouched) for the rest, so a
//! window ends exactly when its first request turns one second old.

use std::sync::Arc;
use std::time::Duration;

use crate::error::GateError;
use crate::secrets::{count_key, secret_key};
use crate::store::{CountObservation, CounterStore, TxnCommand};

/// One wall-clock second per counting window.
const WINDOW_TTL: Duration = Duration::from_secs(1);

/// Reported to exhausted callers: the window resets within this many ms.
const WINDOW_MS: u64 = 1_000;

/// The rate-limit header set returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHeaders {
    pub limit: u32,
    pub burst: u32,
    pub remaining: u32,
    /// Milliseconds until the caller's window resets.
    pub reset_ms: u64,
    /// Milliseconds the caller should wait; zero when budget remains.
    pub retry_after_ms: u64,
}

impl RateHeaders {
    /// Header name/value pairs, ready to merge into a response.
    pub fn pairs(&self) -> [(&'static str, String); 5] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Burst", self.burst.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_ms.to_string()),
            ("Retry-After", self.retry_after_ms.to_string()),
        ]
    }
}

/// Per-secret admission gate over the shared counter store.
pub struct DownstreamLimiter {
    store: Arc<dyn CounterStore>,
    rps: u32,
    max_retries: u32,
}

impl DownstreamLimiter {
    /// `rps` is the per-secret budget; `max_retries` bounds how often a
    /// conflicting count transaction is retried before giving up.
    pub fn new(store: Arc<dyn CounterStore>, rps: u32, max_retries: u32) -> Self {
        Self {
            store,
            rps,
            max_retries,
        }
    }

    async fn check_secret(&self, secret: &str) -> Result<(), GateError> {
        match self.store.get(&secret_key(secret)).await? {
            None => Err(GateError::UnknownSecret),
            Some(stored) if stored != secret => {
                tracing::warn!("stored secret does not mirror its key");
                Err(GateError::UnknownSecret)
            }
            Some(_) => Ok(()),
        }
    }

    /// Admits one request for `secret`, or refuses with the reason.
    ///
    /// Counting runs in an optimistic transaction on the caller's count key:
    /// concurrent requests for the same secret conflict and retry, so the
    /// budget holds even across proxy instances.
    pub async fn allow(&self, secret: &str) -> Result<(), GateError> {
        if secret.is_empty() {
            return Err(GateError::MissingSecret);
        }
        self.check_secret(secret).await?;

        let key = count_key(secret);
        let rps = i64::from(self.rps);
        for _ in 0..self.max_retries {
            let mut throttled = false;
            let mut decide = |view: CountObservation| {
                let count = view.count.unwrap_or(0);
                if count >= rps {
                    throttled = true;
                    return None;
                }
                Some(if count > 0 {
                    TxnCommand::Incr
                } else {
                    TxnCommand::SetWithTtl(WINDOW_TTL)
                })
            };
            if !self.store.watch_count(&key, &mut decide).await? {
                tracing::debug!(secret, "count transaction conflicted, retrying");
                continue;
            }
            if throttled {
                tracing::debug!(secret, "requests per second exceeded");
                return Err(GateError::TooManyRequests);
            }
            return Ok(());
        }
        Err(GateError::TxnRetriesExhausted)
    }

    /// Reports the caller's current budget without consuming any of it.
    pub async fn info(&self, secret: &str) -> Result<RateHeaders, GateError> {
        let key = count_key(secret);
        let mut snapshot = CountObservation::default();
        self.store
            .watch_count(&key, &mut |view| {
                snapshot = view;
                None
            })
            .await?;

        let count = u32::try_from(snapshot.count.unwrap_or(0).max(0)).unwrap_or(u32::MAX);
        let mut headers = RateHeaders {
            limit: self.rps,
            burst: self.rps,
            remaining: self.rps.saturating_sub(count),
            reset_ms: snapshot.ttl_ms.unwrap_or(0).max(0) as u64,
            retry_after_ms: 0,
        };
        if headers.remaining == 0 {
            headers.retry_after_ms = WINDOW_MS;
            headers.reset_ms = WINDOW_MS;
        }
        Ok(headers)
    }
}
