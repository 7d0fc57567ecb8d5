//! The retry loop that wraps outbound HTTP calls (spec §4.1 "Retry loop",
//! "Low-level integration").

use crate::backoff::{backoff_from_headers, BackoffPolicy};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;

/// Whatever a failed outbound call produces must expose enough of the HTTP
/// exchange for the engine to decide retryability and compute backoff.
/// Implemented by the host's upstream-client error types; the concrete
/// sensor/analysis/grid clients are external collaborators (spec §1).
pub trait RetryableError {
    fn method(&self) -> Option<&str>;
    fn status(&self) -> Option<u16>;
    fn headers(&self) -> Option<&HashMap<String, String>>;
}

/// Execute `call` with up to `policy.max_retries` retries. On each failure,
/// inspect the error's method/status/headers: if the failure is retryable
/// (method and status both in the configured sets) *and* a backoff delay
/// can be derived from the response headers, sleep and retry. Otherwise —
/// including when no header yields a delay — the error is returned
/// immediately, budget or no budget (spec §4.1: "no backoff is derivable
/// ... the call is not retried regardless of method/status").
///
/// `on_retry`, if given, is invoked with `(attempt, delay)` before each
/// sleep — useful for logging or metrics.
pub async fn with_retry<F, Fut, T, E>(
    policy: &BackoffPolicy,
    mut call: F,
    mut on_retry: Option<&mut (dyn FnMut(u32, std::time::Duration) + Send)>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError,
{
    let mut remaining = policy.max_retries;
    let mut attempt: u32 = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if remaining == 0 {
                    return Err(err);
                }

                let retryable = match err.status() {
                    Some(status) => policy.is_retryable(err.method(), status),
                    None => false,
                };
                if !retryable {
                    return Err(err);
                }

                let delay = err
                    .headers()
                    .and_then(|headers| backoff_from_headers(headers, Utc::now()));

                let Some(delay) = delay else {
                    return Err(err);
                };

                remaining -= 1;
                attempt += 1;
                if let Some(cb) = on_retry.as_deref_mut() {
                    cb(attempt, delay);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Adapts the same policy to retries driven by an HTTP library's
/// connection-pool layer, so sockets exhausted mid-request can be retried
/// without re-entering user code (spec §4.1 "Low-level integration").
///
/// Precedence (Design Notes §9): the application-level [`with_retry`] wraps
/// the outer call; a `PoolRetryDecider` governs only retries the pool layer
/// performs beneath it (e.g. a connection reset before any bytes of the
/// response were read). The two budgets are independent — a pool-level
/// retry does not consume the outer [`BackoffPolicy`]'s `max_retries`, and
/// vice versa, so composing them never double-counts a single logical
/// attempt.
pub struct PoolRetryDecider {
    policy: BackoffPolicy,
    remaining: u32,
}

impl PoolRetryDecider {
    pub fn new(policy: BackoffPolicy) -> Self {
        let remaining = policy.max_retries;
        Self { policy, remaining }
    }

    /// Called by the pool layer when a connection-level failure occurs.
    /// Returns the delay to wait before the pool retries the connection, or
    /// `None` if the pool should give up and surface the error upward.
    pub fn decide(
        &mut self,
        method: Option<&str>,
        status: Option<u16>,
        headers: Option<&HashMap<String, String>>,
    ) -> Option<std::time::Duration> {
        if self.remaining == 0 {
            return None;
        }
        let status = status?;
        if !self.policy.is_retryable(method, status) {
            return None;
        }
        let delay = backoff_from_headers(headers?, Utc::now())?;
        self.remaining -= 1;
        Some(delay)
    }
}
