// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Backoff schedule for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt: base × 2^(attempt-1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Classify an error as transient (retryable) or permanent.
///
/// String-based because the error crosses the `anyhow` boundary from
/// heterogeneous provider drivers; the markers cover HTTP status phrases
/// and transport-level failures seen from real backends.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    const TRANSIENT: &[&str] = &[
        "429",
        "rate limit",
        "rate_limit",
        "overloaded",
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "502",
        "503",
        "504",
    ];
    // Auth failures mention 401/403 and must never be retried, even when a
    // transport marker also appears in the chain.
    if msg.contains("401") || msg.contains("403") || msg.contains("unauthorized") {
        return false;
    }
    TRANSIENT.iter().any(|m| msg.contains(m))
}

/// Run `op` with exponential backoff.  `on_retry` is invoked before each
/// re-attempt with the attempt number (2-based: the first retry is 2) and
/// the error being retried, so callers can record retry parts.
pub async fn with_backoff<T, F, Fut, C>(
    policy: RetryPolicy,
    mut op: F,
    mut on_retry: C,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    C: FnMut(u32, &anyhow::Error),
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_attempts || !is_transient_error(&e) {
                    return Err(e);
                }
                attempt += 1;
                warn!(attempt, error = %e, "transient provider error; backing off");
                on_retry(attempt, &e);
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn rate_limit_is_transient() {
        let e = anyhow::anyhow!("provider error 429: rate limit exceeded");
        assert!(is_transient_error(&e));
    }

    #[test]
    fn auth_error_is_permanent() {
        let e = anyhow::anyhow!("provider error 401: unauthorized");
        assert!(!is_transient_error(&e));
    }

    #[test]
    fn auth_error_beats_transient_marker() {
        let e = anyhow::anyhow!("403 forbidden while connecting (connection reset)");
        assert!(!is_transient_error(&e));
    }

    #[test]
    fn unclassified_error_is_permanent() {
        let e = anyhow::anyhow!("invalid request: unknown model");
        assert!(!is_transient_error(&e));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn with_backoff_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let result = with_backoff(
            policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::anyhow!("503 service unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_backoff_gives_up_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_backoff(
            RetryPolicy::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("400 bad request")) }
            },
            |_, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_backoff_reports_each_retry() {
        let mut retries = Vec::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let _ = with_backoff(
            policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("429 too many requests")) }
            },
            |attempt, _| retries.push(attempt),
        )
        .await;
        assert_eq!(retries, vec![2, 3]);
    }
}
