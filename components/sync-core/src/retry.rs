/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An explicit retry wrapper (§9 Design Notes: "ad-hoc retry by re-entering
//! a for-loop index" replaced with a policy object a caller hands an
//! operation to), used by both remote clients for transient failures.

use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// What a `classifier` decides to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(250),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(d) = retry_after {
            return d;
        }
        let exp = self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1));
        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=50u64);
            exp + Duration::from_millis(jitter_ms)
        } else {
            exp
        }
    }
}

/// Extract a `Retry-After` duration from an error that carries one, and
/// decide whether the error is worth retrying at all.
fn classify(err: &Error) -> (RetryDecision, Option<Duration>) {
    match err {
        Error::Transient { .. } => (RetryDecision::Retry, None),
        Error::RateLimited { retry_after, .. } => (RetryDecision::Retry, *retry_after),
        Error::UrlTooLong { .. } => (RetryDecision::Retry, None),
        Error::Backoff(until) => {
            let wait = until
                .duration_since(std::time::SystemTime::now())
                .unwrap_or_default();
            (RetryDecision::Retry, Some(wait))
        }
        _ => (RetryDecision::GiveUp, None),
    }
}

/// Run `op`, retrying per `policy` on transient/rate-limited/backoff
/// errors, capped at `policy.max_attempts`, honoring any `Retry-After`
/// the error carries (§4.2, §7).
pub fn retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(err) => {
                let (decision, retry_after) = classify(&err);
                if decision == RetryDecision::GiveUp || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let wait = policy.backoff_for(attempt, retry_after);
                tracing::debug!(attempt, ?wait, "retrying after transient error: {err}");
                std::thread::sleep(wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_up_to_cap_then_gives_up() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            jitter: false,
        };
        let result: Result<(), Error> = retry(&policy, || {
            calls.set(calls.get() + 1);
            Err(Error::Transient {
                remote: "source".into(),
                source: anyhow::anyhow!("boom"),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_retryable_errors_give_up_immediately() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), Error> = retry(&policy, || {
            calls.set(calls.get() + 1);
            Err(Error::Validation("bad field".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1),
            jitter: false,
        };
        let result = retry(&policy, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::Transient {
                    remote: "datastore".into(),
                    source: anyhow::anyhow!("flaky"),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }
}
