//! Bounded retries over an explicit per-attempt outcome.
//!
//! Every request helper returns an [`Attempt`] instead of a bare `Result` so the
//! caller can tell "try again" from "stop now" without inspecting error text.
//! [`RetryPolicy::run`] folds a sequence of attempts into a single `Result`,
//! producing [`FetchError::Exhausted`] when the budget is spent. That variant
//! is what the pipeline treats as the signal to move on to a fallback source.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::FetchError;
use crate::util::backoff;

/// Outcome of one request attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Retryable(FetchError),
    Fatal(FetchError),
}

impl<T> Attempt<T> {
    /// Classifies an error by whether repeating the request could help.
    pub fn from_error(err: FetchError) -> Self {
        if err.is_transient() {
            Attempt::Retryable(err)
        } else {
            Attempt::Fatal(err)
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Done(v) => Attempt::Done(f(v)),
            Attempt::Retryable(e) => Attempt::Retryable(e),
            Attempt::Fatal(e) => Attempt::Fatal(e),
        }
    }

    /// Chains a fallible step that can only fail fatally (e.g. decoding).
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Result<U, FetchError>) -> Attempt<U> {
        match self {
            Attempt::Done(v) => match f(v) {
                Ok(u) => Attempt::Done(u),
                Err(e) => Attempt::Fatal(e),
            },
            Attempt::Retryable(e) => Attempt::Retryable(e),
            Attempt::Fatal(e) => Attempt::Fatal(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps; used by tests and for local endpoints.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn run<T, F>(&self, mut f: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Attempt<T>,
    {
        let max = self.max_attempts.max(1);
        let mut sleep = self.delay;
        let mut tries = 0usize;
        loop {
            tries += 1;
            match f() {
                Attempt::Done(v) => return Ok(v),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) => {
                    if tries >= max {
                        return Err(FetchError::Exhausted {
                            attempts: tries,
                            last: Box::new(e),
                        });
                    }
                    debug!(attempt = tries, error = %e, "transient failure, retrying");
                    if !sleep.is_zero() {
                        thread::sleep(sleep);
                    }
                    sleep = backoff(sleep, self.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> FetchError {
        FetchError::Network {
            url: "http://x".into(),
            message: "connection refused".into(),
        }
    }

    #[test]
    fn exhausts_after_exactly_max_attempts() {
        let mut calls = 0;
        let err = RetryPolicy::immediate(3)
            .run::<(), _>(|| {
                calls += 1;
                Attempt::Retryable(net())
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            FetchError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::Network { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fatal_is_not_retried() {
        let mut calls = 0;
        let err = RetryPolicy::immediate(5)
            .run::<(), _>(|| {
                calls += 1;
                Attempt::Fatal(FetchError::Status {
                    url: "u".into(),
                    status: 404,
                })
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(!err.is_exhausted());
    }

    #[test]
    fn recovers_after_transient_failures() {
        let mut calls = 0;
        let v = RetryPolicy::immediate(4)
            .run(|| {
                calls += 1;
                if calls < 3 {
                    Attempt::Retryable(net())
                } else {
                    Attempt::Done(calls)
                }
            })
            .unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = RetryPolicy::immediate(0).run::<(), _>(|| {
            calls += 1;
            Attempt::Retryable(net())
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn from_error_classifies_status() {
        let a: Attempt<()> = Attempt::from_error(FetchError::Status {
            url: "u".into(),
            status: 503,
        });
        assert!(matches!(a, Attempt::Retryable(_)));
        let b: Attempt<()> = Attempt::from_error(FetchError::Status {
            url: "u".into(),
            status: 403,
        });
        assert!(matches!(b, Attempt::Fatal(_)));
    }
}
