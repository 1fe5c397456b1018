//! Bounded compare-and-swap retry
//!
//! Read-modify-write units of work (weighted average price recompute) read a
//! balance row without locking, compute the new value, and write it only if
//! the row's version token is unchanged. A changed version, an expired lock
//! wait or a detected deadlock all surface as `ConcurrencyConflict`; the
//! whole unit of work is then re-run from scratch on fresh state.

use crate::{Error, Result};
use tracing::warn;

/// Retry policy for conflicting units of work
#[derive(Debug, Clone, Copy)]
pub struct CasRetry {
    max_attempts: u32,
}

impl CasRetry {
    /// Policy allowing `max_attempts` total attempts (at least one)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `unit` until it succeeds, fails with a non-conflict error, or
    /// the attempt budget is spent
    ///
    /// `on_conflict` is called once per conflicting attempt.
    pub fn run<T, F, C>(&self, operation: &str, mut unit: F, mut on_conflict: C) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        C: FnMut(),
    {
        let mut attempt = 1;
        loop {
            match unit(attempt) {
                Err(err) if err.is_retryable() => {
                    on_conflict();
                    if attempt >= self.max_attempts {
                        warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "Retry budget exhausted"
                        );
                        return Err(Error::ConcurrencyConflict(format!(
                            "{} gave up after {} attempts: {}",
                            operation, attempt, err
                        )));
                    }
                    warn!(operation, attempt, error = %err, "Concurrent update, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Check a version token read earlier against the row's current version
pub fn expect_version(what: &str, expected: u64, current: u64) -> Result<()> {
    if expected != current {
        return Err(Error::ConcurrencyConflict(format!(
            "{} changed (expected version {}, found {})",
            what, expected, current
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_conflicts() {
        let policy = CasRetry::new(3);
        let mut conflicts = 0;
        let result = policy.run(
            "test",
            |attempt| {
                if attempt < 3 {
                    Err(Error::ConcurrencyConflict("busy".into()))
                } else {
                    Ok(attempt)
                }
            },
            || conflicts += 1,
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(conflicts, 2);
    }

    #[test]
    fn test_exhausted_budget_is_conflict() {
        let policy = CasRetry::new(3);
        let mut calls = 0;
        let result: Result<()> = policy.run(
            "test",
            |_| {
                calls += 1;
                Err(Error::ConcurrencyConflict("busy".into()))
            },
            || {},
        );
        assert!(matches!(result, Err(Error::ConcurrencyConflict(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let policy = CasRetry::new(3);
        let mut calls = 0;
        let result: Result<()> = policy.run(
            "test",
            |_| {
                calls += 1;
                Err(Error::Validation("bad".into()))
            },
            || {},
        );
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(CasRetry::new(0).max_attempts(), 1);
    }

    #[test]
    fn test_expect_version() {
        assert!(expect_version("row", 4, 4).is_ok());
        assert!(matches!(
            expect_version("row", 4, 5),
            Err(Error::ConcurrencyConflict(_))
        ));
    }
}
