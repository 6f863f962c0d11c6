use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for calls to external systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is the 1-based
    /// number of the attempt that just failed. A server-supplied hint wins
    /// when it is longer than the computed backoff, but never exceeds the cap.
    pub fn delay_after(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let backoff = self
            .base_delay_ms
            .saturating_mul(1_u64 << exp)
            .min(self.max_delay_ms);
        let backoff = Duration::from_millis(backoff);
        let cap = Duration::from_millis(self.max_delay_ms);
        match hint {
            Some(h) if h > backoff => h.min(cap),
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is
    /// spent. `classify` maps an error to `Some(hint)` when it is transient and
    /// `None` when retrying cannot help.
    ///
    /// Returns the final result and the number of attempts made.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        classify: impl Fn(&E) -> Option<Option<Duration>>,
    ) -> (Result<T, E>, u32) {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return (Ok(v), attempt),
                Err(e) => {
                    let Some(hint) = classify(&e) else {
                        return (Err(e), attempt);
                    };
                    if attempt >= max {
                        return (Err(e), attempt);
                    }
                    let delay = self.delay_after(attempt, hint);
                    tracing::warn!(attempt, max, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_after(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay_after(5, None), Duration::from_millis(1_000));
    }

    #[test]
    fn longer_hint_wins_but_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        };
        assert_eq!(
            policy.delay_after(1, Some(Duration::from_millis(750))),
            Duration::from_millis(750)
        );
        assert_eq!(
            policy.delay_after(1, Some(Duration::from_secs(60))),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            policy.delay_after(2, Some(Duration::from_millis(10))),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn run_stops_at_budget() {
        let calls = Cell::new(0);
        let (result, attempts) = RetryPolicy::immediate(3).run(
            || {
                calls.set(calls.get() + 1);
                Err::<(), _>("busy")
            },
            |_| Some(None),
        );
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn run_does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let (result, attempts) = RetryPolicy::immediate(5).run(
            || {
                calls.set(calls.get() + 1);
                Err::<(), _>("gone")
            },
            |_| None,
        );
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn run_returns_first_success() {
        let calls = Cell::new(0);
        let (result, attempts) = RetryPolicy::immediate(5).run(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy")
                } else {
                    Ok(calls.get())
                }
            },
            |_| Some(None),
        );
        assert_eq!(result, Ok(3));
        assert_eq!(attempts, 3);
    }
}
