//! Reconnect policy.
//!
//! The pool consults [`ReconnectPolicy::decide`] every time a connection
//! fails: a connect error, a peer close, or a broken stream. Local teardown
//! (last subscriber gone, [`shutdown`](crate::ConnectionPool::shutdown))
//! never reaches the policy.
//!
//! The count is of consecutive failures. Opening a socket does not clear it;
//! only a connection that proves healthy does, by delivering a frame or by
//! staying up for [`HEALTHY_UPTIME`]. A peer that accepts and immediately
//! drops the socket therefore still exhausts a bounded policy.
//!
//! ```text
//! Open ──failure n < max──▶ Reconnecting(n) ──delay──▶ Connecting ──▶ Open
//!   │
//!   └──failure n = max──▶ Reconnecting(max) ──▶ Closed(Exhausted)
//! ```

use std::time::Duration;

use tether_settings::PoolSettings;

/// Default fixed delay between attempts in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
/// Default attempt cap for [`ReconnectPolicy::bounded`] callers that have no
/// configured value.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Uptime after which a connection counts as healthy even if it never
/// delivered a frame.
pub const HEALTHY_UPTIME: Duration = Duration::from_secs(30);

/// When and whether to retry a failed connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry forever while at least one subscriber remains.
    Unbounded {
        /// Fixed delay before each attempt.
        delay: Duration,
    },
    /// Give up after `max_attempts` consecutive failures.
    Bounded {
        /// Fixed delay before each attempt.
        delay: Duration,
        /// Attempt cap.
        max_attempts: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS))
    }
}

impl ReconnectPolicy {
    /// Retry forever with a fixed delay.
    pub fn unbounded(delay: Duration) -> Self {
        Self::Unbounded { delay }
    }

    /// Give up after `max_attempts` consecutive failures, with a fixed delay
    /// between attempts.
    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self::Bounded {
            delay,
            max_attempts,
        }
    }

    /// Policy described by pool settings: bounded when an attempt cap is set.
    pub fn from_settings(settings: &PoolSettings) -> Self {
        let delay = Duration::from_millis(settings.reconnect_delay_ms);
        match settings.max_reconnect_attempts {
            Some(max) => Self::bounded(delay, max),
            None => Self::unbounded(delay),
        }
    }

    /// Delay before each attempt.
    pub fn delay(&self) -> Duration {
        match *self {
            Self::Unbounded { delay } | Self::Bounded { delay, .. } => delay,
        }
    }

    /// Attempt cap, if any.
    pub fn max_attempts(&self) -> Option<u32> {
        match *self {
            Self::Unbounded { .. } => None,
            Self::Bounded { max_attempts, .. } => Some(max_attempts),
        }
    }

    /// Record a failure and decide what happens next.
    ///
    /// Failure number `n` yields `Retry { attempt: n }` until `n` reaches the
    /// cap, which yields `Exhausted`. The count never passes the cap.
    pub fn decide(&self, state: &mut ReconnectState, has_subscribers: bool) -> ReconnectDecision {
        if !has_subscribers {
            return ReconnectDecision::Stop;
        }
        match self.max_attempts() {
            Some(max) => {
                if state.attempt < max {
                    state.attempt += 1;
                }
                if state.attempt >= max {
                    return ReconnectDecision::Exhausted {
                        attempts: state.attempt,
                    };
                }
            }
            None => state.attempt = state.attempt.saturating_add(1),
        }
        ReconnectDecision::Retry {
            attempt: state.attempt,
            delay: self.delay(),
        }
    }
}

/// Consecutive failures for one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    /// Failures since the connection last proved healthy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called once a connection proves healthy.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Whether a connection that is ending, or still up, has proved healthy.
pub fn proved_healthy(received_frame: bool, uptime: Duration) -> bool {
    received_frame || uptime >= HEALTHY_UPTIME
}

/// Outcome of [`ReconnectPolicy::decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make attempt number `attempt`.
    Retry {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The cap is reached; the connection stays closed until resubscribed.
    Exhausted {
        /// Consecutive failures, equal to the cap.
        attempts: u32,
    },
    /// Nobody is listening any more.
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(3000);

    #[test]
    fn default_is_unbounded_3s() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(), DELAY);
        assert_eq!(policy.max_attempts(), None);
    }

    #[test]
    fn unbounded_keeps_retrying() {
        let policy = ReconnectPolicy::unbounded(DELAY);
        let mut state = ReconnectState::default();
        for expected in 1..=50 {
            assert_eq!(
                policy.decide(&mut state, true),
                ReconnectDecision::Retry {
                    attempt: expected,
                    delay: DELAY
                }
            );
        }
    }

    #[test]
    fn bounded_exhausts_on_the_capped_failure() {
        let policy = ReconnectPolicy::bounded(DELAY, 3);
        let mut state = ReconnectState::default();
        let attempts: Vec<_> = (0..2)
            .map(|_| match policy.decide(&mut state, true) {
                ReconnectDecision::Retry { attempt, .. } => attempt,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(
            policy.decide(&mut state, true),
            ReconnectDecision::Exhausted { attempts: 3 }
        );
        // Stays exhausted.
        assert_eq!(
            policy.decide(&mut state, true),
            ReconnectDecision::Exhausted { attempts: 3 }
        );
        assert_eq!(state.attempt(), 3);
    }

    #[test]
    fn zero_cap_exhausts_on_first_failure() {
        let policy = ReconnectPolicy::bounded(DELAY, 0);
        let mut state = ReconnectState::default();
        assert_eq!(
            policy.decide(&mut state, true),
            ReconnectDecision::Exhausted { attempts: 0 }
        );
    }

    #[test]
    fn health_needs_a_frame_or_uptime() {
        assert!(!proved_healthy(false, Duration::ZERO));
        assert!(!proved_healthy(false, HEALTHY_UPTIME - Duration::from_millis(1)));
        assert!(proved_healthy(false, HEALTHY_UPTIME));
        assert!(proved_healthy(true, Duration::ZERO));
    }

    #[test]
    fn no_subscribers_stops() {
        let policy = ReconnectPolicy::unbounded(DELAY);
        let mut state = ReconnectState::default();
        assert_eq!(policy.decide(&mut state, false), ReconnectDecision::Stop);
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn reset_restarts_count() {
        let policy = ReconnectPolicy::bounded(DELAY, 3);
        let mut state = ReconnectState::default();
        let _ = policy.decide(&mut state, true);
        let _ = policy.decide(&mut state, true);
        assert_eq!(state.attempt(), 2);

        state.reset();
        assert_eq!(
            policy.decide(&mut state, true),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: DELAY
            }
        );
    }

    #[test]
    fn from_settings_picks_variant() {
        let mut settings = PoolSettings::default();
        assert_eq!(
            ReconnectPolicy::from_settings(&settings),
            ReconnectPolicy::unbounded(DELAY)
        );

        settings.max_reconnect_attempts = Some(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        settings.reconnect_delay_ms = 50;
        assert_eq!(
            ReconnectPolicy::from_settings(&settings),
            ReconnectPolicy::bounded(Duration::from_millis(50), 10)
        );
    }
}
