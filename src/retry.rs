//! Bounded retries with cancellation and deadlines.
//!
//! Every wait in the crate (lock acquisition, visibility polling) goes
//! through [`RetryPolicy::run`] and a [`CallContext`]. The context lets a
//! caller cancel a call or bound its total latency; without one, the full
//! retry budget elapses before the call gives up.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default number of attempts for lock acquisition and visibility polling.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Default delay between attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Why a wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The caller cancelled the call.
    Cancelled,
    /// The call's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled by caller"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Cloneable cancellation signal.
///
/// Cancelling drops the only sender of an internal channel, which wakes every
/// clone blocked in [`CallContext::sleep`] at once.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    signal: Receiver<()>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            signal: rx,
            trigger: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Cancels the token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        let mut trigger = match self.trigger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        trigger.take();
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call cancellation token and optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Context bound to an existing cancellation token.
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Returns this context with a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns this context with an absolute deadline. An earlier existing
    /// deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// The cancellation token of this context.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails if the context is cancelled or past its deadline.
    ///
    /// # Errors
    /// Returns the reason the call must stop.
    pub fn check(&self) -> Result<(), Interruption> {
        if self.token.is_cancelled() {
            return Err(Interruption::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interruption::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration`, waking early on cancellation and never past
    /// the deadline.
    ///
    /// # Errors
    /// Returns the interruption if the sleep could not complete.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interruption> {
        self.check()?;
        let (wait, truncated) = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining < duration {
                    (remaining, true)
                } else {
                    (duration, false)
                }
            }
            None => (duration, false),
        };

        match self.token.signal.recv_timeout(wait) {
            Err(RecvTimeoutError::Disconnected) => Err(Interruption::Cancelled),
            Err(RecvTimeoutError::Timeout) | Ok(()) => {
                if truncated {
                    Err(Interruption::DeadlineExceeded)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Outcome of one attempt inside [`RetryPolicy::run`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Done; stop retrying.
    Ready(T),
    /// Not yet; retry after the next delay.
    Pending,
    /// Failed in a way worth retrying; remembered as the last error.
    Failed(E),
    /// Failed in a way that retrying cannot fix.
    Abort(E),
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt came back pending or failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the last failed attempt, if any failed.
        last_error: Option<E>,
    },
    /// An attempt aborted.
    Aborted(E),
    /// The call context stopped the loop.
    Interrupted {
        /// Reason.
        interruption: Interruption,
        /// Attempts made before the interruption.
        attempts: u32,
        /// Error of the last failed attempt, if any failed.
        last_error: Option<E>,
    },
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Bounded retry schedule.
///
/// Attempt 0 runs immediately. Attempt `k > 0` waits
/// `initial_delay * multiplier^(k-1)`, capped at `max_delay`; with `jitter`
/// the wait is drawn uniformly from the upper half of that value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Randomise delays to spread contending callers.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(MAX_RETRY_ATTEMPTS, RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Constant delay between attempts.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Exponential backoff with jitter.
    #[must_use]
    pub const fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Returns this policy with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Upper bound of the delay before `attempt`, before jitter.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.max(self.initial_delay).as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Delay to wait before `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        rand::thread_rng().gen_range(nominal / 2..=nominal)
    }

    /// Worst-case total time spent waiting between attempts.
    #[must_use]
    pub fn budget(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.nominal_delay(attempt))
            .sum()
    }

    /// Runs `op` until it is ready, aborts, or the budget is spent.
    ///
    /// `op` receives the 0-based attempt number.
    ///
    /// # Errors
    /// See [`RetryError`].
    pub fn run<T, E>(
        &self,
        ctx: &CallContext,
        mut op: impl FnMut(u32) -> Attempt<T, E>,
    ) -> Result<T, RetryError<E>> {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let waited = if attempt == 0 {
                ctx.check()
            } else {
                ctx.sleep(self.delay_for(attempt))
            };
            if let Err(interruption) = waited {
                return Err(RetryError::Interrupted {
                    interruption,
                    attempts: attempt,
                    last_error,
                });
            }

            match op(attempt) {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Pending => {}
                Attempt::Failed(e) => last_error = Some(e),
                Attempt::Abort(e) => return Err(RetryError::Aborted(e)),
            }
        }

        Err(RetryError::Exhausted {
            attempts,
            last_error,
        })
    }
}
