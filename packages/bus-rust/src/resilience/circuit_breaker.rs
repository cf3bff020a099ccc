//! Circuit breaker decorator.
//!
//! The breaker fast-fails calls once the wrapped handler has failed
//! `failure_threshold` times in a row, then lets a single trial call through
//! after `cooldown_period` to probe for recovery:
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected with `BusError::CircuitOpen` until the cooldown elapses
//! - **HalfOpen**: one trial call is in flight; its outcome closes or reopens the circuit

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ClockSource, Dispatchable, SystemClock};
use parking_lot::Mutex;

use crate::error::BusError;
use crate::handler::Handler;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a [`CircuitBreakerHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub cooldown_period: Duration,
    /// Window after which an old failure streak no longer counts. When a
    /// failure arrives more than this long after the previous one, counting
    /// starts over. `None` keeps the streak until a success.
    pub reset_timeout: Option<Duration>,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_period: Duration::from_secs(30),
            reset_timeout: None,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Earliest time (ms) a trial call may run while open.
    next_attempt_at: u64,
    last_failure_at: Option<u64>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            next_attempt_at: 0,
            last_failure_at: None,
        }
    }
}

/// Records an admitted call as failed if its future is dropped before the
/// wrapped handler resolves, e.g. when a timeout middleware cancels it.
struct CallGuard<'a, H> {
    breaker: &'a CircuitBreakerHandler<H>,
    message_type: &'a str,
    trial: bool,
    armed: bool,
}

impl<H> CallGuard<'_, H> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<H> Drop for CallGuard<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker
                .record_failure(self.trial, self.message_type, &"call cancelled before completion");
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerHandler
// ---------------------------------------------------------------------------

/// Handler decorator implementing the circuit breaker state machine.
///
/// State belongs to this instance. Share one breaker across registrations by
/// wrapping it in an `Arc`. The state lock is never held while the wrapped
/// handler runs. A call that is cancelled before the wrapped handler resolves
/// counts as a failure, so a hung downstream behind a timeout still trips the
/// circuit.
pub struct CircuitBreakerHandler<H> {
    inner: H,
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn ClockSource>,
    state: Mutex<BreakerState>,
}

impl<H> CircuitBreakerHandler<H> {
    /// Creates a breaker that reads time from the system clock.
    #[must_use]
    pub fn new(inner: H, policy: CircuitBreakerPolicy) -> Self {
        Self::with_clock(inner, policy, Arc::new(SystemClock))
    }

    /// Creates a breaker with an injected clock.
    #[must_use]
    pub fn with_clock(inner: H, policy: CircuitBreakerPolicy, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            inner,
            policy,
            clock,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    #[must_use]
    pub fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    #[must_use]
    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Forces the circuit closed and clears the failure streak.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::closed();
        tracing::info!("circuit manually reset");
    }

    /// Decides whether a call may proceed. `Ok(true)` marks the trial call.
    fn admit(&self, message_type: &str) -> Result<bool, BusError> {
        let now = self.clock.now();
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open if now < s.next_attempt_at => Err(BusError::CircuitOpen {
                retry_after_ms: s.next_attempt_at - now,
            }),
            CircuitState::Open => {
                s.state = CircuitState::HalfOpen;
                tracing::info!(message_type, "circuit half-open, probing");
                Ok(true)
            }
            // The trial call is still running.
            CircuitState::HalfOpen => Err(BusError::CircuitOpen { retry_after_ms: 0 }),
        }
    }

    fn record_success(&self, trial: bool, message_type: &str) {
        let mut s = self.state.lock();
        if trial {
            s.state = CircuitState::Closed;
            tracing::info!(message_type, "circuit closed");
        }
        if s.state == CircuitState::Closed {
            s.failure_count = 0;
            s.last_failure_at = None;
        }
    }

    fn record_failure(&self, trial: bool, message_type: &str, err: &dyn fmt::Display) {
        let now = self.clock.now();
        let cooldown_ms = u64::try_from(self.policy.cooldown_period.as_millis()).unwrap_or(u64::MAX);
        let mut s = self.state.lock();

        if trial {
            s.state = CircuitState::Open;
            s.next_attempt_at = now.saturating_add(cooldown_ms);
            s.last_failure_at = Some(now);
            tracing::warn!(message_type, error = %err, "trial call failed, circuit reopened");
            return;
        }

        if s.state != CircuitState::Closed {
            // A call admitted before the circuit opened; the streak is already decided.
            return;
        }

        if let (Some(window), Some(last)) = (self.policy.reset_timeout, s.last_failure_at) {
            let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
            if now.saturating_sub(last) > window_ms {
                s.failure_count = 0;
            }
        }

        s.failure_count += 1;
        s.last_failure_at = Some(now);

        if s.failure_count >= self.policy.failure_threshold {
            s.state = CircuitState::Open;
            s.next_attempt_at = now.saturating_add(cooldown_ms);
            tracing::warn!(
                message_type,
                failures = s.failure_count,
                cooldown_ms,
                error = %err,
                "circuit opened"
            );
        }
    }
}

impl<H> fmt::Debug for CircuitBreakerHandler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerHandler")
            .field("policy", &self.policy)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<M, H> Handler<M> for CircuitBreakerHandler<H>
where
    M: Dispatchable,
    H: Handler<M>,
{
    fn can_handle(&self, message: &M) -> bool {
        self.inner.can_handle(message)
    }

    async fn handle(&self, message: &M) -> Result<M::Reply, BusError> {
        let message_type = message.message_type();
        let trial = match self.admit(message_type) {
            Ok(trial) => trial,
            Err(err) => {
                tracing::debug!(message_type, "circuit open, call rejected");
                return Err(err);
            }
        };

        let guard = CallGuard {
            breaker: self,
            message_type,
            trial,
            armed: true,
        };
        let result = self.inner.handle(message).await;
        guard.disarm();

        match &result {
            Ok(_) => self.record_success(trial, message_type),
            Err(err) => self.record_failure(trial, message_type, err),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
