//! Per-dependency circuit breaker.
//!
//! `Closed` passes calls and counts consecutive failures. Reaching the threshold opens the
//! circuit; while `Open`, calls fail fast until the cooldown elapses. The first call after
//! the cooldown moves to `HalfOpen` and runs alone as a probe: success closes the circuit,
//! failure reopens it and restarts the cooldown.

use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Raised when a call is refused without reaching the dependency.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit `{name}` is open; retry in {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    /// Breaker name.
    pub name: String,
    /// Remaining cooldown.
    pub retry_after: Duration,
}

/// Outcome of [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The call was refused.
    #[error(transparent)]
    Open(CircuitOpenError),
    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub failures: u32,
}

/// Failure-isolation state machine for one dependency. Not shared across processes.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. Does not perform the open-to-half-open transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot for health endpoints.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
        }
    }

    /// Admits or refuses one call.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.config.cooldown {
                    info!(breaker = %self.name, "circuit half-open; admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.opened_at = Some(Instant::now());
                    Ok(())
                } else {
                    Err(self.refusal(self.config.cooldown.saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back (cancelled future) stops blocking
                // once a full cooldown has passed.
                let probe_age = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if inner.probe_in_flight && probe_age < self.config.cooldown {
                    Err(self.refusal(self.config.cooldown.saturating_sub(probe_age)))
                } else {
                    inner.probe_in_flight = true;
                    inner.opened_at = Some(Instant::now());
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, from = %inner.state, "circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                if inner.failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit opening due to failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Runs `call` through the breaker, recording its outcome.
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(BreakerError::Open)?;
        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn refusal(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }
}
