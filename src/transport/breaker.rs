//! Circuit breaker over network-level failures.
//!
//! CLOSED -> (failures >= threshold) -> OPEN -> (cool-down elapsed) ->
//! HALF_OPEN -> (trial success) -> CLOSED, or (trial failure) -> OPEN with
//! the timer reset. Only failures where no response arrived are counted;
//! any HTTP response, whatever its status, counts as a success.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
  state: CircuitState,
  consecutive_failures: u32,
  opened_at: Option<Instant>,
  trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
  inner: Mutex<BreakerState>,
  threshold: u32,
  cooldown: Duration,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
  /// Still closed, or already open
  None,
  /// This failure moved the circuit from CLOSED to OPEN
  Opened,
  /// A half-open trial failed and the circuit re-opened
  Reopened,
}

impl CircuitBreaker {
  pub fn new(threshold: u32, cooldown: Duration) -> Self {
    Self {
      inner: Mutex::new(BreakerState {
        state: CircuitState::Closed,
        consecutive_failures: 0,
        opened_at: None,
        trial_in_flight: false,
      }),
      threshold: threshold.max(1),
      cooldown,
    }
  }

  fn lock(&self) -> MutexGuard<'_, BreakerState> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Current state, without promoting OPEN to HALF_OPEN.
  pub fn state(&self) -> CircuitState {
    self.lock().state
  }

  pub fn consecutive_failures(&self) -> u32 {
    self.lock().consecutive_failures
  }

  pub fn is_open(&self) -> bool {
    self.state() == CircuitState::Open
  }

  /// Ask to make one network attempt.
  ///
  /// Fails fast with `CircuitOpen` while open. Once the cool-down has
  /// elapsed a single trial permit is handed out and the circuit is
  /// HALF_OPEN until that trial settles.
  pub fn acquire(&self) -> Result<Permit<'_>, TransportError> {
    let mut inner = self.lock();

    match inner.state {
      CircuitState::Closed => Ok(Permit::new(self, false)),
      CircuitState::Open => {
        let cooled = inner
          .opened_at
          .map(|t| t.elapsed() >= self.cooldown)
          .unwrap_or(true);
        if !cooled {
          return Err(TransportError::CircuitOpen);
        }
        inner.state = CircuitState::HalfOpen;
        inner.trial_in_flight = true;
        info!("Circuit half-open, allowing trial request");
        Ok(Permit::new(self, true))
      }
      CircuitState::HalfOpen => {
        if inner.trial_in_flight {
          return Err(TransportError::CircuitOpen);
        }
        inner.trial_in_flight = true;
        Ok(Permit::new(self, true))
      }
    }
  }

  fn on_success(&self, trial: bool) {
    let mut inner = self.lock();
    match inner.state {
      CircuitState::Closed => inner.consecutive_failures = 0,
      CircuitState::HalfOpen if trial => {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!("Circuit closed after successful trial");
      }
      // A straggler from before the trip does not close the circuit
      _ => {}
    }
  }

  fn on_failure(&self, trial: bool) -> Trip {
    let mut inner = self.lock();
    match inner.state {
      CircuitState::Closed => {
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold {
          inner.state = CircuitState::Open;
          inner.opened_at = Some(Instant::now());
          warn!(
            failures = inner.consecutive_failures,
            "Circuit opened after consecutive network failures"
          );
          Trip::Opened
        } else {
          Trip::None
        }
      }
      CircuitState::HalfOpen if trial => {
        inner.consecutive_failures += 1;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        warn!("Circuit trial failed, re-opening");
        Trip::Reopened
      }
      _ => Trip::None,
    }
  }

  fn on_abandon(&self) {
    let mut inner = self.lock();
    if inner.state == CircuitState::HalfOpen {
      inner.trial_in_flight = false;
    }
  }
}

/// Permission for one network attempt. Settle it with `success` or
/// `failure`; dropping it unsettled releases a half-open trial slot.
#[must_use]
pub struct Permit<'a> {
  breaker: &'a CircuitBreaker,
  trial: bool,
  settled: bool,
}

impl<'a> Permit<'a> {
  fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
    Self {
      breaker,
      trial,
      settled: false,
    }
  }

  /// A response was received.
  pub fn success(mut self) {
    self.settled = true;
    self.breaker.on_success(self.trial);
  }

  /// No response was received.
  pub fn failure(mut self) -> Trip {
    self.settled = true;
    self.breaker.on_failure(self.trial)
  }
}

impl Drop for Permit<'_> {
  fn drop(&mut self) {
    if !self.settled && self.trial {
      self.breaker.on_abandon();
    }
  }
}
