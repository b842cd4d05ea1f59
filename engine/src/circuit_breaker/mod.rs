//! Per-plugin circuit breaker
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                 │  ▲
//!     │ trial call succeeds      cooldown    │  │ trial call fails
//!     │                     elapses     ▼  │
//!     └──────────────────────────── HalfOpen
//! ```
//!
//! A half-open breaker admits exactly one trial call call. Everything else is
//! refused with `CircuitOpen` until the trial call's outcome is recorded, or until
//! the trial call is abandoned because it never reached the runtime.

use crate::sync::{lock, read, write};
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub plugin_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trial_at: Option<DateTime<Utc>>,
}

/// State change caused by a recorded outcome or a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTransition {
    /// Closed to open after too many consecutive failures
    Opened,
    /// A half-open trial call failed
    Reopened,
    /// A trial call succeeded or the breaker was reset
    Closed,
}

struct Breaker {
    state: CircuitBreakerState,
    opened_instant: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new(plugin_id: &str) -> Self {
        Self {
            state: CircuitBreakerState {
                plugin_id: plugin_id.to_string(),
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                opened_at: None,
                last_trial_at: None,
            },
            opened_instant: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state.state = CircuitState::Open;
        self.state.opened_at = Some(Utc::now());
        self.opened_instant = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state.state = CircuitState::Closed;
        self.state.consecutive_failures = 0;
        self.state.opened_at = None;
        self.opened_instant = None;
        self.trial_in_flight = false;
    }
}

pub struct CircuitBreaker {
    plugins: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn cell(&self, plugin_id: &str) -> Option<Arc<Mutex<Breaker>>> {
        read(&self.plugins).get(plugin_id).map(Arc::clone)
    }

    /// Start a fresh closed breaker for `plugin_id`
    pub fn register(&self, plugin_id: &str) {
        write(&self.plugins).insert(
            plugin_id.to_string(),
            Arc::new(Mutex::new(Breaker::new(plugin_id))),
        );
    }

    pub fn unregister(&self, plugin_id: &str) {
        write(&self.plugins).remove(plugin_id);
    }

    /// Ask whether a call may proceed
    ///
    /// `Ok(true)` means the call is the half-open trial call and its outcome must be
    /// recorded, or the trial call abandoned. Plugins without a breaker are not
    /// gated here.
    pub fn check(&self, plugin_id: &str) -> Result<bool, EngineError> {
        self.check_at(plugin_id, Instant::now())
    }

    pub fn check_at(&self, plugin_id: &str, now: Instant) -> Result<bool, EngineError> {
        let Some(cell) = self.cell(plugin_id) else {
            return Ok(false);
        };
        let mut breaker = lock(&cell);

        match breaker.state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_instant
                    .map_or(self.cooldown, |at| now.saturating_duration_since(at));
                if elapsed >= self.cooldown {
                    breaker.state.state = CircuitState::HalfOpen;
                    breaker.state.last_trial_at = Some(Utc::now());
                    breaker.trial_in_flight = true;
                    info!(plugin_id, "Circuit half-open, admitting trial call");
                    Ok(true)
                } else {
                    let remaining = self.cooldown - elapsed;
                    Err(EngineError::CircuitOpen {
                        plugin_id: plugin_id.to_string(),
                        retry_after_ms: remaining.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    Err(EngineError::CircuitOpen {
                        plugin_id: plugin_id.to_string(),
                        retry_after_ms: 0,
                    })
                } else {
                    breaker.trial_in_flight = true;
                    breaker.state.last_trial_at = Some(Utc::now());
                    Ok(true)
                }
            }
        }
    }

    /// Record a call outcome
    ///
    /// `is_trial` is the value `check` returned when the call was admitted.
    /// While half-open only the admitted trial call moves the state; calls
    /// that started before the circuit opened are counted but change nothing.
    pub fn record(
        &self,
        plugin_id: &str,
        success: bool,
        is_trial: bool,
    ) -> Option<BreakerTransition> {
        self.record_at(plugin_id, success, is_trial, Instant::now())
    }

    pub fn record_at(
        &self,
        plugin_id: &str,
        success: bool,
        is_trial: bool,
        now: Instant,
    ) -> Option<BreakerTransition> {
        let cell = self.cell(plugin_id)?;
        let mut breaker = lock(&cell);
        let half_open = breaker.state.state == CircuitState::HalfOpen;

        if success {
            breaker.state.total_successes += 1;
            if half_open && is_trial {
                breaker.close();
                info!(plugin_id, "Circuit closed after successful trial call");
                return Some(BreakerTransition::Closed);
            }
            if breaker.state.state == CircuitState::Closed {
                breaker.state.consecutive_failures = 0;
            }
            return None;
        }

        breaker.state.total_failures += 1;
        if half_open && !is_trial {
            debug!(plugin_id, "Ignoring stale failure while half-open");
            return None;
        }
        breaker.state.consecutive_failures = breaker.state.consecutive_failures.saturating_add(1);

        match breaker.state.state {
            CircuitState::Closed if breaker.state.consecutive_failures >= self.failure_threshold => {
                breaker.open(now);
                error!(
                    plugin_id,
                    failures = breaker.state.consecutive_failures,
                    "Circuit opened"
                );
                Some(BreakerTransition::Opened)
            }
            CircuitState::HalfOpen => {
                breaker.open(now);
                warn!(plugin_id, "Trial call failed, circuit reopened");
                Some(BreakerTransition::Reopened)
            }
            _ => None,
        }
    }

    /// Release a half-open trial call slot that never reached the runtime
    pub fn abandon_trial(&self, plugin_id: &str) {
        if let Some(cell) = self.cell(plugin_id) {
            let mut breaker = lock(&cell);
            if breaker.state.state == CircuitState::HalfOpen {
                breaker.trial_in_flight = false;
            }
        }
    }

    /// Force the breaker closed
    pub fn reset(&self, plugin_id: &str) -> Result<Option<BreakerTransition>, EngineError> {
        let cell = self
            .cell(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("circuit breaker for {}", plugin_id)))?;
        let mut breaker = lock(&cell);
        let was_closed = breaker.state.state == CircuitState::Closed;
        breaker.close();
        info!(plugin_id, "Circuit breaker reset");
        Ok((!was_closed).then_some(BreakerTransition::Closed))
    }

    pub fn state(&self, plugin_id: &str) -> Option<CircuitBreakerState> {
        self.cell(plugin_id).map(|cell| lock(&cell).state.clone())
    }

    pub fn all_states(&self) -> Vec<CircuitBreakerState> {
        let cells: Vec<Arc<Mutex<Breaker>>> = read(&self.plugins).values().map(Arc::clone).collect();
        let mut states: Vec<CircuitBreakerState> =
            cells.iter().map(|cell| lock(cell).state.clone()).collect();
        states.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_millis(1_000);

    fn breaker() -> CircuitBreaker {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        breaker.register("p1");
        breaker
    }

    fn trip(breaker: &CircuitBreaker, now: Instant) {
        for _ in 0..3 {
            breaker.record_at("p1", false, false, now);
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker();
        let now = Instant::now();

        assert_eq!(breaker.record_at("p1", false, false, now), None);
        assert_eq!(breaker.record_at("p1", false, false, now), None);
        assert_eq!(
            breaker.record_at("p1", false, false, now),
            Some(BreakerTransition::Opened)
        );

        let err = breaker.check_at("p1", now).unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { retry_after_ms, .. } if retry_after_ms == 1_000));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = breaker();
        let now = Instant::now();
        breaker.record_at("p1", false, false, now);
        breaker.record_at("p1", false, false, now);
        breaker.record_at("p1", true, false, now);
        breaker.record_at("p1", false, false, now);

        let state = breaker.state("p1").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.total_failures, 3);
        assert_eq!(state.total_successes, 1);
    }

    #[test]
    fn test_half_open_admits_single_trial_call() {
        let breaker = breaker();
        let start = Instant::now();
        trip(&breaker, start);

        let later = start + COOLDOWN;
        assert!(breaker.check_at("p1", later).unwrap());
        assert_eq!(breaker.state("p1").unwrap().state, CircuitState::HalfOpen);
        assert!(breaker.check_at("p1", later).is_err());

        assert_eq!(
            breaker.record_at("p1", true, true, later),
            Some(BreakerTransition::Closed)
        );
        assert!(!breaker.check_at("p1", later).unwrap());
        assert_eq!(breaker.state("p1").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_failed_trial_call_restarts_cooldown() {
        let breaker = breaker();
        let start = Instant::now();
        trip(&breaker, start);

        let trial_at = start + COOLDOWN;
        breaker.check_at("p1", trial_at).unwrap();
        assert_eq!(
            breaker.record_at("p1", false, true, trial_at),
            Some(BreakerTransition::Reopened)
        );

        assert!(breaker
            .check_at("p1", trial_at + Duration::from_millis(500))
            .is_err());
        assert!(breaker.check_at("p1", trial_at + COOLDOWN).is_ok());
    }

    #[test]
    fn test_abandoned_trial_frees_slot() {
        let breaker = breaker();
        let start = Instant::now();
        trip(&breaker, start);

        let later = start + COOLDOWN;
        breaker.check_at("p1", later).unwrap();
        breaker.abandon_trial("p1");
        assert!(breaker.check_at("p1", later).is_ok());
    }

    #[test]
    fn test_reset_and_unknown_plugins() {
        let breaker = breaker();
        trip(&breaker, Instant::now());

        assert_eq!(breaker.reset("p1").unwrap(), Some(BreakerTransition::Closed));
        assert_eq!(breaker.reset("p1").unwrap(), None);
        assert!(breaker.check("p1").is_ok());

        assert!(breaker.check("ghost").is_ok());
        assert_eq!(breaker.record("ghost", false, false), None);
        assert!(breaker.reset("ghost").is_err());
    }

    #[test]
    fn test_stale_outcomes_leave_half_open_alone() {
        let breaker = breaker();
        let start = Instant::now();
        trip(&breaker, start);

        let later = start + COOLDOWN;
        assert!(breaker.check_at("p1", later).unwrap());

        // Calls admitted while closed finish during the trial call
        assert_eq!(breaker.record_at("p1", true, false, later), None);
        assert_eq!(breaker.record_at("p1", false, false, later), None);
        assert_eq!(breaker.state("p1").unwrap().state, CircuitState::HalfOpen);
        assert!(breaker.check_at("p1", later).is_err());

        assert_eq!(
            breaker.record_at("p1", true, true, later),
            Some(BreakerTransition::Closed)
        );
        let state = breaker.state("p1").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.total_successes, 2);
        assert_eq!(state.total_failures, 4);
    }
}
