//! Circuit breakers keyed by downstream resource name.
//!
//! Breakers are shared by every caller using the same name: the failure
//! signal describes the dependency, not the session. All transitions for all
//! names happen under one lock, so they are linearizable; when several
//! failure reports race past `max_fails`, exactly one performs the
//! `closed → open` transition and the rest are no-ops.
//!
//! ```text
//! closed ──max_fails consecutive failures──▶ open
//!   ▲                                          │ reset_timeout elapsed
//!   └──── trial succeeds ──── half_open ◀──────┘
//!                                 │ trial fails
//!                                 └──────────────▶ open (timeout restarts)
//! ```

use crate::errors::GuardError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub max_fails: u32,
    pub reset_timeout: Duration,
}

/// Observable breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub name: String,
    pub status: CircuitStatus,
    pub fail_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// What a caller was let through with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    /// Ordinary call through a closed breaker.
    Normal,
    /// The single trial call of a half-open breaker.
    Trial,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    config: BreakerConfig,
    trial_in_flight: bool,
}

impl Breaker {
    fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            state: CircuitState {
                name: name.to_string(),
                status: CircuitStatus::Closed,
                fail_count: 0,
                opened_at: None,
            },
            config,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state.status = CircuitStatus::Open;
        self.state.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state.status = CircuitStatus::Closed;
        self.state.fail_count = 0;
        self.state.opened_at = None;
        self.trial_in_flight = false;
    }

    fn blocked(&self, retry_after: Duration) -> GuardError {
        GuardError::CircuitOpen {
            name: self.state.name.clone(),
            status: self.state.status,
            fail_count: self.state.fail_count,
            retry_after: retry_after.to_std().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitRegistry {
    breakers: Arc<Mutex<HashMap<String, Breaker>>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, name: &str, config: BreakerConfig) -> Result<CircuitPermit, GuardError> {
        self.acquire_at(Utc::now(), name, config)
    }

    /// Ask to call through breaker `name` at `now`.
    ///
    /// The first caller to name a breaker fixes its configuration.
    pub fn acquire_at(
        &self,
        now: DateTime<Utc>,
        name: &str,
        config: BreakerConfig,
    ) -> Result<CircuitPermit, GuardError> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers
            .entry(name.to_string())
            .or_insert_with(|| Breaker::new(name, config));
        if breaker.config != config {
            warn!(
                breaker = name,
                max_fails = breaker.config.max_fails,
                requested_max_fails = config.max_fails,
                "breaker already registered with a different config; keeping the first"
            );
        }

        match breaker.state.status {
            CircuitStatus::Closed => Ok(CircuitPermit::Normal),
            CircuitStatus::Open => {
                let opened_at = breaker.state.opened_at.unwrap_or(now);
                match opened_at.checked_add_signed(breaker.config.reset_timeout) {
                    Some(reopen_at) if now >= reopen_at => {
                        info!(breaker = name, "circuit half-open, admitting one trial call");
                        breaker.state.status = CircuitStatus::HalfOpen;
                        breaker.trial_in_flight = true;
                        Ok(CircuitPermit::Trial)
                    }
                    Some(reopen_at) => Err(breaker.blocked(reopen_at - now)),
                    None => Err(breaker.blocked(breaker.config.reset_timeout)),
                }
            }
            CircuitStatus::HalfOpen => {
                if breaker.trial_in_flight {
                    Err(breaker.blocked(Duration::zero()))
                } else {
                    breaker.trial_in_flight = true;
                    Ok(CircuitPermit::Trial)
                }
            }
        }
    }

    /// Report a successful call made under `permit`.
    pub fn record_success(&self, name: &str, permit: CircuitPermit) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(breaker) = breakers.get_mut(name) else {
            return;
        };
        match (breaker.state.status, permit) {
            (CircuitStatus::Closed, _) => breaker.state.fail_count = 0,
            (CircuitStatus::HalfOpen, CircuitPermit::Trial) => {
                info!(breaker = name, "trial call succeeded, circuit closed");
                breaker.close();
            }
            // Late results from calls admitted before the breaker tripped do
            // not decide recovery; only the trial does.
            _ => debug!(breaker = name, "ignoring stale success report"),
        }
    }

    pub fn record_failure(&self, name: &str, permit: CircuitPermit) -> Option<CircuitStatus> {
        self.record_failure_at(Utc::now(), name, permit)
    }

    /// Report a failed call made under `permit`; returns the resulting status.
    pub fn record_failure_at(
        &self,
        now: DateTime<Utc>,
        name: &str,
        permit: CircuitPermit,
    ) -> Option<CircuitStatus> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.get_mut(name)?;
        match (breaker.state.status, permit) {
            (CircuitStatus::Closed, _) => {
                breaker.state.fail_count += 1;
                if breaker.state.fail_count >= breaker.config.max_fails {
                    warn!(
                        breaker = name,
                        failures = breaker.state.fail_count,
                        "circuit opened after consecutive failures"
                    );
                    breaker.open(now);
                }
            }
            (CircuitStatus::HalfOpen, CircuitPermit::Trial) => {
                breaker.state.fail_count += 1;
                warn!(breaker = name, "trial call failed, circuit re-opened");
                breaker.open(now);
            }
            _ => debug!(breaker = name, "ignoring stale failure report"),
        }
        Some(breaker.state.status)
    }

    /// Give back a trial permit whose call never ran.
    pub fn abandon_trial(&self, name: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(breaker) = breakers.get_mut(name) {
            if breaker.state.status == CircuitStatus::HalfOpen {
                breaker.trial_in_flight = false;
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.get(name).map(|b| b.state.clone())
    }

    /// Force a breaker back to closed.
    pub fn reset(&self, name: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(breaker) = breakers.get_mut(name) {
            info!(breaker = name, "circuit reset");
            breaker.close();
        }
    }
}
