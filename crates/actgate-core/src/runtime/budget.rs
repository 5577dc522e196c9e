//! Budget ledger: cumulative cost against a limit, per session/user/tenant.
//!
//! Charges are post-hoc (the cost has already been incurred), so the ledger
//! never rolls anything back; it only stops *future* calls. Every charge is
//! a single check-and-increment under one lock per scope, so concurrent
//! callers can never push `used` past `limit`.

use crate::errors::GuardError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    #[default]
    Usd,
    Tokens,
}

impl std::fmt::Display for BudgetUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usd => f.write_str("usd"),
            Self::Tokens => f.write_str("tokens"),
        }
    }
}

/// Who a budget belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BudgetScope {
    Session(String),
    User(String),
    Tenant(String),
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{}", id),
            Self::User(id) => write!(f, "user:{}", id),
            Self::Tenant(id) => write!(f, "tenant:{}", id),
        }
    }
}

/// Point-in-time view of a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub scope: BudgetScope,
    pub limit: f64,
    pub used: f64,
    pub unit: BudgetUnit,
}

impl BudgetSnapshot {
    pub fn remaining(&self) -> f64 {
        (self.limit - self.used).max(0.0)
    }
}

#[derive(Debug)]
struct BudgetState {
    limit: f64,
    used: f64,
    unit: BudgetUnit,
}

/// Shared handle to one budget scope. Clones charge the same ledger.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    scope: BudgetScope,
    state: Arc<Mutex<BudgetState>>,
}

impl BudgetLedger {
    pub fn new(scope: BudgetScope, limit: f64, unit: BudgetUnit) -> Self {
        Self {
            scope,
            state: Arc::new(Mutex::new(BudgetState {
                limit,
                used: 0.0,
                unit,
            })),
        }
    }

    pub fn scope(&self) -> &BudgetScope {
        &self.scope
    }

    /// Charge `amount` atomically.
    ///
    /// Fails without changing `used` if the charge would push it past
    /// `limit`; the error carries `limit`, `used` and `attempted`.
    pub fn reserve(&self, amount: f64) -> Result<BudgetSnapshot, GuardError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(GuardError::InvalidCharge {
                scope: self.scope.to_string(),
                amount,
            });
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.used + amount > state.limit {
            tracing::warn!(
                scope = %self.scope,
                limit = state.limit,
                used = state.used,
                attempted = amount,
                "budget charge rejected"
            );
            return Err(self.exceeded(&state, amount));
        }
        state.used += amount;
        Ok(self.snapshot_of(&state))
    }

    /// Pre-check for callers that want to avoid starting expensive work.
    pub fn would_exceed(&self, estimate: f64) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.used + estimate > state.limit
    }

    pub fn is_exhausted(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.used >= state.limit
    }

    /// Budget stage of the guard chain.
    ///
    /// With an estimate, blocks if it would exceed the limit. Without one,
    /// blocks only once the budget is fully spent.
    pub fn check(&self, estimate: Option<f64>) -> Result<(), GuardError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match estimate {
            Some(e) if !e.is_finite() || e < 0.0 => Err(GuardError::InvalidCharge {
                scope: self.scope.to_string(),
                amount: e,
            }),
            Some(e) if state.used + e > state.limit => Err(self.exceeded(&state, e)),
            None if state.used >= state.limit => Err(self.exceeded(&state, 0.0)),
            _ => Ok(()),
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &BudgetState) -> BudgetSnapshot {
        BudgetSnapshot {
            scope: self.scope.clone(),
            limit: state.limit,
            used: state.used,
            unit: state.unit,
        }
    }

    fn exceeded(&self, state: &BudgetState, attempted: f64) -> GuardError {
        GuardError::BudgetExceeded {
            scope: self.scope.to_string(),
            limit: state.limit,
            used: state.used,
            attempted,
            unit: state.unit,
        }
    }
}

/// Registry of shared budgets, so sessions of one user or tenant charge a
/// single ledger.
#[derive(Debug, Clone, Default)]
pub struct BudgetBook {
    ledgers: Arc<Mutex<HashMap<BudgetScope, BudgetLedger>>>,
}

impl BudgetBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger for `scope`, created with `limit`/`unit` on first use. An
    /// existing ledger keeps its original limit.
    pub fn ledger(&self, scope: BudgetScope, limit: f64, unit: BudgetUnit) -> BudgetLedger {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        ledgers
            .entry(scope.clone())
            .or_insert_with(|| BudgetLedger::new(scope, limit, unit))
            .clone()
    }

    pub fn get(&self, scope: &BudgetScope) -> Option<BudgetLedger> {
        let ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        ledgers.get(scope).cloned()
    }
}
