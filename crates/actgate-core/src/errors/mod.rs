//! Error taxonomy for the decision pipeline.
//!
//! Per-call failures are [`GuardError`]; every variant carries the structured
//! detail a caller (often an automated agent) needs to self-correct, and
//! [`GuardError::hint`] renders it as a readable sentence. Setup-time failures
//! are [`ConfigurationError`] and never occur per call.

mod hint;

use crate::ledger::{reason_codes, LedgerError};
use crate::runtime::{BudgetUnit, CircuitStatus, IdempotencyStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Which guard produced a reason or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    Facts,
    Budget,
    RateLimit,
    MaxAttempts,
    CircuitBreaker,
    Idempotency,
    Approval,
    Timeout,
    Proof,
    Action,
    Ledger,
}

impl GuardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Facts => "facts",
            Self::Budget => "budget",
            Self::RateLimit => "rate_limit",
            Self::MaxAttempts => "max_attempts",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Idempotency => "idempotency",
            Self::Approval => "approval",
            Self::Timeout => "timeout",
            Self::Proof => "proof",
            Self::Action => "action",
            Self::Ledger => "ledger",
        }
    }
}

impl std::fmt::Display for GuardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a required fact was not usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingFact {
    /// No `prove` call in this session produced the value.
    NeverProven,
    /// The fact existed but its `expires_at` has passed.
    Expired { expired_at: DateTime<Utc> },
    /// A newer value of the same kind replaced it.
    Superseded,
}

impl std::fmt::Display for MissingFact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeverProven => f.write_str("never proven"),
            Self::Expired { expired_at } => write!(f, "expired at {}", expired_at.to_rfc3339()),
            Self::Superseded => f.write_str("superseded"),
        }
    }
}

/// Distinct reasons an approval does not authorize the pending action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalFailure {
    /// No token was supplied for an action that requires one.
    Missing,
    Malformed { detail: String },
    UnsupportedVersion { version: u8 },
    UnknownApprover { approver_id: String },
    SignatureInvalid,
    Expired { expires_at: DateTime<Utc> },
    NotYetValid { issued_at: DateTime<Utc> },
    /// Token is bound to a different action.
    ActionMismatch { expected: String, actual: String },
    /// Session facts or budget changed since issuance.
    ContextMismatch { expected: String, actual: String },
}

impl ApprovalFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed { .. } => "malformed",
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::UnknownApprover { .. } => "unknown_approver",
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired { .. } => "expired",
            Self::NotYetValid { .. } => "not_yet_valid",
            Self::ActionMismatch { .. } => "action_mismatch",
            Self::ContextMismatch { .. } => "context_mismatch",
        }
    }
}

impl std::fmt::Display for ApprovalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => f.write_str("no approval supplied"),
            Self::Malformed { detail } => write!(f, "malformed token: {}", detail),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported token version {}", version)
            }
            Self::UnknownApprover { approver_id } => {
                write!(f, "approver '{}' is not trusted", approver_id)
            }
            Self::SignatureInvalid => f.write_str("signature invalid"),
            Self::Expired { expires_at } => {
                write!(f, "approval expired at {}", expires_at.to_rfc3339())
            }
            Self::NotYetValid { issued_at } => {
                write!(f, "approval not valid before {}", issued_at.to_rfc3339())
            }
            Self::ActionMismatch { .. } => f.write_str("approval does not match this action"),
            Self::ContextMismatch { .. } => {
                f.write_str("approval was issued for a different session state")
            }
        }
    }
}

/// Per-call guard failure. Always recoverable by the caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GuardError {
    #[error("Budget exceeded for {scope}: limit={limit}, used={used}, attempted={attempted} {unit}")]
    BudgetExceeded {
        scope: String,
        limit: f64,
        used: f64,
        attempted: f64,
        unit: BudgetUnit,
    },

    #[error("Invalid charge {amount} for {scope}")]
    InvalidCharge { scope: String, amount: f64 },

    #[error("Fact missing: {kind}={expected} ({reason})")]
    FactMissing {
        kind: String,
        expected: String,
        found: Option<String>,
        reason: MissingFact,
    },

    #[error("Fact already proven: {kind}={value}")]
    DuplicateFact { kind: String, value: String },

    #[error("Rate limited on {key}: {max_calls} calls per {period:?}, retry after {retry_after:?}")]
    RateLimited {
        key: String,
        max_calls: u32,
        period: Duration,
        retry_after: Duration,
    },

    #[error("Max attempts exhausted for '{action}': {max_calls} allowed per session")]
    AttemptsExhausted { action: String, max_calls: u32 },

    #[error("Circuit '{name}' is {status}, retry after {retry_after:?}")]
    CircuitOpen {
        name: String,
        status: CircuitStatus,
        fail_count: u32,
        retry_after: Duration,
    },

    #[error("Approval invalid: {reason}")]
    ApprovalInvalid { reason: ApprovalFailure },

    #[error("Idempotency conflict on '{key}': existing record is {status}")]
    IdempotencyConflict {
        key: String,
        status: IdempotencyStatus,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid action: {reason}")]
    InvalidAction { reason: String },

    #[error("Action '{action}' failed: {error}")]
    ActionFailed { action: String, error: String },

    #[error("Decision ledger: {0}")]
    Ledger(#[from] LedgerError),
}

impl GuardError {
    /// The guard that produced this error.
    pub fn guard(&self) -> GuardKind {
        match self {
            Self::BudgetExceeded { .. } | Self::InvalidCharge { .. } => GuardKind::Budget,
            Self::FactMissing { .. } | Self::DuplicateFact { .. } => GuardKind::Facts,
            Self::RateLimited { .. } => GuardKind::RateLimit,
            Self::AttemptsExhausted { .. } => GuardKind::MaxAttempts,
            Self::CircuitOpen { .. } => GuardKind::CircuitBreaker,
            Self::ApprovalInvalid { .. } => GuardKind::Approval,
            Self::IdempotencyConflict { .. } => GuardKind::Idempotency,
            Self::Timeout { .. } => GuardKind::Timeout,
            Self::InvalidAction { .. } | Self::ActionFailed { .. } => GuardKind::Action,
            Self::Ledger(_) => GuardKind::Ledger,
        }
    }

    /// Stable machine-readable code recorded in the ledger.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => reason_codes::B_BUDGET_EXCEEDED,
            Self::InvalidCharge { .. } => reason_codes::B_INVALID_CHARGE,
            Self::FactMissing { .. } => reason_codes::F_FACT_MISSING,
            Self::DuplicateFact { .. } => reason_codes::F_DUPLICATE_FACT,
            Self::RateLimited { .. } => reason_codes::R_RATE_LIMITED,
            Self::AttemptsExhausted { .. } => reason_codes::R_ATTEMPTS_EXHAUSTED,
            Self::CircuitOpen { .. } => reason_codes::C_CIRCUIT_OPEN,
            Self::ApprovalInvalid {
                reason: ApprovalFailure::Missing,
            } => reason_codes::A_APPROVAL_REQUIRED,
            Self::ApprovalInvalid { .. } => reason_codes::A_APPROVAL_INVALID,
            Self::IdempotencyConflict { .. } => reason_codes::I_CONFLICT,
            Self::Timeout { .. } => reason_codes::T_TIMEOUT,
            Self::InvalidAction { .. } => reason_codes::S_INVALID_ACTION,
            Self::ActionFailed { .. } => reason_codes::T_EXEC_ERROR,
            Self::Ledger(_) => reason_codes::S_LEDGER_UNAVAILABLE,
        }
    }

    /// Suggested wait before retrying, when the guard can compute one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

/// Invalid guard setup. Raised before any action executes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{guard}: '{field}' must be {requirement}")]
    InvalidField {
        guard: &'static str,
        field: &'static str,
        requirement: &'static str,
    },

    #[error("{guard}: at most one per guard set")]
    DuplicateGuard { guard: &'static str },

    #[error("action '{action}': {source}")]
    InAction {
        action: String,
        #[source]
        source: Box<ConfigurationError>,
    },

    #[error("approver '{approver_id}': invalid public key: {reason}")]
    InvalidApproverKey { approver_id: String, reason: String },

    #[error("circuit_breaker '{name}': configured differently by '{first_action}' and '{action}'")]
    ConflictingBreaker {
        name: String,
        first_action: String,
        action: String,
    },

    #[error("{setting}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },
}

impl ConfigurationError {
    pub(crate) fn field(
        guard: &'static str,
        field: &'static str,
        requirement: &'static str,
    ) -> Self {
        Self::InvalidField {
            guard,
            field,
            requirement,
        }
    }

    pub(crate) fn in_action(self, action: &str) -> Self {
        Self::InAction {
            action: action.to_string(),
            source: Box::new(self),
        }
    }
}
