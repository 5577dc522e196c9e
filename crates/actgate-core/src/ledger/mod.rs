//! Append-only decision ledger.
//!
//! Every `authorize` call appends exactly one [`Decision`], allowed or not,
//! and every reported execution appends an [`OutcomeRecord`]. Records name
//! credentials by opaque reference only; argument values and secrets never
//! reach a sink.

mod recorder;
mod sinks;
mod sqlite;

pub use recorder::DecisionRecorder;
pub use sinks::{FileLedgerSink, MemoryLedgerSink, NullLedgerSink};
pub use sqlite::{SqliteLedgerSink, LEDGER_SCHEMA};

use crate::action::{Action, CredentialRef};
use crate::errors::{GuardError, GuardKind};
use crate::runtime::{BudgetSnapshot, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Stable reason codes recorded per guard.
pub mod reason_codes {
    // Passes (P_*)
    pub const P_PASS: &str = "P_PASS";
    pub const P_ALLOW: &str = "P_ALLOW";

    // Fact failures (F_*)
    pub const F_FACT_MISSING: &str = "F_FACT_MISSING";
    pub const F_DUPLICATE_FACT: &str = "F_DUPLICATE_FACT";

    // Budget (B_*)
    pub const B_BUDGET_EXCEEDED: &str = "B_BUDGET_EXCEEDED";
    pub const B_INVALID_CHARGE: &str = "B_INVALID_CHARGE";

    // Rate / attempts (R_*)
    pub const R_RATE_LIMITED: &str = "R_RATE_LIMITED";
    pub const R_ATTEMPTS_EXHAUSTED: &str = "R_ATTEMPTS_EXHAUSTED";

    // Circuit (C_*)
    pub const C_CIRCUIT_OPEN: &str = "C_CIRCUIT_OPEN";
    pub const C_TRIAL: &str = "C_TRIAL";

    // Idempotency (I_*)
    pub const I_CONFLICT: &str = "I_CONFLICT";
    pub const I_DUPLICATE_RETURN: &str = "I_DUPLICATE_RETURN";

    // Approval (A_*)
    pub const A_APPROVED: &str = "A_APPROVED";
    pub const A_APPROVAL_REQUIRED: &str = "A_APPROVAL_REQUIRED";
    pub const A_APPROVAL_INVALID: &str = "A_APPROVAL_INVALID";

    // Timeout / execution (T_*)
    pub const T_TIMEOUT: &str = "T_TIMEOUT";
    pub const T_EXEC_ERROR: &str = "T_EXEC_ERROR";
    pub const T_CANCELLED: &str = "T_CANCELLED";

    // System (S_*)
    pub const S_INVALID_ACTION: &str = "S_INVALID_ACTION";
    pub const S_LEDGER_UNAVAILABLE: &str = "S_LEDGER_UNAVAILABLE";
    pub const S_INTERNAL_ERROR: &str = "S_INTERNAL_ERROR";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Block,
    RequireApproval,
    /// Idempotent duplicate served from the stored result.
    DuplicateReturn,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Block => f.write_str("block"),
            Self::RequireApproval => f.write_str("require_approval"),
            Self::DuplicateReturn => f.write_str("duplicate_return"),
        }
    }
}

/// Result of one guard within a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOutcome {
    Pass,
    Block,
    Duplicate,
    RequireApproval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardReason {
    pub guard: GuardKind,
    pub outcome: GuardOutcome,
    pub reason_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GuardReason {
    pub fn pass(guard: GuardKind, detail: Option<String>) -> Self {
        Self {
            guard,
            outcome: GuardOutcome::Pass,
            reason_code: reason_codes::P_PASS.to_string(),
            detail,
        }
    }

    pub fn with_code(guard: GuardKind, outcome: GuardOutcome, code: &str) -> Self {
        Self {
            guard,
            outcome,
            reason_code: code.to_string(),
            detail: None,
        }
    }

    /// Reason for a guard that failed with `err`; the detail is the hint
    /// with argument and fact values left out.
    pub fn from_error(err: &GuardError, outcome: GuardOutcome) -> Self {
        Self {
            guard: err.guard(),
            outcome,
            reason_code: err.reason_code().to_string(),
            detail: Some(err.ledger_detail()),
        }
    }
}

/// One authorization verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub action_id: String,
    /// Action name.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_hash: Option<String>,
    pub session_id: String,
    pub scope: Scope,
    pub verdict: Verdict,
    /// Guards evaluated, in order, up to the first block.
    pub reasons: Vec<GuardReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<CredentialRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// Pending decision for `action`; verdict defaults to block until set.
    pub fn new(session_id: &str, scope: &Scope, action: &Action, now: DateTime<Utc>) -> Self {
        Self {
            decision_id: format!("dec_{}", uuid::Uuid::new_v4()),
            action_id: action.action_id.clone(),
            action: action.name.clone(),
            action_hash: action.action_hash().ok(),
            session_id: session_id.to_string(),
            scope: scope.clone(),
            verdict: Verdict::Block,
            reasons: Vec::new(),
            credential_ref: action.credential_ref.clone(),
            approver_id: None,
            timestamp: now,
        }
    }

    /// The reason of the guard that decided a non-allow verdict.
    pub fn blocking_reason(&self) -> Option<&GuardReason> {
        self.reasons.iter().rev().find(|r| {
            matches!(
                r.outcome,
                GuardOutcome::Block | GuardOutcome::RequireApproval | GuardOutcome::Duplicate
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// The authorization was dropped without a report.
    Cancelled,
}

/// What happened after an allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub decision_id: String,
    pub action_id: String,
    pub action: String,
    pub session_id: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Fact kinds proven from the result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts_proven: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub scope: Scope,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub decisions: u64,
    pub facts_proven: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSnapshot>,
}

/// One line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Decision(Decision),
    Outcome(OutcomeRecord),
    SessionClosed(SessionSummary),
}

impl LedgerRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decision(_) => "decision",
            Self::Outcome(_) => "outcome",
            Self::SessionClosed(_) => "session_closed",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Decision(d) => &d.session_id,
            Self::Outcome(o) => &o.session_id,
            Self::SessionClosed(s) => &s.session_id,
        }
    }

    pub fn action_id(&self) -> Option<&str> {
        match self {
            Self::Decision(d) => Some(&d.action_id),
            Self::Outcome(o) => Some(&o.action_id),
            Self::SessionClosed(_) => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Decision(d) => d.timestamp,
            Self::Outcome(o) => o.timestamp,
            Self::SessionClosed(s) => s.closed_at,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger sink unavailable: {0}")]
    Unavailable(String),

    #[error("ledger record encoding failed: {0}")]
    Encoding(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

/// Append-only destination for ledger records.
pub trait LedgerSink: Send + Sync {
    fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError>;

    fn flush(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// What an unwritable record does to the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerWritePolicy {
    /// Return the verdict anyway; log a warning.
    #[default]
    BestEffort,
    /// Turn an allow that could not be recorded into a block.
    FailClosed,
}

/// Sink plus write policy plus counters.
pub struct DecisionLedger {
    sink: Box<dyn LedgerSink>,
    policy: LedgerWritePolicy,
    appended: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for DecisionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionLedger")
            .field("policy", &self.policy)
            .field("appended", &self.appended())
            .field("failed", &self.failed())
            .finish_non_exhaustive()
    }
}

impl DecisionLedger {
    pub fn new(sink: Box<dyn LedgerSink>) -> Self {
        Self {
            sink,
            policy: LedgerWritePolicy::default(),
            appended: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: LedgerWritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Discards everything.
    pub fn null() -> Self {
        Self::new(Box::new(NullLedgerSink))
    }

    /// NDJSON file at `path`, appended to.
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(Box::new(FileLedgerSink::new(path)?)))
    }

    pub fn policy(&self) -> LedgerWritePolicy {
        self.policy
    }

    /// Append one record. Failures are logged and counted, then returned so
    /// the caller can apply the write policy.
    pub fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        match self.sink.append(record) {
            Ok(()) => {
                self.appended.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    record = record.kind(),
                    session_id = %record.session_id(),
                    error = %e,
                    "ledger write failed"
                );
                Err(e)
            }
        }
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.sink.flush()
    }

    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
