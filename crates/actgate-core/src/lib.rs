//! Runtime enforcement layer for autonomous agent actions.
//!
//! The core decides, before a side-effecting call runs, whether it is
//! allowed: required workflow facts, budget, rate and circuit health,
//! idempotency state and (for sensitive actions) a signed human approval.
//! Every verdict, win or lose, lands in the append-only decision ledger.
//!
//! ```text
//! caller ──open──▶ Session (facts, budget)
//!   │
//!   ├─ prove(kind, value)            ─▶ FactStore
//!   │
//!   └─ GuardChain::authorize(action) ─▶ facts → budget → rate → circuit
//!                                        → idempotency → approval
//!                                             │
//!                                             ▼
//!                                      DecisionLedger (sink)
//!        execute, then Authorization::report(outcome)
//!          └─▶ budget charge, circuit health, idempotency completion,
//!              proven facts, outcome record
//! ```

pub mod action;
pub mod config;
pub mod errors;
pub mod jcs;
pub mod ledger;
pub mod runtime;

pub use action::{Action, CredentialRef};
pub use config::{ActionGuards, GuardConfig, GuardSet, GuardSpec, OnDuplicate};
pub use errors::{ApprovalFailure, ConfigurationError, GuardError, GuardKind, MissingFact};
pub use ledger::{
    Decision, DecisionLedger, GuardOutcome, GuardReason, LedgerError, LedgerRecord, LedgerSink,
    LedgerWritePolicy, Verdict,
};
pub use runtime::{
    ApprovalContext, ApprovalIssuer, ApprovalToken, ApprovalVerifier, AuthorizeResult,
    Authorization, BudgetBook, BudgetLedger, BudgetScope, BudgetUnit, CircuitRegistry,
    CircuitStatus, Fact, FactPolicy, FactStore, GuardChain, IdempotencyCoordinator,
    IdempotencyStatus, Outcome, RateLimiter, RunOutput, Scope, Session, SessionConfig,
};
