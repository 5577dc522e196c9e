//! Runtime guard state and the chain that evaluates it.
//!
//! ```text
//!                 ┌───────────── Session ─────────────┐
//!                 │ FactStore   BudgetLedger  attempts │
//!                 └───────────────┬────────────────────┘
//!                                 │
//! Action ──▶ GuardChain ──▶ facts → budget → rate → circuit → idempotency → approval
//!                │               (RateLimiter) (CircuitRegistry) (IdempotencyCoordinator)
//!                │                                                   (ApprovalVerifier)
//!                ▼
//!          Authorization ──report──▶ budget charge, breaker health,
//!                                    idempotency result, proofs
//! ```
//!
//! Everything here is shared across threads: registries are cheap `Clone`
//! handles over one locked map, and every decision that depends on shared
//! state is made under that lock.

pub mod approval;
pub mod budget;
pub mod chain;
pub mod circuit;
pub mod facts;
pub mod idempotency;
pub mod rate_limit;
pub mod session;

pub use approval::{
    compute_key_id, ApprovalClaims, ApprovalContext, ApprovalIssuer, ApprovalToken,
    ApprovalVerifier, VerifiedApproval, PAYLOAD_TYPE_APPROVAL_V1,
};
pub use budget::{BudgetBook, BudgetLedger, BudgetScope, BudgetSnapshot, BudgetUnit};
pub use chain::{
    AuthorizeResult, Authorization, GuardChain, Outcome, OutcomeReport, RunOutput,
    DEFAULT_PRUNE_EVERY,
};
pub use circuit::{BreakerConfig, CircuitPermit, CircuitRegistry, CircuitState, CircuitStatus};
pub use facts::{Fact, FactPolicy, FactRequirement, FactStore};
pub use idempotency::{
    BeginOutcome, ClaimTicket, IdempotencyCoordinator, IdempotencyPolicy, IdempotencyRecord,
    IdempotencyStatus, OnDuplicate,
};
pub use rate_limit::{RateKey, RateLimiter};
pub use session::{Scope, Session, SessionConfig};
