//! Guard chain: ordered, short-circuiting authorization for one action.
//!
//! Flow:
//! 1. Facts: every `require_fact` argument is a proven, live fact
//! 2. Budget: the estimate fits (or, without one, the budget is not spent)
//! 3. Rate: every `rate_limit` window has room, then `max_attempts`
//! 4. Circuit: every named breaker admits the call
//! 5. Idempotency: first claim proceeds; duplicates get the stored result
//! 6. Approval: a signed token binds this action and session state
//!
//! The first blocking guard ends evaluation. Permits and claims taken by
//! earlier stages are handed back, except rate-limit slots: the attempt was
//! made and stays counted. Exactly one decision is recorded per call.

use crate::action::Action;
use crate::config::GuardSet;
use crate::errors::GuardError;
use crate::ledger::{Decision, OutcomeStatus, Verdict};
use crate::runtime::approval::ApprovalVerifier;
use crate::runtime::budget::BudgetSnapshot;
use crate::runtime::circuit::{CircuitPermit, CircuitRegistry};
use crate::runtime::idempotency::{ClaimTicket, IdempotencyCoordinator, IdempotencyStatus};
use crate::runtime::rate_limit::RateLimiter;
use crate::runtime::session::Session;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

#[path = "chain_internal/mod.rs"]
mod chain_internal;

/// Authorize calls between sweeps of expired rate windows and idempotency
/// records.
pub const DEFAULT_PRUNE_EVERY: u64 = 1024;

/// Shared guard state: rate windows, breakers, idempotency records and
/// trusted approvers. Clones share all of it.
#[derive(Debug, Clone)]
pub struct GuardChain {
    limiter: RateLimiter,
    breakers: CircuitRegistry,
    idempotency: IdempotencyCoordinator,
    approvals: Arc<ApprovalVerifier>,
    calls: Arc<AtomicU64>,
    prune_every: u64,
}

impl Default for GuardChain {
    fn default() -> Self {
        Self {
            limiter: RateLimiter::default(),
            breakers: CircuitRegistry::default(),
            idempotency: IdempotencyCoordinator::default(),
            approvals: Arc::default(),
            calls: Arc::default(),
            prune_every: DEFAULT_PRUNE_EVERY,
        }
    }
}

/// Verdict of one `authorize` call.
#[derive(Debug)]
pub enum AuthorizeResult<'s> {
    /// Execute, then report through the handle.
    Allow(Authorization<'s>),
    /// Do not execute; the key already ran (or is running).
    Duplicate {
        decision: Decision,
        status: IdempotencyStatus,
        result: Option<Value>,
    },
    /// Do not execute until a human approves.
    RequireApproval { decision: Decision, error: GuardError },
    Block { decision: Decision, error: GuardError },
}

impl AuthorizeResult<'_> {
    pub fn decision(&self) -> &Decision {
        match self {
            Self::Allow(auth) => auth.decision(),
            Self::Duplicate { decision, .. }
            | Self::RequireApproval { decision, .. }
            | Self::Block { decision, .. } => decision,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.decision().verdict
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn error(&self) -> Option<&GuardError> {
        match self {
            Self::RequireApproval { error, .. } | Self::Block { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// What the guarded call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded { result: Value, cost: Option<f64> },
    Failed { error: String, cost: Option<f64> },
}

impl Outcome {
    pub fn success(result: Value) -> Self {
        Self::Succeeded { result, cost: None }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self::Failed {
            error: error.to_string(),
            cost: None,
        }
    }

    /// Cost actually incurred, charged to the session budget on report.
    pub fn with_cost(self, cost: f64) -> Self {
        match self {
            Self::Succeeded { result, .. } => Self::Succeeded {
                result,
                cost: Some(cost),
            },
            Self::Failed { error, .. } => Self::Failed {
                error,
                cost: Some(cost),
            },
        }
    }

    pub fn cost(&self) -> Option<f64> {
        match self {
            Self::Succeeded { cost, .. } | Self::Failed { cost, .. } => *cost,
        }
    }
}

/// Bookkeeping done for a reported outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeReport {
    pub status: OutcomeStatus,
    pub budget: Option<BudgetSnapshot>,
    pub facts_proven: Vec<String>,
}

/// Result of [`GuardChain::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    Executed(Value),
    Duplicate {
        status: IdempotencyStatus,
        result: Option<Value>,
    },
}

/// An allowed action awaiting its outcome.
///
/// Dropping it without [`Authorization::report`] counts as cancellation: the
/// idempotency claim is released, a half-open trial is handed back and a
/// `cancelled` outcome is recorded.
#[derive(Debug)]
pub struct Authorization<'s> {
    session: &'s Session,
    action: Action,
    decision: Decision,
    guards: GuardSet,
    permits: Vec<(String, CircuitPermit)>,
    claim: Option<ClaimTicket>,
    started: Instant,
    breakers: CircuitRegistry,
    idempotency: IdempotencyCoordinator,
    reported: bool,
}

impl<'s> Authorization<'s> {
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// Time left before the `timeout` guard's deadline.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.guards
            .timeout()
            .map(|t| t.saturating_sub(self.started.elapsed()))
    }

    /// Report what the call did and settle budget, breakers, idempotency and
    /// proven facts.
    ///
    /// Everything is settled even when this returns an error: a rejected
    /// budget charge (`BudgetExceeded`) or an outcome that arrived after the
    /// timeout (`Timeout`).
    pub fn report(self, outcome: Outcome) -> Result<OutcomeReport, GuardError> {
        self.report_at(Utc::now(), outcome)
    }

    pub fn report_at(
        mut self,
        now: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<OutcomeReport, GuardError> {
        self.reported = true;
        chain_internal::outcome::report_impl(&self, now, outcome)
    }
}

impl Drop for Authorization<'_> {
    fn drop(&mut self) {
        if !self.reported {
            chain_internal::outcome::cancel_impl(self);
        }
    }
}

impl GuardChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_circuits(mut self, breakers: CircuitRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_idempotency(mut self, idempotency: IdempotencyCoordinator) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn with_approvals(mut self, approvals: ApprovalVerifier) -> Self {
        self.approvals = Arc::new(approvals);
        self
    }

    /// Sweep expired state every `calls` authorizations (at least 1).
    pub fn with_prune_every(mut self, calls: u64) -> Self {
        self.prune_every = calls.max(1);
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.breakers
    }

    pub fn idempotency(&self) -> &IdempotencyCoordinator {
        &self.idempotency
    }

    pub fn approvals(&self) -> &ApprovalVerifier {
        &self.approvals
    }

    /// Evaluate `guards` for `action` in `session` and record the decision.
    pub fn authorize<'s>(
        &self,
        session: &'s Session,
        action: &Action,
        guards: &GuardSet,
    ) -> AuthorizeResult<'s> {
        self.authorize_at(Utc::now(), session, action, guards)
    }

    /// Like [`GuardChain::authorize`] but with an explicit `now` timestamp.
    /// Use this in tests to avoid flaky clock-dependent assertions.
    pub fn authorize_at<'s>(
        &self,
        now: DateTime<Utc>,
        session: &'s Session,
        action: &Action,
        guards: &GuardSet,
    ) -> AuthorizeResult<'s> {
        chain_internal::run::authorize_at_impl(self, now, session, action, guards)
    }

    /// Authorize, execute `f`, report. A failed outcome is returned as
    /// `ActionFailed`.
    pub fn run<F>(
        &self,
        session: &Session,
        action: &Action,
        guards: &GuardSet,
        f: F,
    ) -> Result<RunOutput, GuardError>
    where
        F: FnOnce(&Action) -> Outcome,
    {
        chain_internal::run::run_impl(self, session, action, guards, f)
    }

    /// Async [`GuardChain::run`]; the `timeout` guard cancels `f` when its
    /// deadline passes.
    ///
    /// Authorization itself runs on the calling task, including any
    /// `on_duplicate: block` wait.
    pub async fn run_async<F, Fut>(
        &self,
        session: &Session,
        action: &Action,
        guards: &GuardSet,
        f: F,
    ) -> Result<RunOutput, GuardError>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        chain_internal::run::run_async_impl(self, session, action, guards, f).await
    }
}
