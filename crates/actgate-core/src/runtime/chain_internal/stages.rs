use super::super::GuardChain;
use crate::action::Action;
use crate::config::{GuardSet, IdempotentGuard, ScopeKey};
use crate::errors::{GuardError, GuardKind};
use crate::jcs;
use crate::ledger::{reason_codes, DecisionRecorder, GuardOutcome, GuardReason};
use crate::runtime::circuit::CircuitPermit;
use crate::runtime::idempotency::{BeginOutcome, ClaimTicket, IdempotencyStatus};
use crate::runtime::rate_limit::RateKey;
use crate::runtime::session::Session;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// Permits and claims taken so far; handed back if a later stage blocks.
#[derive(Debug, Default)]
pub(crate) struct Held {
    pub(crate) permits: Vec<(String, CircuitPermit)>,
    pub(crate) claim: Option<ClaimTicket>,
}

impl Held {
    pub(crate) fn release(&mut self, chain: &GuardChain) {
        for (name, permit) in self.permits.drain(..) {
            if permit == CircuitPermit::Trial {
                chain.breakers.abandon_trial(&name);
            }
        }
        if let Some(ticket) = self.claim.take() {
            if let Err(e) = chain.idempotency.release(&ticket) {
                debug!(key = %ticket.key, error = %e, "idempotency claim already gone");
            }
        }
    }
}

pub(crate) enum Evaluated {
    Proceed,
    Duplicate {
        status: IdempotencyStatus,
        result: Option<Value>,
    },
}

pub(crate) struct StageCtx<'a, 'l> {
    pub(crate) chain: &'a GuardChain,
    pub(crate) now: DateTime<Utc>,
    pub(crate) session: &'a Session,
    pub(crate) action: &'a Action,
    pub(crate) guards: &'a GuardSet,
    pub(crate) recorder: &'a mut DecisionRecorder<'l>,
    pub(crate) held: &'a mut Held,
}

/// Run every stage in order, stopping at the first block.
pub(crate) fn evaluate_impl(ctx: &mut StageCtx<'_, '_>) -> Result<Evaluated, GuardError> {
    check_facts_impl(ctx)?;
    check_budget_impl(ctx)?;
    check_rate_impl(ctx)?;
    check_circuits_impl(ctx)?;
    if let Some((status, result)) = check_idempotency_impl(ctx)? {
        return Ok(Evaluated::Duplicate { status, result });
    }
    check_approval_impl(ctx)?;
    if let Some(after) = ctx.guards.timeout() {
        ctx.recorder.push(GuardReason::pass(
            GuardKind::Timeout,
            Some(format!("deadline {:?}", after)),
        ));
    }
    Ok(Evaluated::Proceed)
}

fn check_facts_impl(ctx: &mut StageCtx<'_, '_>) -> Result<(), GuardError> {
    for fact in &ctx.guards.facts {
        let value = ctx
            .action
            .argument(&fact.arg)
            .ok_or_else(|| GuardError::InvalidAction {
                reason: format!(
                    "argument '{}' (checked against fact '{}') is missing",
                    fact.arg, fact.kind
                ),
            })?;
        ctx.session.facts().require_at(ctx.now, &fact.kind, &value)?;
        debug!(action = %ctx.action.name, kind = %fact.kind, "fact requirement met");
        ctx.recorder
            .push(GuardReason::pass(GuardKind::Facts, Some(fact.kind.clone())));
    }
    Ok(())
}

fn check_budget_impl(ctx: &mut StageCtx<'_, '_>) -> Result<(), GuardError> {
    let Some(budget) = ctx.session.budget() else {
        return Ok(());
    };
    budget.check(ctx.action.cost_estimate)?;
    let snapshot = budget.snapshot();
    ctx.recorder.push(GuardReason::pass(
        GuardKind::Budget,
        Some(format!("{} {} remaining", snapshot.remaining(), snapshot.unit)),
    ));
    Ok(())
}

fn scope_value(
    session: &Session,
    action: &Action,
    key: &ScopeKey,
) -> Result<String, GuardError> {
    let absent = |what: &str| GuardError::InvalidAction {
        reason: format!("rate_limit is scoped by {} but none is set", what),
    };
    match key {
        ScopeKey::Session => Ok(format!("session:{}", session.id())),
        ScopeKey::User => session
            .scope()
            .user_id
            .as_ref()
            .map(|u| format!("user:{}", u))
            .ok_or_else(|| absent("user_id")),
        ScopeKey::Tenant => session
            .scope()
            .tenant_id
            .as_ref()
            .map(|t| format!("tenant:{}", t))
            .ok_or_else(|| absent("tenant_id")),
        ScopeKey::Global => Ok("*".to_string()),
        // Argument values never reach the ledger; key by digest.
        ScopeKey::Arg(name) => action
            .argument(name)
            .map(|v| {
                let digest = jcs::sha256_digest(v.as_bytes());
                let short = digest.get(7..19).unwrap_or(&digest);
                format!("arg:{}#{}", name, short)
            })
            .ok_or_else(|| absent(&format!("argument '{}'", name))),
    }
}

fn check_rate_impl(ctx: &mut StageCtx<'_, '_>) -> Result<(), GuardError> {
    for limit in &ctx.guards.rate_limits {
        let scope = scope_value(ctx.session, ctx.action, &limit.scope_key)?;
        let key = RateKey::new(scope, format!("{}/{}", ctx.action.name, limit.window));
        let left = ctx
            .chain
            .limiter
            .allow_at(ctx.now, &key, limit.max_calls, limit.period)?;
        ctx.recorder.push(GuardReason::pass(
            GuardKind::RateLimit,
            Some(format!("{} left in {} window", left, limit.window)),
        ));
    }

    if let Some(max_calls) = ctx.guards.max_attempts {
        let attempt = ctx.session.note_attempt(&ctx.action.name, max_calls)?;
        ctx.recorder.push(GuardReason::pass(
            GuardKind::MaxAttempts,
            Some(format!("attempt {} of {}", attempt, max_calls)),
        ));
    }
    Ok(())
}

fn check_circuits_impl(ctx: &mut StageCtx<'_, '_>) -> Result<(), GuardError> {
    for breaker in &ctx.guards.breakers {
        let permit = ctx
            .chain
            .breakers
            .acquire_at(ctx.now, &breaker.name, breaker.config)?;
        let reason = match permit {
            CircuitPermit::Normal => {
                GuardReason::pass(GuardKind::CircuitBreaker, Some(breaker.name.clone()))
            }
            CircuitPermit::Trial => GuardReason {
                detail: Some(breaker.name.clone()),
                ..GuardReason::with_code(
                    GuardKind::CircuitBreaker,
                    GuardOutcome::Pass,
                    reason_codes::C_TRIAL,
                )
            },
        };
        ctx.recorder.push(reason);
        ctx.held.permits.push((breaker.name.clone(), permit));
    }
    Ok(())
}

/// Key under which an action's execution is deduplicated.
///
/// Precedence: the action's own key, then the configured argument, then the
/// action hash. Keys are namespaced by action name.
pub(crate) fn idempotency_key(
    action: &Action,
    guard: &IdempotentGuard,
) -> Result<String, GuardError> {
    let raw = match (&action.idempotency_key, &guard.key_arg) {
        (Some(key), _) => key.clone(),
        (None, Some(arg)) => action
            .argument(arg)
            .ok_or_else(|| GuardError::InvalidAction {
                reason: format!("idempotency key argument '{}' is missing", arg),
            })?,
        (None, None) => action
            .action_hash()
            .map_err(|e| GuardError::InvalidAction {
                reason: format!("arguments cannot be canonicalized: {}", e),
            })?,
    };
    Ok(format!("{}:{}", action.name, raw))
}

fn check_idempotency_impl(
    ctx: &mut StageCtx<'_, '_>,
) -> Result<Option<(IdempotencyStatus, Option<Value>)>, GuardError> {
    let Some(guard) = &ctx.guards.idempotent else {
        return Ok(None);
    };
    let key = idempotency_key(ctx.action, guard)?;
    match ctx.chain.idempotency.begin_at(ctx.now, &key, &guard.policy)? {
        BeginOutcome::Proceed(ticket) => {
            ctx.recorder
                .push(GuardReason::pass(GuardKind::Idempotency, None));
            ctx.held.claim = Some(ticket);
            Ok(None)
        }
        BeginOutcome::Duplicate { status, result } => {
            debug!(key = %key, %status, "duplicate served");
            ctx.recorder.push(GuardReason {
                detail: Some(format!("existing request is {}", status)),
                ..GuardReason::with_code(
                    GuardKind::Idempotency,
                    GuardOutcome::Duplicate,
                    reason_codes::I_DUPLICATE_RETURN,
                )
            });
            Ok(Some((status, result)))
        }
    }
}

fn check_approval_impl(ctx: &mut StageCtx<'_, '_>) -> Result<(), GuardError> {
    if !(ctx.action.requires_approval || ctx.guards.requires_approval()) {
        return Ok(());
    }
    let context = ctx.session.approval_context_at(ctx.now);
    let verified = ctx.chain.approvals.verify_at(
        ctx.now,
        ctx.action.approval.as_deref(),
        ctx.action,
        &context,
    )?;
    ctx.recorder.push(GuardReason::with_code(
        GuardKind::Approval,
        GuardOutcome::Pass,
        reason_codes::A_APPROVED,
    ));
    ctx.recorder.set_approver(verified.approver_id);
    Ok(())
}
