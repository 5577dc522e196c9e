use super::super::{AuthorizeResult, Authorization, GuardChain, Outcome, RunOutput};
use super::outcome;
use super::stages::{self, Evaluated, Held, StageCtx};
use crate::action::Action;
use crate::config::GuardSet;
use crate::errors::{ApprovalFailure, GuardError};
use crate::ledger::{
    Decision, DecisionRecorder, GuardOutcome, GuardReason, LedgerRecord, LedgerWritePolicy,
    Verdict,
};
use crate::runtime::session::Session;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

pub(crate) fn authorize_at_impl<'s>(
    chain: &GuardChain,
    now: DateTime<Utc>,
    session: &'s Session,
    action: &Action,
    guards: &GuardSet,
) -> AuthorizeResult<'s> {
    prune_if_due(chain, now);
    session.note_decision();
    let ledger = session.ledger().as_ref();
    let mut recorder = DecisionRecorder::new(
        ledger,
        Decision::new(session.id(), session.scope(), action, now),
    );
    let mut held = Held::default();

    let evaluated = stages::evaluate_impl(&mut StageCtx {
        chain,
        now,
        session,
        action,
        guards,
        recorder: &mut recorder,
        held: &mut held,
    });

    match evaluated {
        Ok(Evaluated::Proceed) => {}
        Ok(Evaluated::Duplicate { status, result }) => {
            held.release(chain);
            let (decision, _) = recorder.record(Verdict::DuplicateReturn);
            return AuthorizeResult::Duplicate {
                decision,
                status,
                result,
            };
        }
        Err(error) => {
            held.release(chain);
            return refuse(session, action, recorder, error);
        }
    }

    let (decision, written) = recorder.record(Verdict::Allow);
    if let Err(e) = written {
        if ledger.policy() == LedgerWritePolicy::FailClosed {
            held.release(chain);
            let error = GuardError::Ledger(e);
            let mut blocked = decision;
            blocked.verdict = Verdict::Block;
            blocked
                .reasons
                .push(GuardReason::from_error(&error, GuardOutcome::Block));
            // The sink just failed; this retry is best effort.
            let _ = ledger.append(&LedgerRecord::Decision(blocked.clone()));
            warn!(
                session_id = %session.id(),
                action = %action.name,
                "allow could not be recorded; blocking"
            );
            return AuthorizeResult::Block {
                decision: blocked,
                error,
            };
        }
    }

    debug!(
        session_id = %session.id(),
        action = %action.name,
        decision_id = %decision.decision_id,
        "action allowed"
    );
    AuthorizeResult::Allow(Authorization {
        session,
        action: action.clone(),
        decision,
        guards: guards.clone(),
        permits: std::mem::take(&mut held.permits),
        claim: held.claim.take(),
        started: Instant::now(),
        breakers: chain.breakers.clone(),
        idempotency: chain.idempotency.clone(),
        reported: false,
    })
}

/// Every `prune_every`-th call sweeps drained rate windows and expired
/// idempotency records, which otherwise only go when their key is seen again.
fn prune_if_due(chain: &GuardChain, now: DateTime<Utc>) {
    let call = chain.calls.fetch_add(1, Ordering::Relaxed) + 1;
    if call % chain.prune_every != 0 {
        return;
    }
    chain.limiter.prune_at(now);
    chain.idempotency.prune_at(now);
    debug!(
        rate_keys = chain.limiter.len(),
        idempotency_records = chain.idempotency.len(),
        "pruned expired guard state"
    );
}

fn refuse<'s>(
    session: &Session,
    action: &Action,
    mut recorder: DecisionRecorder<'_>,
    error: GuardError,
) -> AuthorizeResult<'s> {
    let missing_approval = matches!(
        error,
        GuardError::ApprovalInvalid {
            reason: ApprovalFailure::Missing
        }
    );
    let (outcome, verdict) = if missing_approval {
        (GuardOutcome::RequireApproval, Verdict::RequireApproval)
    } else {
        (GuardOutcome::Block, Verdict::Block)
    };
    recorder.push(GuardReason::from_error(&error, outcome));
    let (decision, _) = recorder.record(verdict);

    warn!(
        session_id = %session.id(),
        action = %action.name,
        guard = %error.guard(),
        reason_code = error.reason_code(),
        %verdict,
        "action refused"
    );
    if missing_approval {
        AuthorizeResult::RequireApproval { decision, error }
    } else {
        AuthorizeResult::Block { decision, error }
    }
}

fn not_allowed(result: AuthorizeResult<'_>) -> Result<RunOutput, GuardError> {
    match result {
        AuthorizeResult::Duplicate { status, result, .. } => {
            Ok(RunOutput::Duplicate { status, result })
        }
        AuthorizeResult::RequireApproval { error, .. } | AuthorizeResult::Block { error, .. } => {
            Err(error)
        }
        // Callers only pass refusals here.
        AuthorizeResult::Allow(auth) => Err(GuardError::InvalidAction {
            reason: format!("'{}' was allowed but not executed", auth.action().name),
        }),
    }
}

fn executed(action: &Action, outcome: &Outcome) -> Result<RunOutput, GuardError> {
    match outcome {
        Outcome::Succeeded { result, .. } => Ok(RunOutput::Executed(result.clone())),
        Outcome::Failed { error, .. } => Err(GuardError::ActionFailed {
            action: action.name.clone(),
            error: error.clone(),
        }),
    }
}

pub(crate) fn run_impl<F>(
    chain: &GuardChain,
    session: &Session,
    action: &Action,
    guards: &GuardSet,
    f: F,
) -> Result<RunOutput, GuardError>
where
    F: FnOnce(&Action) -> Outcome,
{
    let auth = match chain.authorize(session, action, guards) {
        AuthorizeResult::Allow(auth) => auth,
        other => return not_allowed(other),
    };
    let outcome = f(auth.action());
    let output = executed(action, &outcome);
    auth.report(outcome)?;
    output
}

pub(crate) async fn run_async_impl<F, Fut>(
    chain: &GuardChain,
    session: &Session,
    action: &Action,
    guards: &GuardSet,
    f: F,
) -> Result<RunOutput, GuardError>
where
    F: FnOnce(Action) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let mut auth = match chain.authorize(session, action, guards) {
        AuthorizeResult::Allow(auth) => auth,
        other => return not_allowed(other),
    };
    let call = f(auth.action().clone());

    let outcome = match guards.timeout() {
        Some(after) => match tokio::time::timeout(after, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                auth.reported = true;
                let failure = Outcome::failure(format!("timed out after {:?}", after));
                return outcome::settle_impl(&auth, Utc::now(), failure, true).and_then(|_| {
                    Err(GuardError::Timeout {
                        operation: format!("action '{}'", action.name),
                        after,
                    })
                });
            }
        },
        None => call.await,
    };

    let output = executed(action, &outcome);
    auth.report(outcome)?;
    output
}
