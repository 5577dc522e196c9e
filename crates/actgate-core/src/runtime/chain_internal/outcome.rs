use super::super::{Authorization, Outcome, OutcomeReport};
use crate::action::scalar_to_string;
use crate::errors::GuardError;
use crate::ledger::{reason_codes, LedgerRecord, OutcomeRecord, OutcomeStatus};
use crate::runtime::circuit::CircuitPermit;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

pub(crate) fn report_impl(
    auth: &Authorization<'_>,
    now: DateTime<Utc>,
    outcome: Outcome,
) -> Result<OutcomeReport, GuardError> {
    let late = auth
        .guards
        .timeout()
        .is_some_and(|after| auth.started.elapsed() >= after);
    settle_impl(auth, now, outcome, late)
}

/// Value at `field` of a result: JSON pointer (`/a/b`) or top-level key.
fn result_field(result: &Value, field: &str) -> Option<String> {
    let value = if field.starts_with('/') {
        result.pointer(field)
    } else {
        result.get(field)
    }?;
    scalar_to_string(value)
}

/// Settle budget, breakers, idempotency and proofs for one outcome, then
/// append the outcome record. `timed_out` turns any outcome into a failure.
pub(crate) fn settle_impl(
    auth: &Authorization<'_>,
    now: DateTime<Utc>,
    outcome: Outcome,
    timed_out: bool,
) -> Result<OutcomeReport, GuardError> {
    let session = auth.session;
    let action = &auth.action;
    let cost = outcome.cost();

    let (status, result) = match outcome {
        _ if timed_out => (OutcomeStatus::TimedOut, None),
        Outcome::Succeeded { result, .. } => (OutcomeStatus::Succeeded, Some(result)),
        Outcome::Failed { .. } => (OutcomeStatus::Failed, None),
    };
    let timeout_error = auth
        .guards
        .timeout()
        .filter(|_| timed_out)
        .map(|after| GuardError::Timeout {
            operation: format!("action '{}'", action.name),
            after,
        });

    // Budget: charged whatever the outcome, as the cost was incurred.
    let charge_error = match (session.budget(), cost) {
        (Some(budget), Some(cost)) => budget.reserve(cost).err(),
        _ => None,
    };

    for (name, permit) in &auth.permits {
        if status == OutcomeStatus::Succeeded {
            auth.breakers.record_success(name, *permit);
        } else {
            auth.breakers.record_failure_at(now, name, *permit);
        }
    }

    if let Some(ticket) = &auth.claim {
        let settled = match &result {
            Some(value) => auth.idempotency.complete_at(now, ticket, value.clone()),
            None => auth.idempotency.fail_at(now, ticket),
        };
        if let Err(e) = settled {
            warn!(key = %ticket.key, error = %e, "idempotency claim lost before completion");
        }
    }

    let mut facts_proven = Vec::new();
    if let Some(value) = &result {
        for proof in &auth.guards.proofs {
            let Some(proven) = result_field(value, &proof.field) else {
                warn!(
                    action = %action.name,
                    kind = %proof.kind,
                    field = %proof.field,
                    "result has no value to prove"
                );
                continue;
            };
            match session
                .facts()
                .prove_at(now, &proof.kind, &proven, &action.action_id, proof.ttl)
            {
                Ok(_) => facts_proven.push(proof.kind.clone()),
                Err(e) => warn!(kind = %proof.kind, error = %e, "proof rejected"),
            }
        }
    }

    let blame = timeout_error.as_ref().or(charge_error.as_ref());
    let reason_code = match (blame, status) {
        (Some(e), _) => Some(e.reason_code().to_string()),
        (None, OutcomeStatus::Failed) => Some(reason_codes::T_EXEC_ERROR.to_string()),
        _ => None,
    };
    let record = OutcomeRecord {
        decision_id: auth.decision.decision_id.clone(),
        action_id: action.action_id.clone(),
        action: action.name.clone(),
        session_id: session.id().to_string(),
        status,
        cost,
        reason_code,
        detail: blame.map(GuardError::ledger_detail),
        facts_proven: facts_proven.clone(),
        timestamp: now,
    };
    // Write failures are logged by the ledger; the action already ran.
    let _ = session.ledger().append(&LedgerRecord::Outcome(record));

    debug!(
        session_id = %session.id(),
        action = %action.name,
        ?status,
        "outcome reported"
    );

    if let Some(e) = timeout_error {
        return Err(e);
    }
    if let Some(e) = charge_error {
        return Err(e);
    }
    Ok(OutcomeReport {
        status,
        budget: session.budget().map(|b| b.snapshot()),
        facts_proven,
    })
}

/// Authorization dropped without a report.
pub(crate) fn cancel_impl(auth: &mut Authorization<'_>) {
    let now = Utc::now();
    for (name, permit) in auth.permits.drain(..) {
        if permit == CircuitPermit::Trial {
            auth.breakers.abandon_trial(&name);
        }
    }
    if let Some(ticket) = auth.claim.take() {
        if let Err(e) = auth.idempotency.fail_at(now, &ticket) {
            debug!(key = %ticket.key, error = %e, "idempotency claim already gone");
        }
    }

    warn!(
        session_id = %auth.session.id(),
        action = %auth.action.name,
        decision_id = %auth.decision.decision_id,
        "authorization dropped without an outcome"
    );
    let record = OutcomeRecord {
        decision_id: auth.decision.decision_id.clone(),
        action_id: auth.action.action_id.clone(),
        action: auth.action.name.clone(),
        session_id: auth.session.id().to_string(),
        status: OutcomeStatus::Cancelled,
        cost: None,
        reason_code: Some(reason_codes::T_CANCELLED.to_string()),
        detail: None,
        facts_proven: Vec::new(),
        timestamp: now,
    };
    let _ = auth.session.ledger().append(&LedgerRecord::Outcome(record));
}
