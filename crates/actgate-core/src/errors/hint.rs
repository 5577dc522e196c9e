//! Agent-readable self-correction hints rendered from structured fields.

use super::{ApprovalFailure, GuardError, MissingFact};
use crate::runtime::{CircuitStatus, IdempotencyStatus};
use std::time::Duration;

fn secs(d: &Duration) -> String {
    let s = d.as_secs_f64();
    if s.fract() == 0.0 {
        format!("{}s", s as u64)
    } else {
        format!("{:.1}s", s)
    }
}

impl GuardError {
    /// One sentence naming the guard that blocked and what to do next.
    ///
    /// Suitable for feeding straight back into an agent's next reasoning
    /// step; never parse it, use the variant fields instead.
    pub fn hint(&self) -> String {
        match self {
            Self::FactMissing {
                kind,
                expected,
                found,
                reason,
            } => {
                let mut hint = match reason {
                    MissingFact::NeverProven => format!(
                        "{} {} not established via any prior prove() call in this session",
                        kind, expected
                    ),
                    MissingFact::Expired { expired_at } => format!(
                        "{} {} was established but expired at {}; repeat the step that produces it",
                        kind,
                        expected,
                        expired_at.to_rfc3339()
                    ),
                    MissingFact::Superseded => format!(
                        "{} {} is stale: a later step in this session superseded it",
                        kind, expected
                    ),
                };
                if let Some(current) = found {
                    hint.push_str(&format!(" (current {} is {})", kind, current));
                }
                hint
            }
            Self::DuplicateFact { kind, value } => format!(
                "{} {} was already proven in this session and must be unique",
                kind, value
            ),
            Self::BudgetExceeded {
                scope,
                limit,
                used,
                attempted,
                unit,
            } => format!(
                "budget for {} would be exceeded: used {} of {} {}, this call needs {}; \
                 choose a cheaper option or request a higher limit",
                scope, used, limit, unit, attempted
            ),
            Self::InvalidCharge { scope, amount } => format!(
                "charge of {} against {} is not a finite non-negative amount",
                amount, scope
            ),
            Self::RateLimited {
                key,
                max_calls,
                period,
                retry_after,
            } => format!(
                "rate limit of {} calls per {} reached for {}; retry in {}",
                max_calls,
                secs(period),
                key,
                secs(retry_after)
            ),
            Self::AttemptsExhausted { action, max_calls } => format!(
                "'{}' may be attempted at most {} times per session; stop retrying and report the failure",
                action, max_calls
            ),
            Self::CircuitOpen {
                name,
                status: CircuitStatus::HalfOpen,
                ..
            } => format!(
                "dependency '{}' is recovering and a trial call is in progress; retry shortly",
                name
            ),
            Self::CircuitOpen {
                name,
                fail_count,
                retry_after,
                ..
            } => format!(
                "dependency '{}' is failing ({} consecutive failures, circuit open); retry in {}",
                name,
                fail_count,
                secs(retry_after)
            ),
            Self::ApprovalInvalid { reason } => match reason {
                ApprovalFailure::Missing => {
                    "this action requires human approval; request an approval token for this exact action"
                        .to_string()
                }
                ApprovalFailure::ActionMismatch { .. } => {
                    "the supplied approval was granted for a different action; request approval for this one"
                        .to_string()
                }
                ApprovalFailure::ContextMismatch { .. } => {
                    "the session changed since the approval was granted; request a fresh approval"
                        .to_string()
                }
                ApprovalFailure::Expired { .. } => {
                    "the supplied approval has expired; request a fresh approval".to_string()
                }
                other => format!("the supplied approval was rejected: {}", other),
            },
            Self::IdempotencyConflict { key, status } => match status {
                IdempotencyStatus::InFlight => format!(
                    "an identical request '{}' is already executing; wait for its result instead of retrying",
                    key
                ),
                IdempotencyStatus::Completed => format!(
                    "request '{}' already completed; reuse its result instead of re-executing",
                    key
                ),
                IdempotencyStatus::Failed => format!(
                    "request '{}' failed recently; wait before retrying it",
                    key
                ),
            },
            Self::Timeout { operation, after } => {
                format!("{} did not finish within {}", operation, secs(after))
            }
            Self::InvalidAction { reason } => format!("the action is malformed: {}", reason),
            Self::ActionFailed { action, error } => format!("'{}' failed: {}", action, error),
            Self::Ledger(e) => format!(
                "the decision could not be recorded ({}); the action was not allowed",
                e
            ),
        }
    }
}

/// `action:value` idempotency keys keep the action name; the value part is
/// replaced by a short digest.
fn redact_key(key: &str) -> String {
    let (scope, value) = key.split_once(':').unwrap_or(("", key));
    let digest = crate::jcs::sha256_digest(value.as_bytes());
    let short = digest.get(7..19).unwrap_or(&digest);
    if scope.is_empty() {
        format!("#{}", short)
    } else {
        format!("{}:#{}", scope, short)
    }
}

impl GuardError {
    /// The hint as written to the decision ledger.
    ///
    /// Same guidance as [`GuardError::hint`], without argument or fact
    /// values, idempotency key values or the action's own error text.
    pub fn ledger_detail(&self) -> String {
        match self {
            Self::FactMissing { kind, reason, .. } => match reason {
                MissingFact::NeverProven => format!(
                    "required {} not established via any prior prove() call in this session",
                    kind
                ),
                MissingFact::Expired { expired_at } => format!(
                    "required {} was established but expired at {}",
                    kind,
                    expired_at.to_rfc3339()
                ),
                MissingFact::Superseded => format!(
                    "required {} is stale: a later step in this session superseded it",
                    kind
                ),
            },
            Self::DuplicateFact { kind, .. } => format!(
                "{} value was already proven in this session and must be unique",
                kind
            ),
            Self::IdempotencyConflict { key, status } => Self::IdempotencyConflict {
                key: redact_key(key),
                status: *status,
            }
            .hint(),
            Self::ActionFailed { action, .. } => format!("'{}' failed", action),
            other => other.hint(),
        }
    }
}
