//! Exactly-once coordination keyed by idempotency key.
//!
//! `begin` is an atomic insert-if-absent: for any key, exactly one caller
//! gets [`BeginOutcome::Proceed`] and holds the claim until it calls
//! [`IdempotencyCoordinator::complete`] or [`IdempotencyCoordinator::fail`].
//! Everyone else observes the in-flight or completed record and never runs
//! the action a second time.
//!
//! Liveness: in-flight records older than `in_flight_ttl` are treated as
//! abandoned (the owner crashed or hung) and can be reclaimed, and waiters
//! under `on_duplicate: block` always give up after `wait_timeout`.

use crate::errors::GuardError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_IN_FLIGHT_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InFlight,
    Completed,
    /// Released by a failed or cancelled execution; retry is refused until
    /// the failure TTL passes.
    Failed,
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFlight => f.write_str("in_flight"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// What a duplicate request gets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDuplicate {
    /// Return the stored result (or the in-flight status) without waiting.
    #[default]
    Return,
    /// Wait for the in-flight execution to finish, then return its result.
    Block,
    /// Fail with `IdempotencyConflict`.
    Raise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    /// How long a completed result is kept.
    pub ttl: Duration,
    pub on_duplicate: OnDuplicate,
    /// Upper bound for `OnDuplicate::Block`.
    pub wait_timeout: std::time::Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub result: Option<Value>,
    pub recorded_at: DateTime<Utc>,
    pub ttl: Duration,
    claim_id: u64,
}

/// Proof of a first claim. Only its holder may complete or fail the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    pub key: String,
    claim_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Proceed(ClaimTicket),
    Duplicate {
        status: IdempotencyStatus,
        result: Option<Value>,
    },
}

#[derive(Debug)]
struct Shared {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    changed: Condvar,
    next_claim: AtomicU64,
    in_flight_ttl: Duration,
    failed_retry_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct IdempotencyCoordinator {
    shared: Arc<Shared>,
}

impl Default for IdempotencyCoordinator {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_IN_FLIGHT_TTL_SECS), Duration::zero())
    }
}

impl IdempotencyCoordinator {
    /// `failed_retry_ttl` of zero removes a failed claim immediately so the
    /// key can be retried at once.
    pub fn new(in_flight_ttl: Duration, failed_retry_ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
                next_claim: AtomicU64::new(1),
                in_flight_ttl,
                failed_retry_ttl,
            }),
        }
    }

    pub fn begin(&self, key: &str, policy: &IdempotencyPolicy) -> Result<BeginOutcome, GuardError> {
        self.begin_with_clock(Utc::now, key, policy)
    }

    pub fn begin_at(
        &self,
        now: DateTime<Utc>,
        key: &str,
        policy: &IdempotencyPolicy,
    ) -> Result<BeginOutcome, GuardError> {
        self.begin_with_clock(move || now, key, policy)
    }

    fn begin_with_clock(
        &self,
        clock: impl Fn() -> DateTime<Utc>,
        key: &str,
        policy: &IdempotencyPolicy,
    ) -> Result<BeginOutcome, GuardError> {
        let deadline = Instant::now() + policy.wait_timeout;
        let mut records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            let now = clock();
            self.evict_expired(&mut records, key, now);

            let Some(existing) = records.get(key) else {
                let claim_id = self.shared.next_claim.fetch_add(1, Ordering::Relaxed);
                records.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        status: IdempotencyStatus::InFlight,
                        result: None,
                        recorded_at: now,
                        ttl: policy.ttl,
                        claim_id,
                    },
                );
                debug!(key, "idempotency claim taken");
                return Ok(BeginOutcome::Proceed(ClaimTicket {
                    key: key.to_string(),
                    claim_id,
                }));
            };

            let conflict = GuardError::IdempotencyConflict {
                key: key.to_string(),
                status: existing.status,
            };
            match (existing.status, policy.on_duplicate) {
                (_, OnDuplicate::Raise) | (IdempotencyStatus::Failed, _) => return Err(conflict),
                (IdempotencyStatus::Completed, _) => {
                    return Ok(BeginOutcome::Duplicate {
                        status: IdempotencyStatus::Completed,
                        result: existing.result.clone(),
                    })
                }
                (IdempotencyStatus::InFlight, OnDuplicate::Return) => {
                    return Ok(BeginOutcome::Duplicate {
                        status: IdempotencyStatus::InFlight,
                        result: None,
                    })
                }
                (IdempotencyStatus::InFlight, OnDuplicate::Block) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(GuardError::Timeout {
                            operation: format!("waiting for in-flight request '{}'", key),
                            after: policy.wait_timeout,
                        });
                    }
                    let (guard, _) = self
                        .shared
                        .changed
                        .wait_timeout(records, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    records = guard;
                }
            }
        }
    }

    fn evict_expired(
        &self,
        records: &mut HashMap<String, IdempotencyRecord>,
        key: &str,
        now: DateTime<Utc>,
    ) {
        let Some(record) = records.get(key) else {
            return;
        };
        let lifetime = match record.status {
            IdempotencyStatus::InFlight => self.shared.in_flight_ttl,
            IdempotencyStatus::Completed => record.ttl,
            IdempotencyStatus::Failed => self.shared.failed_retry_ttl,
        };
        let expired = record
            .recorded_at
            .checked_add_signed(lifetime)
            .map_or(false, |end| end <= now);
        if expired {
            if record.status == IdempotencyStatus::InFlight {
                warn!(
                    key,
                    claimed_at = %record.recorded_at,
                    "reclaiming stuck in-flight idempotency record"
                );
            }
            records.remove(key);
        }
    }

    pub fn complete(&self, ticket: &ClaimTicket, result: Value) -> Result<(), GuardError> {
        self.complete_at(Utc::now(), ticket, result)
    }

    /// Store the result for `ticket`'s key, transitioning `in_flight → completed`.
    pub fn complete_at(
        &self,
        now: DateTime<Utc>,
        ticket: &ClaimTicket,
        result: Value,
    ) -> Result<(), GuardError> {
        let mut records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let record = self.owned_record(&mut records, ticket)?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.recorded_at = now;
        drop(records);
        self.shared.changed.notify_all();
        Ok(())
    }

    pub fn fail(&self, ticket: &ClaimTicket) -> Result<(), GuardError> {
        self.fail_at(Utc::now(), ticket)
    }

    /// Release the claim after a failed or cancelled execution.
    pub fn fail_at(&self, now: DateTime<Utc>, ticket: &ClaimTicket) -> Result<(), GuardError> {
        let mut records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let record = self.owned_record(&mut records, ticket)?;
        if self.shared.failed_retry_ttl <= Duration::zero() {
            records.remove(&ticket.key);
        } else {
            record.status = IdempotencyStatus::Failed;
            record.recorded_at = now;
        }
        drop(records);
        debug!(key = %ticket.key, "idempotency claim released");
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Hand back a claim whose action never ran (a later guard blocked).
    /// The key is free again at once, whatever `failed_retry_ttl` is.
    pub fn release(&self, ticket: &ClaimTicket) -> Result<(), GuardError> {
        let mut records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.owned_record(&mut records, ticket)?;
        records.remove(&ticket.key);
        drop(records);
        debug!(key = %ticket.key, "idempotency claim rolled back");
        self.shared.changed.notify_all();
        Ok(())
    }

    fn owned_record<'a>(
        &self,
        records: &'a mut HashMap<String, IdempotencyRecord>,
        ticket: &ClaimTicket,
    ) -> Result<&'a mut IdempotencyRecord, GuardError> {
        match records.get_mut(&ticket.key) {
            Some(r) if r.claim_id == ticket.claim_id && r.status == IdempotencyStatus::InFlight => {
                Ok(r)
            }
            // Our claim was reclaimed as stuck and someone else owns the key now.
            Some(r) => Err(GuardError::IdempotencyConflict {
                key: ticket.key.clone(),
                status: r.status,
            }),
            None => Err(GuardError::IdempotencyConflict {
                key: ticket.key.clone(),
                status: IdempotencyStatus::Failed,
            }),
        }
    }

    pub fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        let records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        records.get(key).cloned()
    }

    /// Records held, whatever their status.
    pub fn len(&self) -> usize {
        let records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record whose TTL has passed as of `now`.
    pub fn prune_at(&self, now: DateTime<Utc>) {
        let mut records = self
            .shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<String> = records.keys().cloned().collect();
        for key in keys {
            self.evict_expired(&mut records, &key, now);
        }
    }
}
