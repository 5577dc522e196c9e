//! Session-scoped fact store.
//!
//! Facts are what "legitimately happened so far" in a session: identifiers
//! produced by earlier proving calls. Enforcing calls check them, never
//! delete them, so one fact may back any number of later actions. The store
//! exists to catch cross-call failures single-call validation cannot see: an
//! identifier that was never produced (hallucinated) or one from a step that
//! has since been superseded.

use crate::errors::{GuardError, MissingFact};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// One proven piece of session state. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub kind: String,
    pub value: String,
    /// `action_id` of the call that produced the value.
    pub extracted_from: String,
    pub proven_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Fact {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// How re-proving a kind interacts with earlier values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactPolicy {
    /// Last value of a kind wins; earlier values become superseded. The
    /// kind's original `proven_at` is kept for age-based expiry.
    #[default]
    Overwrite,
    /// Every `(kind, value)` stays valid on its own.
    Accumulate,
    /// Re-proving a live `(kind, value)` is a `DuplicateFact` error.
    Unique,
}

/// A `(kind, expected value)` pair an enforcing call depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactRequirement {
    pub kind: String,
    pub expected: String,
}

impl FactRequirement {
    pub fn new(kind: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            expected: expected.into(),
        }
    }
}

#[derive(Debug, Default)]
struct FactTable {
    facts: HashMap<(String, String), Fact>,
    /// Latest value proven per kind.
    current: HashMap<String, String>,
    proven: u64,
}

impl FactTable {
    fn current_live(&self, kind: &str, now: DateTime<Utc>) -> Option<&Fact> {
        let value = self.current.get(kind)?;
        self.facts
            .get(&(kind.to_string(), value.clone()))
            .filter(|f| f.is_live_at(now))
    }
}

/// Session-scoped set of typed, expiring facts.
///
/// One session is normally driven by one agent run, so a single mutex is
/// enough here.
#[derive(Debug, Default)]
pub struct FactStore {
    policy: FactPolicy,
    default_ttl: Option<Duration>,
    table: Mutex<FactTable>,
}

impl FactStore {
    pub fn new(policy: FactPolicy) -> Self {
        Self {
            policy,
            default_ttl: None,
            table: Mutex::new(FactTable::default()),
        }
    }

    /// Facts proven without an explicit TTL expire after `ttl`.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn policy(&self) -> FactPolicy {
        self.policy
    }

    pub fn prove(
        &self,
        kind: &str,
        value: &str,
        source_action: &str,
    ) -> Result<Fact, GuardError> {
        self.prove_at(Utc::now(), kind, value, source_action, None)
    }

    pub fn prove_with_ttl(
        &self,
        kind: &str,
        value: &str,
        source_action: &str,
        ttl: Duration,
    ) -> Result<Fact, GuardError> {
        self.prove_at(Utc::now(), kind, value, source_action, Some(ttl))
    }

    /// Record a fact as of `now`.
    pub fn prove_at(
        &self,
        now: DateTime<Utc>,
        kind: &str,
        value: &str,
        source_action: &str,
        ttl: Option<Duration>,
    ) -> Result<Fact, GuardError> {
        let ttl = ttl.or(self.default_ttl);
        let key = (kind.to_string(), value.to_string());
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        let same_live = table.facts.get(&key).filter(|f| f.is_live_at(now));

        let origin = match self.policy {
            FactPolicy::Unique => {
                if same_live.is_some() {
                    return Err(GuardError::DuplicateFact {
                        kind: kind.to_string(),
                        value: value.to_string(),
                    });
                }
                None
            }
            FactPolicy::Accumulate => same_live.map(|f| f.proven_at),
            FactPolicy::Overwrite => table.current_live(kind, now).map(|f| f.proven_at),
        };

        let proven_at = origin.unwrap_or(now);
        let fact = Fact {
            kind: kind.to_string(),
            value: value.to_string(),
            extracted_from: source_action.to_string(),
            proven_at,
            // Past the representable range the fact simply never expires.
            expires_at: ttl.and_then(|ttl| proven_at.checked_add_signed(ttl)),
        };

        table.facts.insert(key, fact.clone());
        table.current.insert(kind.to_string(), value.to_string());
        table.proven += 1;

        tracing::debug!(
            kind = %fact.kind,
            source = %fact.extracted_from,
            "fact proven"
        );
        Ok(fact)
    }

    pub fn require(&self, kind: &str, expected: &str) -> Result<Fact, GuardError> {
        self.require_at(Utc::now(), kind, expected)
    }

    /// Check that `(kind, expected)` was proven in this session and is still
    /// usable as of `now`.
    pub fn require_at(
        &self,
        now: DateTime<Utc>,
        kind: &str,
        expected: &str,
    ) -> Result<Fact, GuardError> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let current = table.current_live(kind, now).map(|f| f.value.clone());

        let missing = |reason: MissingFact, found: Option<String>| GuardError::FactMissing {
            kind: kind.to_string(),
            expected: expected.to_string(),
            found,
            reason,
        };

        let Some(fact) = table.facts.get(&(kind.to_string(), expected.to_string())) else {
            return Err(missing(MissingFact::NeverProven, current));
        };

        if !fact.is_live_at(now) {
            let expired_at = fact.expires_at.unwrap_or(now);
            return Err(missing(MissingFact::Expired { expired_at }, current));
        }

        if self.policy == FactPolicy::Overwrite && current.as_deref() != Some(expected) {
            return Err(missing(MissingFact::Superseded, current));
        }

        Ok(fact.clone())
    }

    pub fn require_all(&self, requirements: &[FactRequirement]) -> Result<Vec<Fact>, GuardError> {
        self.require_all_at(Utc::now(), requirements)
    }

    /// Evaluate requirements in order; fail fast on the first missing one.
    pub fn require_all_at(
        &self,
        now: DateTime<Utc>,
        requirements: &[FactRequirement],
    ) -> Result<Vec<Fact>, GuardError> {
        requirements
            .iter()
            .map(|r| self.require_at(now, &r.kind, &r.expected))
            .collect()
    }

    /// Latest live value of a kind.
    pub fn current(&self, kind: &str) -> Option<Fact> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.current_live(kind, Utc::now()).cloned()
    }

    /// Sorted `(kind, value)` pairs usable as of `now`.
    ///
    /// Under `Overwrite`, superseded values are left out.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut live: Vec<(String, String)> = table
            .facts
            .values()
            .filter(|f| f.is_live_at(now))
            .filter(|f| {
                self.policy != FactPolicy::Overwrite
                    || table.current.get(&f.kind) == Some(&f.value)
            })
            .map(|f| (f.kind.clone(), f.value.clone()))
            .collect();
        live.sort();
        live
    }

    /// Number of successful `prove` calls so far.
    pub fn proven_count(&self) -> u64 {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .proven
    }
}
