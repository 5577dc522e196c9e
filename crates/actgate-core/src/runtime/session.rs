//! Session context: the unit of correlation.
//!
//! A session owns its fact store and (session-scoped) budget for its
//! lifetime. Ledger entries it produced outlive it. Closing is explicit,
//! and dropping an unclosed session finalizes it the same way, so the
//! `SessionClosed` summary is written on every exit path.

use crate::errors::GuardError;
use crate::ledger::{DecisionLedger, LedgerRecord, SessionSummary};
use crate::runtime::approval::ApprovalContext;
use crate::runtime::budget::{BudgetLedger, BudgetScope, BudgetUnit};
use crate::runtime::facts::{Fact, FactPolicy, FactStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Who the session acts for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

#[derive(Debug, Clone)]
enum BudgetSource {
    /// A fresh ledger scoped to this session.
    Limit { limit: f64, unit: BudgetUnit },
    /// A ledger shared with other sessions (user or tenant budget).
    Shared(BudgetLedger),
}

/// How to open a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    session_id: Option<String>,
    scope: Scope,
    fact_policy: FactPolicy,
    fact_ttl: Option<Duration>,
    budget: Option<BudgetSource>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.scope.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.scope.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_fact_policy(mut self, policy: FactPolicy) -> Self {
        self.fact_policy = policy;
        self
    }

    pub fn with_fact_ttl(mut self, ttl: Duration) -> Self {
        self.fact_ttl = Some(ttl);
        self
    }

    /// Budget private to the session.
    pub fn with_budget(mut self, limit: f64, unit: BudgetUnit) -> Self {
        self.budget = Some(BudgetSource::Limit { limit, unit });
        self
    }

    /// Charge a user / tenant ledger shared with other sessions.
    pub fn with_shared_budget(mut self, ledger: BudgetLedger) -> Self {
        self.budget = Some(BudgetSource::Shared(ledger));
        self
    }
}

#[derive(Debug)]
pub struct Session {
    id: String,
    scope: Scope,
    created_at: DateTime<Utc>,
    facts: FactStore,
    budget: Option<BudgetLedger>,
    /// Attempts per action name, for `max_attempts`.
    attempts: Mutex<HashMap<String, u32>>,
    decisions: AtomicU64,
    ledger: Arc<DecisionLedger>,
    closed: AtomicBool,
}

impl Session {
    pub fn open(config: SessionConfig, ledger: Arc<DecisionLedger>) -> Self {
        let id = config
            .session_id
            .unwrap_or_else(|| format!("ses_{}", uuid::Uuid::new_v4()));

        let mut facts = FactStore::new(config.fact_policy);
        if let Some(ttl) = config.fact_ttl {
            facts = facts.with_default_ttl(ttl);
        }

        let budget = config.budget.map(|source| match source {
            BudgetSource::Limit { limit, unit } => {
                BudgetLedger::new(BudgetScope::Session(id.clone()), limit, unit)
            }
            BudgetSource::Shared(ledger) => ledger,
        });

        info!(
            session_id = %id,
            user_id = config.scope.user_id.as_deref().unwrap_or("-"),
            tenant_id = config.scope.tenant_id.as_deref().unwrap_or("-"),
            "session opened"
        );

        Self {
            id,
            scope: config.scope,
            created_at: Utc::now(),
            facts,
            budget,
            attempts: Mutex::new(HashMap::new()),
            decisions: AtomicU64::new(0),
            ledger,
            closed: AtomicBool::new(false),
        }
    }

    /// Run `f` inside a session that is closed however `f` exits.
    pub fn scoped<T>(
        config: SessionConfig,
        ledger: Arc<DecisionLedger>,
        f: impl FnOnce(&Session) -> T,
    ) -> T {
        let session = Self::open(config, ledger);
        let out = f(&session);
        session.close();
        out
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn budget(&self) -> Option<&BudgetLedger> {
        self.budget.as_ref()
    }

    pub fn ledger(&self) -> &Arc<DecisionLedger> {
        &self.ledger
    }

    pub fn prove(&self, kind: &str, value: &str, source_action: &str) -> Result<Fact, GuardError> {
        self.facts.prove(kind, value, source_action)
    }

    pub fn require_fact(&self, kind: &str, expected: &str) -> Result<Fact, GuardError> {
        self.facts.require(kind, expected)
    }

    pub fn approval_context(&self) -> ApprovalContext {
        self.approval_context_at(Utc::now())
    }

    /// Snapshot an approval binds to: live facts plus budget state.
    pub fn approval_context_at(&self, now: DateTime<Utc>) -> ApprovalContext {
        ApprovalContext {
            session_id: self.id.clone(),
            facts: self.facts.snapshot_at(now),
            budget: self.budget.as_ref().map(BudgetLedger::snapshot),
        }
    }

    /// Count one attempt of `action`, refusing past `max_calls`.
    pub(crate) fn note_attempt(&self, action: &str, max_calls: u32) -> Result<u32, GuardError> {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(action.to_string()).or_insert(0);
        if *count >= max_calls {
            return Err(GuardError::AttemptsExhausted {
                action: action.to_string(),
                max_calls,
            });
        }
        *count += 1;
        Ok(*count)
    }

    pub fn attempts(&self, action: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.get(action).copied().unwrap_or(0)
    }

    pub(crate) fn note_decision(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decisions(&self) -> u64 {
        self.decisions.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session and write its summary.
    pub fn close(self) -> SessionSummary {
        self.finalize()
    }

    fn finalize(&self) -> SessionSummary {
        let summary = SessionSummary {
            session_id: self.id.clone(),
            scope: self.scope.clone(),
            opened_at: self.created_at,
            closed_at: Utc::now(),
            decisions: self.decisions(),
            facts_proven: self.facts.proven_count(),
            budget: self.budget.as_ref().map(BudgetLedger::snapshot),
        };
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(
                session_id = %self.id,
                decisions = summary.decisions,
                facts_proven = summary.facts_proven,
                "session closed"
            );
            // Write failures are already logged by the ledger; a session
            // summary is never fail-closed.
            let _ = self
                .ledger
                .append(&LedgerRecord::SessionClosed(summary.clone()));
        }
        summary
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerSink;

    fn ledger() -> (Arc<DecisionLedger>, MemoryLedgerSink) {
        let sink = MemoryLedgerSink::new();
        (Arc::new(DecisionLedger::new(Box::new(sink.clone()))), sink)
    }

    #[test]
    fn test_close_writes_summary_once() {
        let (ledger, sink) = ledger();
        let session = Session::open(
            SessionConfig::new()
                .with_session_id("s1")
                .with_budget(10.0, BudgetUnit::Usd),
            ledger,
        );
        session.prove("order_id", "o1", "act_1").unwrap();

        let summary = session.close();
        assert_eq!(summary.facts_proven, 1);
        assert_eq!(sink.records().len(), 1);
        assert!(matches!(
            &sink.records()[0],
            LedgerRecord::SessionClosed(s) if s.session_id == "s1"
        ));
    }

    #[test]
    fn test_drop_finalizes_unclosed_session() {
        let (ledger, sink) = ledger();
        {
            let _session = Session::open(SessionConfig::new(), ledger);
        }
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_scoped_closes_after_closure() {
        let (ledger, sink) = ledger();
        let id = Session::scoped(SessionConfig::new().with_user("u1"), ledger, |s| {
            assert_eq!(s.scope().user_id.as_deref(), Some("u1"));
            s.id().to_string()
        });
        assert!(id.starts_with("ses_"));
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_facts_do_not_leak_between_sessions() {
        let (ledger, _) = ledger();
        let a = Session::open(SessionConfig::new(), ledger.clone());
        let b = Session::open(SessionConfig::new(), ledger);
        a.prove("order_id", "o1", "act_1").unwrap();
        assert!(a.require_fact("order_id", "o1").is_ok());
        assert!(b.require_fact("order_id", "o1").is_err());
    }

    #[test]
    fn test_note_attempt_caps() {
        let (ledger, _) = ledger();
        let s = Session::open(SessionConfig::new(), ledger);
        assert_eq!(s.note_attempt("charge", 2).unwrap(), 1);
        assert_eq!(s.note_attempt("charge", 2).unwrap(), 2);
        assert!(matches!(
            s.note_attempt("charge", 2),
            Err(GuardError::AttemptsExhausted { max_calls: 2, .. })
        ));
        assert_eq!(s.attempts("charge"), 2);
    }

    #[test]
    fn test_approval_context_tracks_budget() {
        let (ledger, _) = ledger();
        let s = Session::open(SessionConfig::new().with_budget(10.0, BudgetUnit::Usd), ledger);
        let before = s.approval_context().context_hash().unwrap();
        s.budget().unwrap().reserve(1.0).unwrap();
        let after = s.approval_context().context_hash().unwrap();
        assert_ne!(before, after);
    }
}
