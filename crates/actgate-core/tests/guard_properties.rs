//! Integration tests for the guard invariants under real parallelism.
//!
//! Each test drives the public API from many threads at once and checks the
//! property that must hold regardless of interleaving.

use actgate_core::config::GuardSpec;
use actgate_core::ledger::MemoryLedgerSink;
use actgate_core::runtime::{
    BeginOutcome, BreakerConfig, BudgetScope, CircuitPermit, IdempotencyPolicy,
};
use actgate_core::{
    Action, ApprovalIssuer, ApprovalVerifier, AuthorizeResult, BudgetBook, BudgetLedger,
    BudgetUnit, CircuitRegistry, CircuitStatus, DecisionLedger, GuardChain, GuardError, GuardSet,
    IdempotencyCoordinator, IdempotencyStatus, OnDuplicate, Outcome, RunOutput, Session,
    SessionConfig, Verdict,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn memory_session(config: SessionConfig) -> (Session, MemoryLedgerSink) {
    let sink = MemoryLedgerSink::new();
    let ledger = Arc::new(DecisionLedger::new(Box::new(sink.clone())));
    (Session::open(config, ledger), sink)
}

// =============================================================================
// Budget monotonicity
// =============================================================================
#[test]
fn test_concurrent_reserves_never_overspend() {
    let budget = BudgetLedger::new(BudgetScope::Tenant("acme".into()), 100.0, BudgetUnit::Usd);
    let rejected = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let budget = budget.clone();
            let rejected = rejected.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    if let Err(e) = budget.reserve(1.0) {
                        assert!(matches!(e, GuardError::BudgetExceeded { .. }));
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let snapshot = budget.snapshot();
    assert_eq!(snapshot.used, 100.0);
    assert_eq!(rejected.load(Ordering::SeqCst), 60);
}

#[test]
fn test_shared_tenant_budget_spans_sessions() {
    let book = BudgetBook::new();
    let scope = BudgetScope::Tenant("acme".into());
    let chain = GuardChain::new();
    let set = GuardSet::default();

    let (a, _) = memory_session(
        SessionConfig::new().with_shared_budget(book.ledger(scope.clone(), 5.0, BudgetUnit::Usd)),
    );
    let (b, _) = memory_session(
        SessionConfig::new().with_shared_budget(book.ledger(scope.clone(), 5.0, BudgetUnit::Usd)),
    );

    let spend = |session: &Session| {
        chain.run(session, &Action::new("search").with_cost_estimate(3.0), &set, |_| {
            Outcome::success(json!({})).with_cost(3.0)
        })
    };
    spend(&a).unwrap();
    let err = spend(&b).unwrap_err();
    assert!(matches!(err, GuardError::BudgetExceeded { used, .. } if used == 3.0));
    assert_eq!(book.get(&scope).unwrap().snapshot().used, 3.0);
}

// =============================================================================
// Exactly-once
// =============================================================================
#[test]
fn test_concurrent_begin_has_one_winner() {
    let coordinator = IdempotencyCoordinator::default();
    let policy = IdempotencyPolicy {
        ttl: Duration::minutes(10),
        on_duplicate: OnDuplicate::Return,
        wait_timeout: std::time::Duration::from_secs(1),
    };
    let barrier = Arc::new(Barrier::new(12));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                coordinator.begin("charge-o1", &policy).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            BeginOutcome::Proceed(ticket) => Some(ticket.clone()),
            BeginOutcome::Duplicate { .. } => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);

    coordinator
        .complete(&winners[0], json!({"charge_id": "ch_1"}))
        .unwrap();
    for _ in 0..3 {
        assert_eq!(
            coordinator.begin("charge-o1", &policy).unwrap(),
            BeginOutcome::Duplicate {
                status: IdempotencyStatus::Completed,
                result: Some(json!({"charge_id": "ch_1"})),
            }
        );
    }
}

#[test]
fn test_blocking_duplicates_wait_for_the_single_execution() {
    let (session, _sink) = memory_session(SessionConfig::new());
    let session = Arc::new(session);
    let chain = GuardChain::new();
    let set = GuardSet::new(vec![GuardSpec::Idempotent {
        ttl_s: 600,
        on_duplicate: OnDuplicate::Block,
        key_arg: Some("order_id".into()),
        wait_timeout_s: Some(5.0),
    }])
    .unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (session, chain, set) = (session.clone(), chain.clone(), set.clone());
            let executions = executions.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let action = Action::new("charge").with_arguments(json!({"order_id": "o1"}));
                barrier.wait();
                chain.run(&session, &action, &set, |_| {
                    executions.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(50));
                    Outcome::success(json!({"charge_id": "ch_1"}))
                })
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    for result in results {
        let value = match result {
            RunOutput::Executed(v) => v,
            RunOutput::Duplicate { result, .. } => result.unwrap(),
        };
        assert_eq!(value, json!({"charge_id": "ch_1"}));
    }
}

#[test]
fn test_block_wait_times_out_on_stuck_claim() {
    let coordinator = IdempotencyCoordinator::default();
    let policy = IdempotencyPolicy {
        ttl: Duration::minutes(10),
        on_duplicate: OnDuplicate::Block,
        wait_timeout: std::time::Duration::from_millis(50),
    };
    let _stuck = coordinator.begin("k", &policy).unwrap();

    let err = coordinator.begin("k", &policy).unwrap_err();
    assert!(matches!(err, GuardError::Timeout { .. }));
}

// =============================================================================
// Circuit breaker
// =============================================================================
#[test]
fn test_concurrent_failures_open_once() {
    let registry = CircuitRegistry::new();
    let config = BreakerConfig {
        max_fails: 3,
        reset_timeout: Duration::seconds(30),
    };
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let permit = registry.acquire_at(t0(), "payments", config);
                barrier.wait();
                if let Ok(permit) = permit {
                    registry.record_failure_at(t0(), "payments", permit);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let state = registry.state("payments").unwrap();
    assert_eq!(state.status, CircuitStatus::Open);
    assert_eq!(state.opened_at, Some(t0()));

    // Exactly one trial after the reset timeout.
    let later = t0() + Duration::seconds(30);
    assert_eq!(
        registry.acquire_at(later, "payments", config).unwrap(),
        CircuitPermit::Trial
    );
    assert!(registry.acquire_at(later, "payments", config).is_err());
}

// =============================================================================
// Rate limiter
// =============================================================================
#[test]
fn test_concurrent_callers_share_one_window() {
    let (session, _sink) = memory_session(SessionConfig::new().with_user("u1"));
    let session = Arc::new(session);
    let chain = GuardChain::new();
    let set = GuardSet::new(vec![GuardSpec::RateLimit {
        max_calls: 10,
        period: 60.0,
        scope_key: "user".into(),
    }])
    .unwrap();
    let allowed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let (session, chain, set) = (session.clone(), chain.clone(), set.clone());
            let allowed = allowed.clone();
            thread::spawn(move || {
                if chain
                    .authorize_at(t0(), &session, &Action::new("search"), &set)
                    .is_allowed()
                {
                    allowed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(allowed.load(Ordering::SeqCst), 10);

    let next = chain.authorize_at(
        t0() + Duration::seconds(61),
        &session,
        &Action::new("search"),
        &set,
    );
    assert!(next.is_allowed());
}

// =============================================================================
// Approval binding
// =============================================================================
#[test]
fn test_approval_does_not_survive_context_change() {
    let (session, _sink) = memory_session(SessionConfig::new());
    let issuer = ApprovalIssuer::generate("ops-oncall");
    let mut verifier = ApprovalVerifier::new();
    verifier.trust("ops-oncall", issuer.verifying_key()).unwrap();
    let chain = GuardChain::new().with_approvals(verifier);

    let action = Action::new("delete_account")
        .with_arguments(json!({"account": "a1"}))
        .requiring_approval();
    let token = issuer
        .issue_for_at(t0(), &action, &session.approval_context_at(t0()), Duration::minutes(5))
        .unwrap();

    // The session learns something new after the approval was granted.
    session
        .facts()
        .prove_at(t0(), "ticket", "T-9", "act_x", None)
        .unwrap();

    let result = chain.authorize_at(
        t0(),
        &session,
        &action.with_approval(token),
        &GuardSet::default(),
    );
    match result {
        AuthorizeResult::Block { error, .. } => assert!(matches!(
            error,
            GuardError::ApprovalInvalid {
                reason: actgate_core::ApprovalFailure::ContextMismatch { .. }
            }
        )),
        other => panic!("expected block, got {}", other.verdict()),
    }
}

// =============================================================================
// Ledger completeness
// =============================================================================
#[test]
fn test_every_authorize_records_exactly_one_decision() {
    let (session, sink) = memory_session(SessionConfig::new().with_budget(5.0, BudgetUnit::Usd));
    let session = Arc::new(session);
    let chain = GuardChain::new();
    let set = GuardSet::new(vec![
        GuardSpec::RateLimit {
            max_calls: 20,
            period: 60.0,
            scope_key: "session".into(),
        },
        GuardSpec::MaxAttempts { calls: 30 },
    ])
    .unwrap();

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let (session, chain, set) = (session.clone(), chain.clone(), set.clone());
            thread::spawn(move || {
                let action = Action::new("search").with_cost_estimate(f64::from(i % 7));
                chain.authorize_at(t0(), &session, &action, &set).verdict()
            })
        })
        .collect();
    let verdicts: Vec<Verdict> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(sink.decisions().len(), 40);
    assert_eq!(session.decisions(), 40);
    let allows = verdicts.iter().filter(|v| **v == Verdict::Allow).count();
    let recorded = sink
        .decisions()
        .iter()
        .filter(|d| d.verdict == Verdict::Allow)
        .count();
    assert_eq!(allows, recorded);
    assert!(allows <= 20);
}
