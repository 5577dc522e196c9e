//! Ledger persistence: a full session written to NDJSON and SQLite sinks.

use actgate_core::config::GuardSpec;
use actgate_core::ledger::{FileLedgerSink, OutcomeStatus, SqliteLedgerSink};
use actgate_core::{
    Action, CredentialRef, DecisionLedger, GuardChain, GuardSet, LedgerRecord, Outcome, Session,
    SessionConfig, Verdict,
};
use serde_json::{json, Value};
use std::io::BufRead;
use std::sync::Arc;

fn drive(session: Session) {
    let chain = GuardChain::new();
    let lookup = GuardSet::new(vec![GuardSpec::Prove {
        kind: "order_id".into(),
        field: "order_id".into(),
        ttl_s: None,
    }])
    .unwrap();
    let refund = GuardSet::new(vec![GuardSpec::RequireFact {
        kind: "order_id".into(),
        arg: "order_id".into(),
    }])
    .unwrap();
    let refund_action = || {
        Action::new("refund_order")
            .with_arguments(json!({"order_id": "o1", "card_number": "4111111111111111"}))
            .with_credential_ref(CredentialRef::new("vault://payments/live"))
    };

    // Blocked: the order was never looked up.
    assert!(chain
        .run(&session, &refund_action(), &refund, |_| unreachable!())
        .is_err());
    chain
        .run(&session, &Action::new("lookup_order"), &lookup, |_| {
            Outcome::success(json!({"order_id": "o1"}))
        })
        .unwrap();
    chain
        .run(&session, &refund_action(), &refund, |_| {
            Outcome::success(json!({"refund_id": "r1"}))
        })
        .unwrap();
    session.close();
}

#[test]
fn test_ndjson_ledger_is_one_record_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.ndjson");
    let ledger = Arc::new(DecisionLedger::new(Box::new(
        FileLedgerSink::new(&path).unwrap(),
    )));

    drive(Session::open(SessionConfig::new().with_session_id("s1"), ledger.clone()));
    ledger.flush().unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let lines: Vec<Value> = std::io::BufReader::new(file)
        .lines()
        .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
        .collect();

    let kinds: Vec<_> = lines.iter().map(|l| l["record"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec!["decision", "decision", "outcome", "decision", "outcome", "session_closed"]
    );
    assert_eq!(lines[0]["verdict"], "block");
    assert_eq!(lines[0]["reasons"][0]["reason_code"], "F_FACT_MISSING");
    assert_eq!(
        lines[0]["reasons"][0]["detail"],
        "required order_id not established via any prior prove() call in this session"
    );
    assert_eq!(lines[3]["verdict"], "allow");
    assert_eq!(lines[3]["credential_ref"], "vault://payments/live");
    assert_eq!(lines[2]["facts_proven"][0], "order_id");
    assert_eq!(lines[5]["decisions"], 3);

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("4111111111111111"));
}

#[test]
fn test_sqlite_ledger_keeps_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let sink = SqliteLedgerSink::open(&path).unwrap();
    let ledger = Arc::new(DecisionLedger::new(Box::new(sink.clone())));

    drive(Session::open(SessionConfig::new().with_session_id("s2"), ledger));

    let records = SqliteLedgerSink::open(&path).unwrap().records().unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(sink.count_for_session("s2").unwrap(), 6);

    let verdicts: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            LedgerRecord::Decision(d) => Some(d.verdict),
            _ => None,
        })
        .collect();
    assert_eq!(verdicts, vec![Verdict::Block, Verdict::Allow, Verdict::Allow]);

    let statuses: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            LedgerRecord::Outcome(o) => Some(o.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![OutcomeStatus::Succeeded, OutcomeStatus::Succeeded]);
}
