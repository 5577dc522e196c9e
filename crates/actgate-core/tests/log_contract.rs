//! Log contract: refusals and circuit transitions are logged with structured
//! fields, and argument values never reach the log output.

use actgate_core::config::GuardSpec;
use actgate_core::{Action, DecisionLedger, GuardChain, GuardSet, Outcome, Session, SessionConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct MockWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MockWriter {
    type Writer = MockWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl MockWriter {
    fn output(&self) -> String {
        String::from_utf8(self.buf.lock().unwrap().clone()).unwrap()
    }

    fn events(&self) -> Vec<Value> {
        self.output()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

fn setup_capture() -> (MockWriter, tracing::subscriber::DefaultGuard) {
    let writer = MockWriter {
        buf: Arc::new(Mutex::new(Vec::new())),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_env_filter(EnvFilter::new("actgate_core=debug"))
        .json()
        .finish();

    (writer, tracing::subscriber::set_default(subscriber))
}

fn session() -> Session {
    Session::open(
        SessionConfig::new().with_session_id("log-s1"),
        Arc::new(DecisionLedger::null()),
    )
}

// ============================================================================
// Refusals
// ============================================================================

#[test]
fn test_refusal_is_logged_with_reason_code() {
    let (writer, _guard) = setup_capture();
    let session = session();
    let guards = GuardSet::new(vec![GuardSpec::RequireFact {
        kind: "order_id".into(),
        arg: "order_id".into(),
    }])
    .unwrap();
    let action = Action::new("refund_order")
        .with_arguments(json!({"order_id": "o1", "card_number": "4111111111111111"}));

    assert!(!GuardChain::new()
        .authorize(&session, &action, &guards)
        .is_allowed());

    let events = writer.events();
    let refused = events
        .iter()
        .find(|e| e["fields"]["message"] == "action refused")
        .expect("refusal event");
    assert_eq!(refused["level"], "WARN");
    assert_eq!(refused["fields"]["session_id"], "log-s1");
    assert_eq!(refused["fields"]["reason_code"], "F_FACT_MISSING");
    assert_eq!(refused["fields"]["action"], "refund_order");

    assert!(!writer.output().contains("4111111111111111"));
}

#[test]
fn test_arg_scoped_rate_limit_does_not_log_argument() {
    let (writer, _guard) = setup_capture();
    let session = session();
    let guards = GuardSet::new(vec![GuardSpec::RateLimit {
        max_calls: 1,
        period: 60.0,
        scope_key: "arg:account".into(),
    }])
    .unwrap();
    let action = Action::new("transfer").with_arguments(json!({"account": "DE89370400440532013000"}));
    let chain = GuardChain::new();

    for _ in 0..2 {
        let _ = chain.authorize(&session, &action, &guards);
    }

    let output = writer.output();
    assert!(output.contains("R_RATE_LIMITED"));
    assert!(!output.contains("DE89370400440532013000"));
}

// ============================================================================
// Circuit transitions
// ============================================================================

#[test]
fn test_circuit_open_is_logged() {
    let (writer, _guard) = setup_capture();
    let session = session();
    let guards = GuardSet::new(vec![GuardSpec::CircuitBreaker {
        name: "payments".into(),
        max_fails: 1,
        reset_timeout: 30.0,
    }])
    .unwrap();

    let _ = GuardChain::new().run(&session, &Action::new("charge"), &guards, |_| {
        Outcome::failure("upstream 503")
    });

    let opened: Vec<_> = writer
        .events()
        .into_iter()
        .filter(|e| e["fields"]["message"] == "circuit opened after consecutive failures")
        .collect();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0]["fields"]["breaker"], "payments");
    assert_eq!(opened[0]["fields"]["failures"], 1);
}
