use super::{
    reason_codes, Decision, DecisionLedger, GuardOutcome, GuardReason, LedgerError, LedgerRecord,
    Verdict,
};
use crate::errors::GuardKind;

/// RAII guard that ensures a decision is ALWAYS recorded.
///
/// Every `authorize` call records exactly one decision, even when guard
/// evaluation panics or returns early. If the recorder is dropped without
/// [`DecisionRecorder::record`], it records a block with `S_INTERNAL_ERROR`.
///
/// ```ignore
/// let mut recorder = DecisionRecorder::new(&ledger, Decision::new(..));
/// recorder.push(GuardReason::pass(GuardKind::Facts, None));
/// let (decision, written) = recorder.record(Verdict::Allow);
/// ```
pub struct DecisionRecorder<'l> {
    ledger: &'l DecisionLedger,
    decision: Decision,
    armed: bool,
}

impl<'l> DecisionRecorder<'l> {
    pub fn new(ledger: &'l DecisionLedger, decision: Decision) -> Self {
        Self {
            ledger,
            decision,
            armed: true,
        }
    }

    pub fn push(&mut self, reason: GuardReason) {
        self.decision.reasons.push(reason);
    }

    pub fn set_approver(&mut self, approver_id: String) {
        self.decision.approver_id = Some(approver_id);
    }

    pub fn decision_id(&self) -> &str {
        &self.decision.decision_id
    }

    /// Set the verdict and append. Consumes the recorder.
    pub fn record(mut self, verdict: Verdict) -> (Decision, Result<(), LedgerError>) {
        self.armed = false;
        self.decision.verdict = verdict;
        let decision = self.decision.clone();
        let written = self.ledger.append(&LedgerRecord::Decision(decision.clone()));
        (decision, written)
    }
}

impl Drop for DecisionRecorder<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.decision.reasons.push(GuardReason {
            guard: GuardKind::Action,
            outcome: GuardOutcome::Block,
            reason_code: reason_codes::S_INTERNAL_ERROR.to_string(),
            detail: Some("authorization aborted before a verdict (panic or early return)".to_string()),
        });
        self.decision.verdict = Verdict::Block;
        let _ = self
            .ledger
            .append(&LedgerRecord::Decision(self.decision.clone()));
    }
}
