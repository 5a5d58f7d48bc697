//! The frozen step schema of a long process.
//!
//! A [`ProcessSteps`] value is embedded in every persisted process. The
//! step list and compensation map are snapshotted from the process
//! definition when the process starts and never updated afterwards — a
//! code change that alters the steps requires declaring a new process
//! type. The in-memory dispatch table is rebuilt from the registry on
//! every run; this value is the stable contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Step ledger and cursor state for one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSteps {
    steps: Vec<String>,
    compensations: BTreeMap<String, String>,
    checkpoints: BTreeMap<String, Value>,
    step_index: usize,
    undo_index: i64,
    failure_msg: Option<String>,
}

impl ProcessSteps {
    /// Create a fresh ledger from a frozen schema.
    pub fn new(steps: Vec<String>, compensations: BTreeMap<String, String>) -> Self {
        Self {
            steps,
            compensations,
            checkpoints: BTreeMap::new(),
            step_index: 0,
            undo_index: -1,
            failure_msg: None,
        }
    }

    /// Whether the process is unwinding completed steps.
    pub fn is_compensating(&self) -> bool {
        self.undo_index >= 0
    }

    /// Whether every forward step has completed.
    pub fn is_complete(&self) -> bool {
        self.step_index >= self.steps.len()
    }

    /// The forward step the cursor points at.
    pub fn current_step(&self) -> Option<&str> {
        self.steps.get(self.step_index).map(String::as_str)
    }

    /// The step the compensation cursor points at.
    pub fn current_undo_step(&self) -> Option<&str> {
        if self.undo_index < 0 {
            return None;
        }
        self.steps.get(self.undo_index as usize).map(String::as_str)
    }

    /// The compensation registered for a forward step, if any.
    pub fn compensation_for(&self, step: &str) -> Option<&str> {
        self.compensations.get(step).map(String::as_str)
    }

    /// The checkpoint a forward step recorded, if any.
    pub fn checkpoint_for(&self, step: &str) -> Option<&Value> {
        self.checkpoints.get(step)
    }

    /// While compensating, the step that threw (the one at the forward
    /// cursor when the unwind began).
    pub fn failed_step(&self) -> Option<&str> {
        if !self.is_compensating() {
            return None;
        }
        self.steps.get(self.step_index).map(String::as_str)
    }

    /// Total number of forward steps.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Number of forward steps completed so far.
    pub fn completed_count(&self) -> usize {
        self.step_index.min(self.steps.len())
    }

    /// The forward cursor.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// The compensation cursor; −1 means not compensating.
    pub fn undo_index(&self) -> i64 {
        self.undo_index
    }

    /// The message of the failure that started the unwind.
    pub fn failure_msg(&self) -> Option<&str> {
        self.failure_msg.as_deref()
    }

    /// Move the forward cursor past the current step.
    pub fn advance(&mut self) {
        self.step_index += 1;
    }

    /// Persist the checkpoint a step handed back.
    pub fn record_checkpoint(&mut self, step: &str, value: Value) {
        self.checkpoints.insert(step.to_owned(), value);
    }

    /// Start compensating: the undo cursor points at the last completed
    /// step, and the failure message is kept for the compensations.
    pub fn begin_undo(&mut self, msg: impl Into<String>) {
        self.undo_index = self.step_index as i64 - 1;
        self.failure_msg = Some(msg.into());
    }

    /// Move the undo cursor to the previous completed step.
    pub fn advance_undo(&mut self) {
        self.undo_index -= 1;
    }

    /// End the unwind.
    pub fn finish_undo(&mut self) {
        self.undo_index = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ProcessSteps {
        let compensations =
            BTreeMap::from([("charge".to_owned(), "refund_charge".to_owned())]);
        ProcessSteps::new(
            vec!["charge".to_owned(), "ship".to_owned(), "notify".to_owned()],
            compensations,
        )
    }

    #[test]
    fn fresh_ledger_starts_at_the_first_step() {
        let steps = schema();

        assert!(!steps.is_compensating());
        assert!(!steps.is_complete());
        assert_eq!(steps.current_step(), Some("charge"));
        assert_eq!(steps.total_steps(), 3);
        assert_eq!(steps.completed_count(), 0);
        assert_eq!(steps.undo_index(), -1);
    }

    #[test]
    fn advance_walks_to_completion() {
        let mut steps = schema();

        steps.advance();
        assert_eq!(steps.current_step(), Some("ship"));
        steps.advance();
        steps.advance();

        assert!(steps.is_complete());
        assert_eq!(steps.current_step(), None);
        assert_eq!(steps.completed_count(), 3);
    }

    #[test]
    fn begin_undo_points_at_the_last_completed_step() {
        let mut steps = schema();
        steps.advance(); // charge done
        steps.begin_undo("ship blew up");

        assert!(steps.is_compensating());
        assert_eq!(steps.undo_index(), 0);
        assert_eq!(steps.current_undo_step(), Some("charge"));
        assert_eq!(steps.failed_step(), Some("ship"));
        assert_eq!(steps.failure_msg(), Some("ship blew up"));
    }

    #[test]
    fn undo_cursor_walks_back_and_finishes() {
        let mut steps = schema();
        steps.advance();
        steps.advance();
        steps.begin_undo("notify failed");

        assert_eq!(steps.current_undo_step(), Some("ship"));
        steps.advance_undo();
        assert_eq!(steps.current_undo_step(), Some("charge"));
        steps.advance_undo();
        assert_eq!(steps.current_undo_step(), None);
        assert_eq!(steps.undo_index(), -1);

        steps.finish_undo();
        assert!(!steps.is_compensating());
        // The failure message survives for the final process state.
        assert_eq!(steps.failure_msg(), Some("notify failed"));
    }

    #[test]
    fn failure_at_the_first_step_has_nothing_to_undo() {
        let mut steps = schema();
        steps.begin_undo("charge failed");

        assert_eq!(steps.undo_index(), -1);
        assert!(!steps.is_compensating());
        assert_eq!(steps.current_undo_step(), None);
        assert_eq!(steps.failure_msg(), Some("charge failed"));
    }

    #[test]
    fn checkpoints_are_kept_per_step() {
        let mut steps = schema();
        steps.record_checkpoint("charge", json!({"txn": "t1"}));

        assert_eq!(steps.checkpoint_for("charge"), Some(&json!({"txn": "t1"})));
        assert_eq!(steps.checkpoint_for("ship"), None);
    }

    #[test]
    fn compensation_lookup() {
        let steps = schema();

        assert_eq!(steps.compensation_for("charge"), Some("refund_charge"));
        assert_eq!(steps.compensation_for("ship"), None);
    }

    #[test]
    fn schema_survives_a_serde_round_trip() {
        let mut steps = schema();
        steps.advance();
        steps.record_checkpoint("charge", json!({"txn": "t1"}));
        steps.begin_undo("boom");

        let json = serde_json::to_string(&steps).unwrap();
        let restored: ProcessSteps = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, steps);
    }
}
