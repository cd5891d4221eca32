//! 计划执行报告：调用方总是拿到它，而不是裸错误

use serde::Serialize;

use crate::core::{HaltCause, SessionState, SessionStatus, StepRecord, StepState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub steps: Vec<StepRecord>,
    pub skipped: usize,
    /// 本次执行捕获的快照，按步骤顺序
    pub snapshot_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltCause>,
    pub interrupted: bool,
}

impl PlanReport {
    pub(crate) fn from_state(session_id: &str, state: &SessionState) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: state.status,
            skipped: state
                .steps
                .iter()
                .filter(|s| s.state == StepState::Skipped)
                .count(),
            snapshot_ids: state.steps.iter().filter_map(|s| s.snapshot_id.clone()).collect(),
            steps: state.steps.clone(),
            halt: state.halt.clone(),
            interrupted: state.interrupt_requested && state.status == SessionStatus::Interrupted,
        }
    }

    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.get(index)
    }

    pub fn states(&self) -> Vec<StepState> {
        self.steps.iter().map(|s| s.state).collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
