//! 引擎事件总线
//!
//! 每个步骤状态转换、确认请求、快照与回滚都发布一条 EngineEvent；
//! 没有订阅者时事件直接丢弃，慢订阅者会收到 Lagged。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::{SessionStatus, StepError, StepState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionSubmitted {
        session_id: String,
        steps: usize,
    },
    SessionStarted {
        session_id: String,
    },
    StepTransition {
        session_id: String,
        step: usize,
        tool: String,
        state: StepState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<StepError>,
    },
    ConfirmationRequested {
        session_id: String,
        step: usize,
        tool: String,
        message: String,
    },
    SnapshotCaptured {
        session_id: String,
        step: usize,
        snapshot_id: String,
        size_bytes: u64,
    },
    IrreversibleRecorded {
        session_id: String,
        step: usize,
        tool: String,
    },
    InterruptRequested {
        session_id: String,
    },
    SessionFinished {
        session_id: String,
        status: SessionStatus,
        skipped: usize,
    },
    RollbackCompleted {
        session_id: String,
        restored: Vec<String>,
        irreversible: Vec<usize>,
        remaining: usize,
    },
    SnapshotsExpired {
        entries_removed: usize,
        blobs_removed: usize,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            EngineEvent::SessionSubmitted { session_id, .. }
            | EngineEvent::SessionStarted { session_id }
            | EngineEvent::StepTransition { session_id, .. }
            | EngineEvent::ConfirmationRequested { session_id, .. }
            | EngineEvent::SnapshotCaptured { session_id, .. }
            | EngineEvent::IrreversibleRecorded { session_id, .. }
            | EngineEvent::InterruptRequested { session_id }
            | EngineEvent::SessionFinished { session_id, .. }
            | EngineEvent::RollbackCompleted { session_id, .. } => Some(session_id),
            EngineEvent::SnapshotsExpired { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
