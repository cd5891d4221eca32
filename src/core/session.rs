//! 执行会话：一次请求的计划、步骤记录、快照链与中断标志
//!
//! RUNNING 期间只有执行器写入步骤记录；结束后会话只读，回滚只修改快照链与文件系统。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, StepError};
use crate::plan::Plan;
use crate::policy::{PermissionVerdict, Policy};
use crate::snapshot::SnapshotChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Running,
    Interrupted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Pending,
    Authorizing,
    AwaitingConfirmation,
    Snapshotting,
    Executing,
    Done,
    Failed,
    Skipped,
}

/// 单步的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub tool_name: String,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// 跳过原因（依赖失败、被中断、前面的步骤中止了计划）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<PermissionVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// false 表示该步的效果无法快照，回滚时会被跳过
    pub rollback_eligible: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(index: usize, tool_name: &str) -> Self {
        Self {
            index,
            tool_name: tool_name.to_string(),
            state: StepState::Pending,
            output: None,
            error: None,
            skip_reason: None,
            verdict: None,
            snapshot_id: None,
            rollback_eligible: true,
            started_at: None,
            executed_at: None,
            finished_at: None,
        }
    }
}

/// 计划中止的原因：哪一步、什么错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltCause {
    pub step: usize,
    pub error: StepError,
}

/// 会话的可变部分（执行器持有写锁推进）
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub steps: Vec<StepRecord>,
    pub interrupt_requested: bool,
    pub halt: Option<HaltCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct ExecutionSession {
    id: String,
    plan: Arc<Plan>,
    policy: Arc<Policy>,
    created_at: DateTime<Utc>,
    pub(crate) state: RwLock<SessionState>,
    interrupt: CancellationToken,
    chain: Arc<SnapshotChain>,
}

impl ExecutionSession {
    pub fn new(id: impl Into<String>, plan: Arc<Plan>, policy: Arc<Policy>, chain: Arc<SnapshotChain>) -> Self {
        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepRecord::pending(i, &s.tool_name))
            .collect();
        Self {
            id: id.into(),
            plan,
            policy,
            created_at: Utc::now(),
            state: RwLock::new(SessionState {
                status: SessionStatus::Pending,
                steps,
                interrupt_requested: false,
                halt: None,
                started_at: None,
                finished_at: None,
            }),
            interrupt: CancellationToken::new(),
            chain,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// 会话创建时捕获的策略（之后的 reload 不影响本会话）
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn chain(&self) -> &Arc<SnapshotChain> {
        &self.chain
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status
    }

    pub async fn steps(&self) -> Vec<StepRecord> {
        self.state.read().await.steps.clone()
    }

    /// PENDING -> RUNNING；其他状态下拒绝
    pub(crate) async fn begin(&self) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if state.status != SessionStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "session {} is {:?}, expected PENDING",
                self.id, state.status
            )));
        }
        state.status = SessionStatus::Running;
        state.started_at = Some(Utc::now());
        Ok(())
    }

    /// 请求中断。只在 RUNNING 时生效，重复调用无额外效果；返回本次调用是否设置了标志
    pub async fn interrupt(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status != SessionStatus::Running || state.interrupt_requested {
            return false;
        }
        state.interrupt_requested = true;
        self.interrupt.cancel();
        tracing::info!(session = %self.id, "interrupt requested");
        true
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    /// 只读审计记录
    pub async fn record(&self) -> SessionRecord {
        let state = self.state.read().await;
        SessionRecord {
            session_id: self.id.clone(),
            goal: self.plan.goal.clone(),
            status: state.status,
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            interrupted: state.interrupt_requested,
            halt: state.halt.clone(),
            snapshot_ids: state.steps.iter().filter_map(|s| s.snapshot_id.clone()).collect(),
            steps: state.steps.clone(),
            plan: (*self.plan).clone(),
        }
    }
}

/// 会话的只读审计记录，持久化在元数据存储 `session/<id>` 下
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default)]
    pub goal: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub interrupted: bool,
    #[serde(default)]
    pub halt: Option<HaltCause>,
    #[serde(default)]
    pub snapshot_ids: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub plan: Plan,
}

pub fn session_key(session_id: &str) -> String {
    format!("session/{}", session_id)
}
