//! 计划执行器：逐步推进的状态机
//!
//! 每步：解析引用 → 查找工具 → 权限评估 → （确认）→ （快照）→ 受监管的调用 → 记录结果。
//! 每步前后检查中断标志，只在步骤边界停下。结构性错误中止计划；运行期错误只记录在该步，
//! 计划继续执行与之无关的步骤。快照、执行与回滚在同一会话内由快照链的锁串行化。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::core::{EngineError, ErrorKind, ExecutionSession, HaltCause, SessionStatus, StepError, StepRecord, StepState};
use crate::engine::confirm::{ConfirmationChannel, ConfirmationRequest, Decision};
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::report::PlanReport;
use crate::plan::{resolve_arguments, PlanGraph, PriorResult, ResolveError, Step};
use crate::policy::{evaluator, paths::expand_path, PermissionVerdict};
use crate::snapshot::{ChainEntry, SnapshotManager};
use crate::tools::{Tool, ToolExecutor};

/// 单步的结局
enum StepOutcome {
    Done,
    /// 运行期失败：记录后继续
    RuntimeFailed,
    /// 结构性失败：中止计划
    Halt,
    /// 等待确认时被中断
    Interrupted,
}

pub struct PlanExecutor {
    tools: Arc<ToolExecutor>,
    snapshots: Arc<SnapshotManager>,
    events: EventBus,
}

fn prior_result(steps: &[StepRecord], index: usize) -> PriorResult<'_> {
    match steps.get(index) {
        Some(r) if r.state == StepState::Done => match &r.output {
            Some(v) => PriorResult::Done(v),
            None => PriorResult::Unavailable,
        },
        Some(r) if r.state == StepState::Failed && r.error.as_ref().map(|e| e.kind.is_runtime()).unwrap_or(false) => {
            PriorResult::RuntimeFailed
        }
        _ => PriorResult::Unavailable,
    }
}

impl PlanExecutor {
    pub fn new(tools: Arc<ToolExecutor>, snapshots: Arc<SnapshotManager>, events: EventBus) -> Self {
        Self {
            tools,
            snapshots,
            events,
        }
    }

    /// 执行整个计划。会话必须处于 PENDING，否则返回 InvalidState；计划本身的失败体现在报告中
    pub async fn run(
        &self,
        session: &ExecutionSession,
        confirmation: &dyn ConfirmationChannel,
    ) -> Result<PlanReport, EngineError> {
        session.begin().await?;
        let sid = session.id().to_string();
        tracing::info!(session = %sid, steps = session.plan().len(), "plan started");
        self.events.publish(EngineEvent::SessionStarted {
            session_id: sid.clone(),
        });

        let graph = PlanGraph::new(session.plan());
        let total = session.plan().len();
        let mut interrupted = false;
        let mut halted = false;
        let mut next = 0;

        while next < total {
            if session.is_interrupt_requested() {
                interrupted = true;
                break;
            }
            let index = next;
            next += 1;
            match self.run_step(session, index, confirmation).await {
                StepOutcome::Done => {}
                StepOutcome::RuntimeFailed => {
                    let affected = graph.transitive_dependents(index);
                    if !affected.is_empty() {
                        tracing::warn!(
                            session = %sid,
                            step = index,
                            dependents = ?affected,
                            "step failed; dependent steps will not run"
                        );
                    }
                }
                StepOutcome::Halt => {
                    halted = true;
                    break;
                }
                StepOutcome::Interrupted => {
                    interrupted = true;
                    break;
                }
            }
            if session.is_interrupt_requested() {
                interrupted = true;
                break;
            }
        }

        let reason = if interrupted {
            "interrupted"
        } else if halted {
            "plan halted"
        } else {
            "not reached"
        };
        self.skip_remaining(session, reason).await;

        let mut state = session.state.write().await;
        let any_failed = state.steps.iter().any(|s| s.state == StepState::Failed);
        state.status = if interrupted {
            SessionStatus::Interrupted
        } else if halted || any_failed {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        state.finished_at = Some(Utc::now());
        let report = PlanReport::from_state(&sid, &state);
        drop(state);

        tracing::info!(
            session = %sid,
            status = ?report.status,
            skipped = report.skipped,
            snapshots = report.snapshot_ids.len(),
            "plan finished"
        );
        self.events.publish(EngineEvent::SessionFinished {
            session_id: sid,
            status: report.status,
            skipped: report.skipped,
        });
        Ok(report)
    }

    async fn run_step(
        &self,
        session: &ExecutionSession,
        index: usize,
        confirmation: &dyn ConfirmationChannel,
    ) -> StepOutcome {
        let plan = session.plan().clone();
        let step = &plan.steps[index];
        self.transition(session, index, StepState::Authorizing, |r| {
            r.started_at = Some(Utc::now());
        })
        .await;

        let resolved = {
            let state = session.state.read().await;
            resolve_arguments(&step.arguments, index, |i| prior_result(&state.steps, i))
        };
        let resolved = match resolved {
            Ok(v) => v,
            Err(ResolveError::Unresolved(msg)) => {
                return self.fail(session, index, EngineError::UnresolvedReference(msg)).await;
            }
            Err(ResolveError::FailedDependency { reason, .. }) => {
                self.skip_step(session, index, &reason).await;
                self.set_halt(session, index, StepError::new(ErrorKind::UnresolvedReference, reason))
                    .await;
                return StepOutcome::Halt;
            }
        };

        let tool = match self.tools.registry().resolve(&step.tool_name) {
            Ok(t) => t,
            Err(e) => return self.fail(session, index, e).await,
        };
        let manifest = tool.manifest().clone();
        let (args, verdict) = match evaluator::authorize(&manifest, step.risk_class, &resolved, session.policy()) {
            Ok(pair) => pair,
            Err(e) => return self.fail(session, index, e).await,
        };
        {
            let mut state = session.state.write().await;
            state.steps[index].verdict = Some(verdict.clone());
        }
        if !verdict.allowed {
            tracing::warn!(session = %session.id(), step = index, tool = %manifest.name, reason = %verdict.reason, "permission denied");
            return self
                .fail(session, index, EngineError::PermissionDenied(verdict.reason.clone()))
                .await;
        }

        if verdict.requires_confirmation {
            match self
                .await_confirmation(session, index, &manifest.confirmation_text(&args), &verdict, &args, confirmation)
                .await
            {
                Some(Decision::Approve) => {}
                Some(Decision::Deny) => {
                    return self
                        .fail(
                            session,
                            index,
                            EngineError::UserDenied(format!("step {} ({}) was not approved", index, manifest.name)),
                        )
                        .await;
                }
                None => {
                    self.skip_step(session, index, "interrupted while awaiting confirmation").await;
                    return StepOutcome::Interrupted;
                }
            }
        }

        self.snapshot_and_execute(session, index, step, tool, args, &verdict).await
    }

    /// 执行期间持有会话锁（快照链锁），同一会话的回滚与过期清理会等待
    async fn snapshot_and_execute(
        &self,
        session: &ExecutionSession,
        index: usize,
        step: &Step,
        tool: Arc<dyn Tool>,
        args: Map<String, Value>,
        verdict: &PermissionVerdict,
    ) -> StepOutcome {
        let sid = session.id().to_string();
        let manifest = tool.manifest().clone();
        let mut chain = session.chain().lock().await;

        if verdict.requires_snapshot {
            self.transition(session, index, StepState::Snapshotting, |_| {}).await;
            if manifest.reversible {
                let targets: Vec<PathBuf> = match &step.target_paths {
                    Some(paths) => paths.iter().map(|p| expand_path(p)).collect(),
                    None => evaluator::path_arguments(&manifest, &args)
                        .iter()
                        .map(|p| expand_path(p))
                        .collect(),
                };
                let snapshot = match self.snapshots.capture(&sid, index, &manifest.name, &targets).await {
                    Ok(s) => s,
                    Err(e) => {
                        drop(chain);
                        return self.fail(session, index, as_capture_error(e)).await;
                    }
                };
                if let Err(e) = self
                    .snapshots
                    .record(&sid, &mut chain, ChainEntry::Snapshot(snapshot.clone()))
                    .await
                {
                    self.snapshots.discard_snapshot(&snapshot, &chain).await;
                    drop(chain);
                    return self.fail(session, index, as_capture_error(e)).await;
                }
                self.events.publish(EngineEvent::SnapshotCaptured {
                    session_id: sid.clone(),
                    step: index,
                    snapshot_id: snapshot.id.clone(),
                    size_bytes: snapshot.size_bytes,
                });
                let mut state = session.state.write().await;
                state.steps[index].snapshot_id = Some(snapshot.id.clone());
            } else {
                let marker = ChainEntry::Irreversible {
                    step_index: index,
                    tool_name: manifest.name.clone(),
                    recorded_at: Utc::now(),
                };
                if let Err(e) = self.snapshots.record(&sid, &mut chain, marker).await {
                    drop(chain);
                    return self.fail(session, index, as_capture_error(e)).await;
                }
                tracing::info!(session = %sid, step = index, tool = %manifest.name, "irreversible step recorded");
                self.events.publish(EngineEvent::IrreversibleRecorded {
                    session_id: sid.clone(),
                    step: index,
                    tool: manifest.name.clone(),
                });
                let mut state = session.state.write().await;
                state.steps[index].rollback_eligible = false;
            }
        }

        self.transition(session, index, StepState::Executing, |r| {
            r.executed_at = Some(Utc::now());
        })
        .await;

        let result = self.tools.invoke(tool, Value::Object(args)).await;
        drop(chain);

        match result {
            Ok(output) => {
                self.transition(session, index, StepState::Done, |r| {
                    r.output = Some(output);
                    r.finished_at = Some(Utc::now());
                })
                .await;
                StepOutcome::Done
            }
            Err(e) => {
                let structural = e.is_structural();
                let outcome = self.fail(session, index, e).await;
                if structural {
                    outcome
                } else {
                    StepOutcome::RuntimeFailed
                }
            }
        }
    }

    /// 等待确认；中断时返回 None
    async fn await_confirmation(
        &self,
        session: &ExecutionSession,
        index: usize,
        message: &str,
        verdict: &PermissionVerdict,
        args: &Map<String, Value>,
        confirmation: &dyn ConfirmationChannel,
    ) -> Option<Decision> {
        let tool_name = session.plan().steps[index].tool_name.clone();
        self.transition(session, index, StepState::AwaitingConfirmation, |_| {}).await;
        self.events.publish(EngineEvent::ConfirmationRequested {
            session_id: session.id().to_string(),
            step: index,
            tool: tool_name.clone(),
            message: message.to_string(),
        });
        let request = ConfirmationRequest {
            session_id: session.id().to_string(),
            step_index: index,
            tool_name,
            message: message.to_string(),
            risk_class: verdict.risk_class,
            affected_items: verdict.affected_items,
            bulk_exceeded: verdict.bulk_exceeded,
            arguments: Value::Object(args.clone()),
        };
        tokio::select! {
            biased;
            _ = session.interrupt_token().cancelled() => None,
            decision = confirmation.confirm(request) => Some(decision),
        }
    }

    async fn transition<F>(&self, session: &ExecutionSession, index: usize, to: StepState, update: F)
    where
        F: FnOnce(&mut StepRecord),
    {
        let (tool, error) = {
            let mut state = session.state.write().await;
            let record = &mut state.steps[index];
            record.state = to;
            update(record);
            (record.tool_name.clone(), record.error.clone())
        };
        tracing::info!(session = %session.id(), step = index, tool = %tool, state = ?to, "step transition");
        self.events.publish(EngineEvent::StepTransition {
            session_id: session.id().to_string(),
            step: index,
            tool,
            state: to,
            error,
        });
    }

    /// 记录失败；结构性错误同时设置中止原因
    async fn fail(&self, session: &ExecutionSession, index: usize, err: EngineError) -> StepOutcome {
        let error = StepError::from(&err);
        let structural = error.kind.is_structural();
        if structural {
            tracing::warn!(session = %session.id(), step = index, error = %error, "step failed, halting plan");
        } else {
            tracing::warn!(session = %session.id(), step = index, error = %error, "step failed");
        }
        self.transition(session, index, StepState::Failed, |r| {
            r.error = Some(error.clone());
            r.finished_at = Some(Utc::now());
        })
        .await;
        if structural {
            self.set_halt(session, index, error).await;
            StepOutcome::Halt
        } else {
            StepOutcome::RuntimeFailed
        }
    }

    async fn set_halt(&self, session: &ExecutionSession, index: usize, error: StepError) {
        let mut state = session.state.write().await;
        if state.halt.is_none() {
            state.halt = Some(HaltCause { step: index, error });
        }
    }

    async fn skip_step(&self, session: &ExecutionSession, index: usize, reason: &str) {
        self.transition(session, index, StepState::Skipped, |r| {
            r.skip_reason = Some(reason.to_string());
            r.finished_at = Some(Utc::now());
        })
        .await;
    }

    async fn skip_remaining(&self, session: &ExecutionSession, reason: &str) {
        let pending: Vec<usize> = {
            let state = session.state.read().await;
            state
                .steps
                .iter()
                .filter(|s| s.state == StepState::Pending)
                .map(|s| s.index)
                .collect()
        };
        for index in pending {
            self.skip_step(session, index, reason).await;
        }
    }
}

fn as_capture_error(err: EngineError) -> EngineError {
    match err {
        EngineError::SnapshotCaptureFailed(_) => err,
        other => EngineError::SnapshotCaptureFailed(other.to_string()),
    }
}
