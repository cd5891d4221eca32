//! 运行时上下文：启动时构建一次，持有配置、工具注册表、快照管理器、会话表、并发上限与事件总线
//!
//! 由 RuntimeBuilder 统一初始化，CLI 与测试共享同一套构建逻辑。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::config::{AppConfig, PolicySection};
use crate::core::session::session_key;
use crate::core::shutdown::{InterruptSessionsCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, SnapshotMetadataCleanup};
use crate::core::{EngineError, ExecutionSession, SessionRecord, SessionScheduler, SessionStatus};
use crate::engine::{ConfirmationChannel, EngineEvent, EventBus, PlanExecutor, PlanReport};
use crate::plan::Plan;
use crate::policy::Policy;
use crate::snapshot::{BlobStore, ExpireReport, FileMetadataStore, MetadataStore, RollbackReport, SnapshotLimits, SnapshotManager};
use crate::tools::{register_builtins, ToolExecutor, ToolRegistry};

/// 事件总线缓冲；慢订阅者会丢失最旧的事件
const EVENT_CAPACITY: usize = 256;

pub struct RuntimeContext {
    config: AppConfig,
    policy: RwLock<Arc<Policy>>,
    registry: Arc<ToolRegistry>,
    snapshots: Arc<SnapshotManager>,
    metadata: Arc<dyn MetadataStore>,
    sessions: RwLock<HashMap<String, Arc<ExecutionSession>>>,
    scheduler: SessionScheduler,
    events: EventBus,
    executor: PlanExecutor,
    shutdown: Arc<ShutdownManager>,
}

impl RuntimeContext {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn policy(&self) -> Arc<Policy> {
        self.policy.read().await.clone()
    }

    /// 接收计划，创建 PENDING 会话；只做结构检查，问题记录为警告
    pub async fn submit(&self, plan: Plan) -> Result<String, EngineError> {
        if self.shutdown.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        for issue in plan.structural_issues() {
            tracing::warn!(session = %session_id, issue = %issue, "plan structural issue");
        }
        let steps = plan.len();
        let chain = self.snapshots.open_chain(&session_id).await;
        let session = Arc::new(ExecutionSession::new(
            session_id.clone(),
            Arc::new(plan),
            self.policy().await,
            chain,
        ));
        self.persist_record(&session).await?;
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);
        tracing::info!(session = %session_id, steps, "plan submitted");
        self.events.publish(EngineEvent::SessionSubmitted {
            session_id: session_id.clone(),
            steps,
        });
        Ok(session_id)
    }

    /// 执行已提交的会话；超出并发上限时排队等待
    pub async fn run(
        &self,
        session_id: &str,
        confirmation: &dyn ConfirmationChannel,
    ) -> Result<PlanReport, EngineError> {
        let session = self.require_session(session_id).await?;
        let _permit = self.scheduler.acquire().await?;
        let report = self.executor.run(&session, confirmation).await?;
        if let Err(e) = self.persist_record(&session).await {
            tracing::error!(session = %session_id, error = %e, "session record write failed");
        }
        Ok(report)
    }

    /// submit + run
    pub async fn execute(
        &self,
        plan: Plan,
        confirmation: &dyn ConfirmationChannel,
    ) -> Result<PlanReport, EngineError> {
        let session_id = self.submit(plan).await?;
        self.run(&session_id, confirmation).await
    }

    /// 请求中断；返回本次调用是否设置了中断标志
    pub async fn interrupt(&self, session_id: &str) -> Result<bool, EngineError> {
        let session = self.require_session(session_id).await?;
        let set = session.interrupt().await;
        if set {
            self.events.publish(EngineEvent::InterruptRequested {
                session_id: session_id.to_string(),
            });
        }
        Ok(set)
    }

    /// 回滚最近 steps_back 个链条目；会话不在内存中时从元数据存储恢复快照链
    pub async fn rollback(&self, session_id: &str, steps_back: usize) -> Result<RollbackReport, EngineError> {
        if self.session(session_id).await.is_none() {
            let known = self.metadata.get(&session_key(session_id)).await?.is_some();
            let chain = self.snapshots.recover(session_id).await?;
            if !known && chain.len().await == 0 {
                return Err(EngineError::SessionNotFound(session_id.to_string()));
            }
        }
        let report = self.snapshots.chain_rollback(session_id, steps_back).await?;
        tracing::info!(
            session = %session_id,
            restored = report.restored_snapshot_ids().len(),
            irreversible = report.irreversible_steps().len(),
            remaining = report.remaining,
            "rollback completed"
        );
        self.events.publish(EngineEvent::RollbackCompleted {
            session_id: session_id.to_string(),
            restored: report
                .restored_snapshot_ids()
                .into_iter()
                .map(String::from)
                .collect(),
            irreversible: report.irreversible_steps(),
            remaining: report.remaining,
        });
        Ok(report)
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<ExecutionSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn require_session(&self, session_id: &str) -> Result<Arc<ExecutionSession>, EngineError> {
        self.session(session_id)
            .await
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// 只读审计记录：优先内存中的会话，其次元数据存储
    pub async fn session_record(&self, session_id: &str) -> Result<SessionRecord, EngineError> {
        if let Some(session) = self.session(session_id).await {
            return Ok(session.record().await);
        }
        match self.metadata.get(&session_key(session_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| EngineError::Persistence(format!("session {}: {}", session_id, e))),
            None => Err(EngineError::SessionNotFound(session_id.to_string())),
        }
    }

    /// 内存中与已持久化的会话 id（排序、去重）
    pub async fn list_sessions(&self) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for key in self.metadata.keys("session/").await? {
            if let Some(id) = key.strip_prefix("session/") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// 会话结束（对话关闭）：丢弃会话与其全部快照；运行中的会话不能关闭
    pub async fn close_session(&self, session_id: &str) -> Result<(), EngineError> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get(session_id) {
                if session.status().await == SessionStatus::Running {
                    return Err(EngineError::InvalidState(format!(
                        "session {} is still running",
                        session_id
                    )));
                }
            }
            sessions.remove(session_id);
        }
        self.snapshots.discard_session(session_id).await?;
        self.metadata.delete(&session_key(session_id)).await?;
        tracing::info!(session = %session_id, "session closed");
        Ok(())
    }

    /// 清理超过 TTL 的快照
    pub async fn expire_snapshots(&self) -> Result<ExpireReport, EngineError> {
        let report = self.snapshots.expire(Utc::now()).await?;
        self.events.publish(EngineEvent::SnapshotsExpired {
            entries_removed: report.entries_removed,
            blobs_removed: report.blobs_removed,
        });
        Ok(report)
    }

    /// 替换策略；只影响之后提交的会话
    pub async fn reload_policy(&self, section: &PolicySection) -> Result<(), EngineError> {
        let policy = Policy::from_section(section)?;
        *self.policy.write().await = Arc::new(policy);
        tracing::info!("policy reloaded");
        Ok(())
    }

    /// 关闭：拒绝新会话，让运行中的会话在当前步骤后停下，并刷新快照元数据
    pub async fn shutdown(&self) {
        self.shutdown.shutdown(ShutdownReason::UserInitiated);
        self.scheduler.close();
        let sessions: Vec<Arc<ExecutionSession>> = self.sessions.read().await.values().cloned().collect();
        let mut coordinator = ShutdownCoordinator::new(self.shutdown.clone());
        coordinator.register(InterruptSessionsCleanup::new(sessions));
        coordinator.register(SnapshotMetadataCleanup::new(self.snapshots.clone()));
        coordinator.run_cleanup().await;
    }

    async fn persist_record(&self, session: &ExecutionSession) -> Result<(), EngineError> {
        let record = session.record().await;
        let value = serde_json::to_value(&record).map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.metadata.put(&session_key(session.id()), &value).await
    }
}

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    registry: Option<ToolRegistry>,
    metadata: Option<Arc<dyn MetadataStore>>,
    builtins: bool,
    plugins: bool,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            metadata: None,
            builtins: true,
            plugins: true,
        }
    }

    /// 使用预先填充的注册表（内置工具仍会追加，除非 without_builtins）
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(store);
        self
    }

    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    pub fn without_plugins(mut self) -> Self {
        self.plugins = false;
        self
    }

    pub fn build(self) -> Result<RuntimeContext, EngineError> {
        let config = self.config;
        let policy = Policy::from_section(&config.policy)?;

        let mut registry = self.registry.unwrap_or_default();
        if self.builtins {
            register_builtins(&mut registry, &config)?;
        }
        if self.plugins {
            let dir = config
                .tools
                .custom_dir
                .clone()
                .unwrap_or_else(|| config.data_dir().join("tools"));
            registry.load_plugins(&dir);
        }
        let registry = Arc::new(registry);

        let metadata: Arc<dyn MetadataStore> = match self.metadata {
            Some(store) => store,
            None => Arc::new(FileMetadataStore::new(config.metadata_dir())),
        };
        let snapshots = Arc::new(SnapshotManager::new(
            BlobStore::new(config.snapshot_dir()),
            metadata.clone(),
            SnapshotLimits::from_section(&config.snapshot),
        ));
        let tools = Arc::new(ToolExecutor::new(
            registry.clone(),
            config.executor.tool_timeout_secs,
            config.executor.memory_limit_mb,
        ));
        let events = EventBus::new(EVENT_CAPACITY);
        let executor = PlanExecutor::new(tools, snapshots.clone(), events.clone());

        tracing::info!(
            tools = registry.len(),
            snapshot_dir = %config.snapshot_dir().display(),
            max_concurrent_sessions = config.app.max_concurrent_sessions,
            "runtime ready"
        );
        Ok(RuntimeContext {
            scheduler: SessionScheduler::new(config.app.max_concurrent_sessions),
            policy: RwLock::new(Arc::new(policy)),
            registry,
            snapshots,
            metadata,
            sessions: RwLock::new(HashMap::new()),
            events,
            executor,
            shutdown: Arc::new(ShutdownManager::new()),
            config,
        })
    }
}
