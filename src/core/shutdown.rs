//! 优雅关闭处理
//!
//! 统一的关闭信号监听和清理逻辑：运行中的会话在当前步骤结束后停下，
//! 快照元数据在退出前落盘。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::ExecutionSession;
use crate::snapshot::SnapshotManager;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
}

impl ShutdownManager {
    /// 创建新的关闭管理器
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_token.is_cancelled() {
            tracing::debug!(reason = ?reason, "shutdown triggered");
        }
        self.shutdown_token.cancel();
    }

    /// 是否已触发关闭
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("received SIGTERM, shutting down");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    /// 执行清理，返回清理是否成功
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：管理多个清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 等待清理完成的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    /// 创建新的关闭协调器
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    /// 注册清理任务（按注册顺序执行）
    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub fn len(&self) -> usize {
        self.cleanup_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleanup_tasks.is_empty()
    }

    /// 执行所有清理任务
    pub async fn run_cleanup(&self) {
        tracing::info!(tasks = self.cleanup_tasks.len(), "running cleanup tasks");

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "cleanup task completed");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "cleanup task failed");
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_secs = self.timeout_secs, "cleanup task timed out");
                }
            }
        }

        tracing::info!("all cleanup tasks finished");
    }

    /// 获取关闭管理器
    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 快照元数据清理任务：落盘尚未刷新的链与快照记录
pub struct SnapshotMetadataCleanup {
    snapshots: Arc<SnapshotManager>,
}

impl SnapshotMetadataCleanup {
    pub fn new(snapshots: Arc<SnapshotManager>) -> Self {
        Self { snapshots }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SnapshotMetadataCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.snapshots.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SnapshotMetadata"
    }
}

/// 中断所有仍在运行的会话，让它们在当前步骤结束后停下
pub struct InterruptSessionsCleanup {
    sessions: Vec<Arc<ExecutionSession>>,
}

impl InterruptSessionsCleanup {
    pub fn new(sessions: Vec<Arc<ExecutionSession>>) -> Self {
        Self { sessions }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for InterruptSessionsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        for session in &self.sessions {
            session.interrupt().await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InterruptSessions"
    }
}
