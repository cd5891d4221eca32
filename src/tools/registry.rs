//! 工具注册表
//!
//! 所有工具实现 Tool trait（manifest / execute），由 ToolRegistry 按名注册与查找；
//! 编排期只读，注册只做结构校验。ToolExecutor 在调用时加超时并统一转 EngineError。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::EngineError;
use crate::tools::manifest::ToolManifest;

/// 工具执行时的资源上下文
///
/// 进程内工具只受输出字节上限约束；子进程（system.command、插件）另外受地址空间上限约束。
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// 输出/缓冲的字节上限，同时作为子进程的地址空间上限
    pub memory_limit_bytes: u64,
    /// 执行器施加的超时（工具可据此设置内部子进程超时）
    pub timeout: Duration,
    /// 超时后被取消，阻塞循环逐项检查
    pub cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ToolContext {
    pub fn new(memory_limit_bytes: u64, timeout: Duration) -> Self {
        Self {
            memory_limit_bytes,
            timeout,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// 在阻塞线程池上执行；闭包拿到取消 token。执行器超时后会等这些任务结束
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, ToolError>
    where
        F: FnOnce(CancellationToken) -> Result<T, ToolError> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks
            .spawn_blocking(move || f(cancel))
            .await
            .map_err(|e| ToolError::Failed(format!("worker aborted: {}", e)))?
    }

    /// 取消并等待仍在运行的阻塞任务
    pub(crate) async fn cancel_and_drain(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024, Duration::from_secs(60))
    }
}

/// 工具自身报告的失败
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),
}

impl ToolError {
    pub fn cancelled() -> Self {
        ToolError::Failed("cancelled".to_string())
    }
}

/// 工具 trait：声明式清单 + 固定的异步 execute（args 为规范化后的 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn manifest(&self) -> &ToolManifest;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;

    fn name(&self) -> &str {
        &self.manifest().name
    }
}

/// 单个工具的调用统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具：校验清单结构，拒绝重名
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), EngineError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), EngineError> {
        let manifest = tool.manifest();
        manifest
            .validate_structure()
            .map_err(EngineError::Registration)?;
        let name = manifest.name.clone();
        if self.tools.contains_key(&name) {
            return Err(EngineError::Registration(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        tracing::debug!(tool = %name, "tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    /// 按名查找；不存在时返回 UnknownTool
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, EngineError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTool(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn manifests(&self) -> Vec<ToolManifest> {
        let mut manifests: Vec<ToolManifest> =
            self.tools.values().map(|t| t.manifest().clone()).collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    /// 所有工具的 schema（注入规划器 prompt）
    pub fn schema_json(&self) -> String {
        let tools: Vec<Value> = self.manifests().iter().map(|m| m.to_schema()).collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 扫描目录中的 *.toml 清单并注册；单个文件失败只记录警告，返回成功注册的数量
    pub fn load_plugins(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "plugin dir not readable");
                return 0;
            }
        };
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let result = crate::tools::plugin::PluginTool::from_file(&path)
                .and_then(|tool| self.register(tool));
            match result {
                Ok(()) => loaded += 1,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping plugin manifest")
                }
            }
        }
        tracing::info!(dir = %dir.display(), loaded, "plugins loaded");
        loaded
    }

    /// 记录一次调用结果（由 ToolExecutor 调用）
    pub fn record_call(&self, name: &str, ok: bool, duration: Duration) {
        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(name.to_string()).or_default();
            entry.calls += 1;
            if ok {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            entry.total_duration_ms += duration.as_millis() as u64;
        }
    }

    pub fn stats(&self, name: &str) -> Option<ToolStats> {
        self.stats.lock().ok().and_then(|s| s.get(name).cloned())
    }

    pub fn all_stats(&self) -> HashMap<String, ToolStats> {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}
