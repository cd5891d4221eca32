//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时/内存上限。execute 把工具调用放进独立任务，由外部计时器监督：
//! 超时则 abort 该任务、取消 ToolContext 并等待其阻塞任务结束，再返回 ToolTimeout；
//! panic 转为 ToolFailed；输出超过内存上限转为 ResourceExceeded。
//! 内存上限对进程内工具只约束输出大小，对子进程另外以 RLIMIT_AS 施加。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::EngineError;
use crate::tools::{Tool, ToolContext, ToolError, ToolRegistry};

/// 工具执行器：对每次调用施加超时与资源上限，并将结果映射为 EngineError
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    memory_limit_bytes: u64,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64, memory_limit_mb: u64) -> Self {
        Self::with_limits(
            registry,
            Duration::from_secs(timeout_secs),
            memory_limit_mb.saturating_mul(1024 * 1024),
        )
    }

    /// 以精确的时长/字节数构造（测试中常用毫秒级超时）
    pub fn with_limits(registry: Arc<ToolRegistry>, timeout: Duration, memory_limit_bytes: u64) -> Self {
        Self {
            registry,
            timeout,
            memory_limit_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 按名执行工具
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, EngineError> {
        let tool = self.registry.resolve(tool_name)?;
        self.invoke(tool, args).await
    }

    /// 执行已解析的工具；清单的 timeout_secs 可覆盖全局超时
    pub async fn invoke(&self, tool: Arc<dyn Tool>, args: Value) -> Result<Value, EngineError> {
        let tool_name = tool.name().to_string();
        let limit = tool
            .manifest()
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let ctx = ToolContext::new(self.memory_limit_bytes, limit);
        let start = Instant::now();
        let preview = args_preview(&args);

        let task_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { tool.execute(args, &task_ctx).await });
        let result = match timeout(limit, &mut handle).await {
            Ok(Ok(Ok(value))) => {
                let size = serde_json::to_vec(&value).map(|b| b.len() as u64).unwrap_or(0);
                if size > self.memory_limit_bytes {
                    Err(EngineError::ResourceExceeded(format!(
                        "{} produced {} bytes (limit {})",
                        tool_name, size, self.memory_limit_bytes
                    )))
                } else {
                    Ok(value)
                }
            }
            Ok(Ok(Err(ToolError::Failed(msg)))) => Err(EngineError::ToolFailed(msg)),
            Ok(Ok(Err(ToolError::ResourceExceeded(msg)))) => Err(EngineError::ResourceExceeded(msg)),
            Ok(Err(join_err)) => Err(EngineError::ToolFailed(format!(
                "{} aborted: {}",
                tool_name, join_err
            ))),
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                // 返回前确保工具已不再改动文件：子进程随任务一起被 kill，阻塞任务在取消后收尾
                ctx.cancel_and_drain().await;
                Err(EngineError::ToolTimeout(format!(
                    "{} exceeded {}ms",
                    tool_name,
                    limit.as_millis()
                )))
            }
        };

        let duration = start.elapsed();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(EngineError::ToolTimeout(_)) => "timeout",
            Err(EngineError::ResourceExceeded(_)) => "resource_exceeded",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration.as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        self.registry.record_call(&tool_name, result.is_ok(), duration);

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
