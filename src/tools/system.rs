//! 系统命令工具：白名单命令，禁止危险子串
//!
//! 仅允许配置中的命令名（首词）；禁止 rm -rf、wget、chmod 777 等子串；
//! 通过 sh -c 执行。命令的效果无法快照，清单声明 reversible = false。
//! 超时由执行器在外部施加，子进程随任务取消被杀死（kill_on_drop）。
//! 子进程的地址空间受 memory_limit_bytes 约束，撞上上限报告为资源超限。

use std::collections::HashSet;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::tools::limits::{apply_memory_limit, hit_memory_limit};
use crate::tools::manifest::{ParamRole, ParamType, RiskClass, ToolManifest, ToolParameter};
use crate::tools::schema::{require_str, str_arg};
use crate::tools::{Tool, ToolContext, ToolError};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

pub struct CommandTool {
    manifest: ToolManifest,
    allowed_commands: HashSet<String>,
}

impl CommandTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        let manifest = ToolManifest::new("system.command", "Run an allowlisted shell command.")
            .param(
                ToolParameter::required("cmd", ParamType::String)
                    .with_role(ParamRole::Command)
                    .with_alias("command")
                    .describe("Command line; the first word must be allowlisted"),
            )
            .param(
                ToolParameter::optional("cwd", ParamType::String)
                    .with_role(ParamRole::Path)
                    .describe("Working directory"),
            )
            .risk(RiskClass::High)
            .reversible(false)
            .confirm("Run `{cmd}`?");
        Self {
            manifest,
            allowed_commands,
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("forbidden pattern: {}", forbidden));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("command '{}' not in allowlist", name))
        }
    }
}

/// 读取至多 limit 字节；第二个返回值表示是否超限
async fn read_limited<R: AsyncRead + Unpin>(reader: Option<R>, limit: u64) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut buf).await?;
    let over = buf.len() as u64 > limit;
    buf.truncate(limit as usize);
    Ok((buf, over))
}

#[async_trait]
impl Tool for CommandTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let command = require_str(&args, "cmd")?.trim().to_string();
        self.check(&command).map_err(ToolError::Failed)?;
        tracing::info!(command = %command, "system command execute");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", &command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = str_arg(&args, "cwd") {
            cmd.current_dir(crate::policy::paths::expand_path(cwd));
        }
        apply_memory_limit(&mut cmd, ctx.memory_limit_bytes);
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Failed(format!("spawn failed: {}", e)))?;

        let limit = ctx.memory_limit_bytes;
        let (stdout, stderr) = tokio::join!(
            read_limited(child.stdout.take(), limit),
            read_limited(child.stderr.take(), limit)
        );
        let (stdout, stdout_over) = stdout.map_err(|e| ToolError::Failed(e.to_string()))?;
        let (stderr, stderr_over) = stderr.map_err(|e| ToolError::Failed(e.to_string()))?;
        if stdout_over || stderr_over {
            let _ = child.kill().await;
            return Err(ToolError::ResourceExceeded(format!(
                "command output exceeded {} bytes",
                limit
            )));
        }
        let status = child
            .wait()
            .await
            .map_err(|e| ToolError::Failed(format!("wait failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();
        if hit_memory_limit(&status, &stderr) {
            return Err(ToolError::ResourceExceeded(format!(
                "command exceeded memory limit of {} bytes",
                limit
            )));
        }
        if !status.success() {
            return Err(ToolError::Failed(format!(
                "exit {:?}: {}",
                status.code(),
                stderr.trim()
            )));
        }
        Ok(json!({
            "command": command,
            "exit_code": status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}
