//! 用户自定义工具：自定义目录下的 *.toml 清单，运行「程序 + 参数模板」实现动态扩展
//!
//! 清单字段与 ToolManifest 相同，另加 `program`、`args`、可选 `working_dir`。
//! 参数模板中 {{key}} 从规范化后的参数中取值；整个模板项恰为 {{key}} 且值为数组时展开为多个参数。
//! 执行时无 shell，直接 exec program + substituted args。

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::core::EngineError;
use crate::tools::manifest::ToolManifest;
use crate::tools::limits::{apply_memory_limit, hit_memory_limit};
use crate::tools::{Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize)]
struct PluginFile {
    #[serde(flatten)]
    manifest: ToolManifest,
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
}

/// 从清单文件构建的插件工具
pub struct PluginTool {
    manifest: ToolManifest,
    program: String,
    args_template: Vec<String>,
    working_dir: Option<PathBuf>,
}

fn placeholders(template: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                out.push(after[..end].trim());
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    out
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl PluginTool {
    pub fn from_toml(source: &str) -> Result<Self, EngineError> {
        let file: PluginFile =
            toml::from_str(source).map_err(|e| EngineError::Registration(e.to_string()))?;
        if file.program.trim().is_empty() {
            return Err(EngineError::Registration(format!(
                "tool '{}' has an empty program",
                file.manifest.name
            )));
        }
        for template in &file.args {
            for key in placeholders(template) {
                if file.manifest.parameter(key).is_none() {
                    return Err(EngineError::Registration(format!(
                        "tool '{}' template uses undeclared parameter '{}'",
                        file.manifest.name, key
                    )));
                }
            }
        }
        Ok(Self {
            manifest: file.manifest,
            program: file.program,
            args_template: file.args,
            working_dir: file.working_dir,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source)
            .map_err(|e| EngineError::Registration(format!("{}: {}", path.display(), e)))
    }

    /// 替换模板中的 {{key}}；args 为规范化后的 JSON 对象
    fn substitute(&self, args: &Value) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args_template.len());
        for template in &self.args_template {
            let keys = placeholders(template);
            if keys.len() == 1 && template.trim() == format!("{{{{{}}}}}", keys[0]) {
                if let Some(Value::Array(items)) = self.lookup(args, keys[0]) {
                    out.extend(items.iter().map(value_text));
                    continue;
                }
            }
            let mut s = template.clone();
            for key in keys {
                let val = self.lookup(args, key).map(value_text).unwrap_or_default();
                s = s.replace(&format!("{{{{{}}}}}", key), &val);
            }
            out.push(s);
        }
        out
    }

    fn lookup<'a>(&self, args: &'a Value, key: &str) -> Option<&'a Value> {
        let canonical = self.manifest.parameter(key).map(|p| p.name.as_str()).unwrap_or(key);
        args.get(canonical)
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let argv = self.substitute(&args);
        tracing::info!(tool = %self.manifest.name, program = %self.program, "plugin tool invoke");
        let mut cmd = Command::new(&self.program);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(crate::policy::paths::expand_path(&dir.to_string_lossy()));
        }
        apply_memory_limit(&mut cmd, ctx.memory_limit_bytes);
        let output = cmd
            .output()
            .await
            .map_err(|e| ToolError::Failed(format!("plugin spawn failed: {}", e)))?;
        if (output.stdout.len() + output.stderr.len()) as u64 > ctx.memory_limit_bytes {
            return Err(ToolError::ResourceExceeded(format!(
                "plugin output exceeded {} bytes",
                ctx.memory_limit_bytes
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if hit_memory_limit(&output.status, &stderr) {
            return Err(ToolError::ResourceExceeded(format!(
                "plugin exceeded memory limit of {} bytes",
                ctx.memory_limit_bytes
            )));
        }
        if !output.status.success() {
            return Err(ToolError::Failed(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        let data = serde_json::from_str::<Value>(stdout.trim())
            .unwrap_or_else(|_| Value::String(stdout.trim().to_string()));
        Ok(json!({
            "exit_code": output.status.code(),
            "data": data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
name = "user.echo_files"
description = "Echo file names"
program = "echo"
args = ["{{files}}", "n={{count}}"]
risk_class = "low"
idempotent = true

[[parameters]]
name = "files"
type = "array"
role = "path_list"

[[parameters]]
name = "count"
type = "integer"
required = false
default = 1
"#;

    #[test]
    fn test_parse_and_substitute() {
        let tool = PluginTool::from_toml(ECHO).unwrap();
        assert_eq!(tool.manifest().name, "user.echo_files");
        assert!(tool.manifest().idempotent);
        let argv = tool.substitute(&json!({"files": ["/a", "/b"], "count": 2}));
        assert_eq!(argv, vec!["/a", "/b", "n=2"]);
    }

    #[test]
    fn test_undeclared_placeholder_rejected() {
        let src = "name = \"x.y\"\nprogram = \"echo\"\nargs = [\"{{nope}}\"]\n";
        assert!(matches!(PluginTool::from_toml(src), Err(EngineError::Registration(_))));
    }

    #[test]
    fn test_empty_program_rejected() {
        assert!(PluginTool::from_toml("name = \"x.y\"\nprogram = \" \"\n").is_err());
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let tool = PluginTool::from_toml(ECHO).unwrap();
        let out = tool
            .execute(json!({"files": ["/a"], "count": 1}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out["data"], json!("/a n=1"));
    }
}
