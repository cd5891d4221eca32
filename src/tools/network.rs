//! 网络抓取工具：GET 请求，带超时与结果大小限制
//!
//! 是否允许访问网络、访问哪些主机由权限评估决定（network_enabled / allowed_hosts）。
//! HTML 响应去除标签后返回；超过 max_result_chars 时截断并追加 ...[truncated]。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::tools::manifest::{ParamRole, ParamType, ToolManifest, ToolParameter};
use crate::tools::schema::require_str;
use crate::tools::{Tool, ToolContext, ToolError};

const USER_AGENT: &str = concat!("hearth/", env!("CARGO_PKG_VERSION"));

pub struct FetchTool {
    manifest: ToolManifest,
    client: Client,
    max_result_chars: usize,
}

/// 简易去除 HTML 标签并压缩空白
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!") || s.starts_with("<html") || s.starts_with("<HTML")
        || (s.contains("</") && (s.contains("<head") || s.contains("<body") || s.contains("<title")))
}

fn truncate_chars(body: String, max_chars: usize) -> (String, bool) {
    if body.chars().count() <= max_chars {
        return (body, false);
    }
    let mut cut: String = body.chars().take(max_chars).collect();
    cut.push_str("\n...[truncated]");
    (cut, true)
}

impl FetchTool {
    pub fn new(timeout_secs: u64, max_result_chars: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        let manifest = ToolManifest::new("network.fetch", "Fetch a URL over HTTP(S) and return its text.")
            .param(
                ToolParameter::required("url", ParamType::String)
                    .with_role(ParamRole::Url)
                    .describe("http:// or https:// URL"),
            )
            .idempotent(true)
            .network(true)
            .reversible(false);
        Self {
            manifest,
            client,
            max_result_chars,
        }
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = require_str(&args, "url")?;
        tracing::info!(url = %url, "network fetch");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ToolError::Failed(format!("HTTP {}", status)));
        }
        if let Some(len) = resp.content_length() {
            if len > ctx.memory_limit_bytes {
                return Err(ToolError::ResourceExceeded(format!("response of {} bytes", len)));
            }
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("read body: {}", e)))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let body = if looks_like_html(body) {
            strip_html_tags(body)
        } else {
            body.to_string()
        };
        let (content, truncated) = truncate_chars(body, self.max_result_chars);
        Ok(json!({
            "url": url,
            "status": status.as_u16(),
            "truncated": truncated,
            "content": content,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html() {
        let html = "<html><head><title>Hi</title></head><body><p>a   b</p></body></html>";
        assert!(looks_like_html(html));
        assert_eq!(strip_html_tags(html), "Hi a b");
        assert!(!looks_like_html("{\"json\": true}"));
    }

    #[test]
    fn test_truncate() {
        let (s, t) = truncate_chars("héllo".into(), 3);
        assert!(t);
        assert!(s.starts_with("hél"));
        let (s, t) = truncate_chars("ok".into(), 3);
        assert!(!t);
        assert_eq!(s, "ok");
    }

    #[test]
    fn test_manifest_flags() {
        let tool = FetchTool::new(5, 100);
        assert!(tool.manifest().network);
        assert!(!tool.manifest().reversible);
        assert!(tool.manifest().validate_structure().is_ok());
    }
}
