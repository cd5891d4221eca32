//! 权限策略：路径允许/拒绝 glob、批量阈值、按风险的确认规则、网络开关
//!
//! 策略在会话创建时拷贝一份（Arc<Policy>），会话生命周期内不可变；重新加载只影响之后的会话。

pub mod evaluator;
pub mod paths;

use serde::{Deserialize, Serialize};

use crate::config::PolicySection;
use crate::core::EngineError;
use crate::tools::RiskClass;

pub use evaluator::evaluate;

/// 编译后的路径 glob（`~` 已展开）
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    pattern: glob::Pattern,
    /// `dir/**` 额外匹配 `dir` 本身
    dir_itself: Option<std::path::PathBuf>,
    /// 第一个通配符之前的目录部分
    literal_prefix: std::path::PathBuf,
}

impl PathPattern {
    pub fn new(raw: &str) -> Result<Self, EngineError> {
        let expanded = paths::expand_tilde(raw.trim());
        let text = expanded.to_string_lossy().to_string();
        let pattern = glob::Pattern::new(&text)
            .map_err(|e| EngineError::Config(format!("invalid path pattern '{}': {}", raw, e)))?;
        let dir_itself = text
            .strip_suffix("/**")
            .map(|base| paths::normalize(std::path::Path::new(if base.is_empty() { "/" } else { base })));
        let literal_prefix = literal_prefix(&text);
        Ok(Self {
            raw: raw.to_string(),
            pattern,
            dir_itself,
            literal_prefix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &std::path::Path) -> bool {
        let opts = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        if self.pattern.matches_path_with(path, opts) {
            return true;
        }
        self.dir_itself.as_deref() == Some(path)
    }

    /// 模式覆盖的区域位于 dir 之下（递归操作 dir 会触及被该模式匹配的路径）
    pub fn lies_under(&self, dir: &std::path::Path) -> bool {
        self.literal_prefix != dir && self.literal_prefix.starts_with(dir)
    }
}

fn literal_prefix(text: &str) -> std::path::PathBuf {
    let cut = text.find(['*', '?', '[', '{']).unwrap_or(text.len());
    let head = &text[..cut];
    let dir = if cut == text.len() || head.ends_with('/') {
        std::path::Path::new(head)
    } else {
        std::path::Path::new(head).parent().unwrap_or(std::path::Path::new("/"))
    };
    paths::normalize(dir)
}

/// 会话级不可变策略
#[derive(Debug, Clone)]
pub struct Policy {
    pub allow: Vec<PathPattern>,
    pub deny: Vec<PathPattern>,
    pub bulk_threshold: usize,
    pub confirm_writes: bool,
    pub network_enabled: bool,
    pub allowed_hosts: Vec<glob::Pattern>,
    pub max_content_bytes: u64,
}

impl Policy {
    pub fn from_section(section: &PolicySection) -> Result<Self, EngineError> {
        let allow = section
            .allow
            .iter()
            .map(|p| PathPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = section
            .deny
            .iter()
            .map(|p| PathPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let allowed_hosts = section
            .allowed_hosts
            .iter()
            .map(|h| {
                glob::Pattern::new(&h.to_lowercase())
                    .map_err(|e| EngineError::Config(format!("invalid host pattern '{}': {}", h, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allow,
            deny,
            bulk_threshold: section.bulk_threshold,
            confirm_writes: section.confirm_writes,
            network_enabled: section.network_enabled,
            allowed_hosts,
            max_content_bytes: section.max_file_mb.saturating_mul(1024 * 1024),
        })
    }

    /// 不限制路径的宽松策略（测试与受信环境）
    pub fn permissive() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            bulk_threshold: 50,
            confirm_writes: false,
            network_enabled: false,
            allowed_hosts: Vec::new(),
            max_content_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_section(&PolicySection::default()).unwrap_or_else(|_| Self::permissive())
    }
}

/// 授权结论（派生，不持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionVerdict {
    pub allowed: bool,
    pub requires_confirmation: bool,
    pub requires_snapshot: bool,
    /// 受影响项数是否超过批量阈值
    pub bulk_exceeded: bool,
    /// 生效风险等级（规划器给出的等级只能被抬高到工具默认值）
    pub risk_class: RiskClass,
    /// 受影响的项数（路径参数计数）
    pub affected_items: usize,
    pub reason: String,
}
