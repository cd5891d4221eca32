//! 权限评估：(工具清单, 规范化参数, 策略) → PermissionVerdict
//!
//! 顺序：网络开关 → 路径拒绝/允许 → 内容大小 → 批量阈值 → 风险基线。
//! 对结构合法的输入从不返回错误；参数不符在 normalize_arguments 阶段已经以 InvalidArguments 失败。

use serde_json::{Map, Value};

use crate::core::EngineError;
use crate::policy::{paths, Policy, PermissionVerdict};
use crate::tools::manifest::{ParamRole, ToolManifest};
use crate::tools::schema::normalize_arguments;
use crate::tools::RiskClass;

/// 生效风险：规划器给出的等级低于工具默认时抬到默认值
pub fn effective_risk(manifest: &ToolManifest, step_risk: Option<RiskClass>) -> RiskClass {
    step_risk
        .map(|r| r.max(manifest.risk_class))
        .unwrap_or(manifest.risk_class)
}

/// 规范化参数后评估；参数不符返回 InvalidArguments
pub fn authorize(
    manifest: &ToolManifest,
    step_risk: Option<RiskClass>,
    raw_args: &Value,
    policy: &Policy,
) -> Result<(Map<String, Value>, PermissionVerdict), EngineError> {
    let args = normalize_arguments(manifest, raw_args)?;
    let verdict = evaluate(manifest, step_risk, &args, policy);
    Ok((args, verdict))
}

/// 评估规范化后的参数
pub fn evaluate(
    manifest: &ToolManifest,
    step_risk: Option<RiskClass>,
    args: &Map<String, Value>,
    policy: &Policy,
) -> PermissionVerdict {
    let risk = effective_risk(manifest, step_risk);
    let requires_snapshot = !manifest.idempotent || risk == RiskClass::High;
    let affected = affected_items(manifest, args);
    let deny = |reason: String| PermissionVerdict {
        allowed: false,
        requires_confirmation: false,
        requires_snapshot,
        bulk_exceeded: false,
        risk_class: risk,
        affected_items: affected,
        reason,
    };

    if manifest.network {
        if !policy.network_enabled {
            return deny(format!("{} needs network access, which is disabled", manifest.name));
        }
        if let Some(reason) = check_hosts(manifest, args, policy) {
            return deny(reason);
        }
    }

    for raw in path_arguments(manifest, args) {
        let path = paths::expand_path(&raw);
        if let Some(p) = policy.deny.iter().find(|p| p.matches(&path)) {
            return deny(format!(
                "path '{}' matches deny pattern '{}'",
                path.display(),
                p.as_str()
            ));
        }
        if !manifest.idempotent {
            if let Some(p) = policy.deny.iter().find(|p| p.lies_under(&path)) {
                return deny(format!(
                    "path '{}' contains locations matching deny pattern '{}'",
                    path.display(),
                    p.as_str()
                ));
            }
        }
        if !policy.allow.is_empty() && !policy.allow.iter().any(|p| p.matches(&path)) {
            return deny(format!("path '{}' is outside the allowed locations", path.display()));
        }
    }

    if let Some(Value::String(content)) = args.get("content") {
        if content.len() as u64 > policy.max_content_bytes {
            return deny(format!(
                "content of {} bytes exceeds the {} byte limit",
                content.len(),
                policy.max_content_bytes
            ));
        }
    }

    let bulk_exceeded = affected > policy.bulk_threshold;
    let mut reasons = Vec::new();
    if bulk_exceeded {
        reasons.push(format!(
            "affects {} items (threshold {})",
            affected, policy.bulk_threshold
        ));
    }
    let by_risk = match risk {
        RiskClass::Low => false,
        RiskClass::Medium => policy.confirm_writes,
        RiskClass::High => true,
    };
    if by_risk {
        reasons.push(format!("{:?} risk", risk));
    }
    let by_manifest = manifest.requires_confirmation && policy.confirm_writes;
    if by_manifest && !by_risk {
        reasons.push("tool requests confirmation".to_string());
    }

    let requires_confirmation = bulk_exceeded || by_risk || by_manifest;
    PermissionVerdict {
        allowed: true,
        requires_confirmation,
        requires_snapshot,
        bulk_exceeded,
        risk_class: risk,
        affected_items: affected,
        reason: if reasons.is_empty() {
            "allowed".to_string()
        } else {
            format!("allowed; confirm: {}", reasons.join(", "))
        },
    }
}

/// 路径参数值（包括命令中形似路径的词），原样未展开
pub fn path_arguments(manifest: &ToolManifest, args: &Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for param in &manifest.parameters {
        let Some(value) = args.get(&param.name) else {
            continue;
        };
        match (param.role, value) {
            (ParamRole::Path, Value::String(s)) => out.push(s.clone()),
            (ParamRole::PathList, Value::Array(items)) => {
                out.extend(items.iter().filter_map(|v| v.as_str().map(String::from)))
            }
            (ParamRole::PathList, Value::String(s)) => out.push(s.clone()),
            (ParamRole::Command, Value::String(cmd)) => out.extend(paths::path_like_tokens(cmd)),
            _ => {}
        }
    }
    out
}

fn affected_items(manifest: &ToolManifest, args: &Map<String, Value>) -> usize {
    manifest
        .parameters
        .iter()
        .filter_map(|p| match (p.role, args.get(&p.name)) {
            (ParamRole::PathList, Some(Value::Array(items))) => Some(items.len()),
            (ParamRole::Path, Some(Value::String(_))) => Some(1),
            _ => None,
        })
        .sum()
}

fn check_hosts(manifest: &ToolManifest, args: &Map<String, Value>, policy: &Policy) -> Option<String> {
    for param in manifest.parameters.iter().filter(|p| p.role == ParamRole::Url) {
        let Some(Value::String(raw)) = args.get(&param.name) else {
            continue;
        };
        let url = match reqwest::Url::parse(raw) {
            Ok(url) => url,
            Err(e) => return Some(format!("invalid url '{}': {}", raw, e)),
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Some(format!("scheme '{}' is not allowed", url.scheme()));
        }
        if policy.allowed_hosts.is_empty() {
            continue;
        }
        let host = url.host_str().unwrap_or("").to_lowercase();
        if !policy.allowed_hosts.iter().any(|p| p.matches(&host)) {
            return Some(format!("host '{}' is not in allowed_hosts", host));
        }
    }
    None
}
