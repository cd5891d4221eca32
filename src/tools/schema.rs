//! 参数 schema 校验与计划 JSON Schema 生成
//!
//! normalize_arguments 在权限评估前执行：别名归一、填默认值、类型与可选值检查；
//! 不符即 InvalidArguments（不可重试的结构性失败）。

use schemars::schema_for;
use serde_json::{Map, Value};

use crate::core::EngineError;
use crate::plan::Plan;
use crate::tools::manifest::{ParamRole, ToolManifest};

/// 按清单规范化参数，返回以参数正式名为键的对象
pub fn normalize_arguments(manifest: &ToolManifest, args: &Value) -> Result<Map<String, Value>, EngineError> {
    let empty = Map::new();
    let input = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(EngineError::InvalidArguments(format!(
                "{}: arguments must be an object, got {}",
                manifest.name, other
            )))
        }
    };

    let mut out = Map::new();
    for (key, value) in input {
        let param = manifest.parameter(key).ok_or_else(|| {
            EngineError::InvalidArguments(format!("{}: unknown parameter '{}'", manifest.name, key))
        })?;
        if out.contains_key(&param.name) {
            return Err(EngineError::InvalidArguments(format!(
                "{}: parameter '{}' given more than once",
                manifest.name, param.name
            )));
        }
        let mut value = value.clone();
        // 单个字符串传给路径列表时包成数组
        if param.role == ParamRole::PathList && value.is_string() {
            value = Value::Array(vec![value]);
        }
        if !param.kind.accepts(&value) {
            return Err(EngineError::InvalidArguments(format!(
                "{}: parameter '{}' expects {:?}, got {}",
                manifest.name, param.name, param.kind, value
            )));
        }
        if param.role == ParamRole::PathList {
            if let Some(items) = value.as_array() {
                if items.iter().any(|v| !v.is_string()) {
                    return Err(EngineError::InvalidArguments(format!(
                        "{}: '{}' must be a list of path strings",
                        manifest.name, param.name
                    )));
                }
            }
        }
        if let Some(choices) = &param.choices {
            if !choices.contains(&value) {
                return Err(EngineError::InvalidArguments(format!(
                    "{}: '{}' must be one of {}",
                    manifest.name,
                    param.name,
                    Value::Array(choices.clone())
                )));
            }
        }
        out.insert(param.name.clone(), value);
    }

    for param in &manifest.parameters {
        if out.contains_key(&param.name) {
            continue;
        }
        match (&param.default, param.required) {
            (Some(default), _) => {
                out.insert(param.name.clone(), default.clone());
            }
            (None, true) => {
                return Err(EngineError::InvalidArguments(format!(
                    "{}: missing required parameter '{}'",
                    manifest.name, param.name
                )))
            }
            (None, false) => {}
        }
    }
    Ok(out)
}

/// 从规范化参数中取字符串
pub fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, crate::tools::ToolError> {
    str_arg(args, key).ok_or_else(|| crate::tools::ToolError::Failed(format!("missing '{}'", key)))
}

pub fn bool_arg(args: &Value, key: &str) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn string_list(args: &Value, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// 计划的 JSON Schema 字符串，可拼入规划器 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Plan);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
