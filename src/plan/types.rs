//! 计划数据模型
//!
//! Plan 是有序的 Step 列表，交给执行器后不可变；步骤下标从 0 开始且稳定。
//! 参数可以是字面 JSON 值，也可以引用之前某一步的结果（可带点号路径）。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use schemars::gen::SchemaGenerator;
use schemars::schema::{Metadata, Schema, SchemaObject, SubschemaValidation};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::tools::RiskClass;

/// 外部规划器产出的执行计划
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// 用户请求的原文或摘要（仅用于审计）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub steps: Vec<Step>,
}

/// 一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// 已注册的工具名，如 filesystem.search
    #[serde(alias = "tool")]
    pub tool_name: String,
    /// 参数名 → 字面值或 {"$ref": i, "path": "a.b"}
    #[serde(default, alias = "args")]
    pub arguments: BTreeMap<String, ArgValue>,
    /// 规划器给出的风险等级；低于工具默认值时按默认值处理
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_class: Option<RiskClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 显式声明的快照目标；缺省时取工具的路径参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_paths: Option<Vec<String>>,
}

impl Step {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: BTreeMap::new(),
            risk_class: None,
            description: None,
            target_paths: None,
        }
    }

    /// 参数中引用到的全部步骤下标
    pub fn references(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for value in self.arguments.values() {
            value.collect_refs(&mut out);
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// 「取第 step 步的结果」，path 为结果内的点号路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StepRef {
    #[serde(rename = "$ref")]
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "$result[{}].{}", self.step, path),
            None => write!(f, "$result[{}]", self.step),
        }
    }
}

/// 参数值：字面量、引用，或内部含引用的数组/对象
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Literal(Value),
    Reference(StepRef),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
}

fn legacy_ref_pattern() -> Option<&'static regex::Regex> {
    static PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"^\$result\[(\d+)\](?:\.([A-Za-z0-9_.\-]+))?$").ok())
        .as_ref()
}

impl ArgValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ArgValue::Literal(value.into())
    }

    pub fn reference(step: usize, path: Option<&str>) -> Self {
        ArgValue::Reference(StepRef {
            step,
            path: path.map(String::from),
        })
    }

    /// 识别 JSON 中的引用形式；不含引用的子树保持为 Literal
    pub fn from_value(value: Value) -> Self {
        if let Some(r) = Self::as_ref_object(&value) {
            return ArgValue::Reference(r);
        }
        match value {
            Value::String(s) => match legacy_ref_pattern().and_then(|re| re.captures(&s)) {
                Some(caps) => match caps[1].parse::<usize>() {
                    Ok(step) => ArgValue::Reference(StepRef {
                        step,
                        path: caps.get(2).map(|m| m.as_str().to_string()),
                    }),
                    Err(_) => ArgValue::Literal(Value::String(s)),
                },
                None => ArgValue::Literal(Value::String(s)),
            },
            Value::Array(items) => {
                let converted: Vec<ArgValue> = items.into_iter().map(ArgValue::from_value).collect();
                if converted.iter().all(|v| matches!(v, ArgValue::Literal(_))) {
                    ArgValue::Literal(Value::Array(
                        converted.into_iter().map(ArgValue::into_value).collect(),
                    ))
                } else {
                    ArgValue::List(converted)
                }
            }
            Value::Object(map) => {
                let converted: BTreeMap<String, ArgValue> = map
                    .into_iter()
                    .map(|(k, v)| (k, ArgValue::from_value(v)))
                    .collect();
                if converted.values().all(|v| matches!(v, ArgValue::Literal(_))) {
                    ArgValue::Literal(Value::Object(
                        converted.into_iter().map(|(k, v)| (k, v.into_value())).collect(),
                    ))
                } else {
                    ArgValue::Map(converted)
                }
            }
            other => ArgValue::Literal(other),
        }
    }

    fn as_ref_object(value: &Value) -> Option<StepRef> {
        let obj = value.as_object()?;
        let step = obj.get("$ref")?.as_u64()? as usize;
        let path = match obj.get("path") {
            None | Some(Value::Null) => None,
            Some(Value::String(p)) => Some(p.clone()),
            Some(_) => return None,
        };
        let extra = obj.keys().any(|k| k != "$ref" && k != "path");
        if extra {
            return None;
        }
        Some(StepRef { step, path })
    }

    /// 转回线上 JSON 形式
    pub fn into_value(self) -> Value {
        match self {
            ArgValue::Literal(v) => v,
            ArgValue::Reference(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            ArgValue::List(items) => Value::Array(items.into_iter().map(ArgValue::into_value).collect()),
            ArgValue::Map(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_value()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    pub fn to_value(&self) -> Value {
        self.clone().into_value()
    }

    pub fn collect_refs(&self, out: &mut Vec<usize>) {
        match self {
            ArgValue::Literal(_) => {}
            ArgValue::Reference(r) => out.push(r.step),
            ArgValue::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            ArgValue::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
        }
    }
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(ArgValue::from_value)
    }
}

impl JsonSchema for ArgValue {
    fn schema_name() -> String {
        "ArgValue".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        let reference = gen.subschema_for::<StepRef>();
        SchemaObject {
            metadata: Some(Box::new(Metadata {
                description: Some(
                    "Literal JSON value, or a reference to an earlier step's result: {\"$ref\": i, \"path\": \"field.sub\"}"
                        .to_string(),
                ),
                ..Default::default()
            })),
            subschemas: Some(Box::new(SubschemaValidation {
                any_of: Some(vec![reference, Schema::Bool(true)]),
                ..Default::default()
            })),
            ..Default::default()
        }
        .into()
    }
}
