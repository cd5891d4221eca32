//! 工具清单：参数 schema、默认风险等级、幂等性、网络能力、是否可快照
//!
//! 注册是纯数据表插入；清单只做结构校验（schema 形状），不校验行为。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 风险等级：决定确认与快照要求
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskClass {
    #[default]
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
}

/// 参数类型（接受常见别名）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "list")]
    Array,
    #[serde(alias = "dict")]
    Object,
    Any,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }

    fn json_type(self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Integer => Some("integer"),
            ParamType::Number => Some("number"),
            ParamType::Boolean => Some("boolean"),
            ParamType::Array => Some("array"),
            ParamType::Object => Some("object"),
            ParamType::Any => None,
        }
    }
}

/// 参数在权限评估中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    #[default]
    Plain,
    /// 单个文件系统路径
    Path,
    /// 路径列表（计入批量阈值）
    PathList,
    /// Shell 命令行，其中形似路径的词会被检查
    Command,
    Url,
}

impl ParamRole {
    pub fn is_path(self) -> bool {
        matches!(self, ParamRole::Path | ParamRole::PathList)
    }
}

/// 单个参数定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub choices: Option<Vec<Value>>,
    #[serde(default)]
    pub role: ParamRole,
    /// 规划器常用的别名（如 ext -> extensions）
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl ToolParameter {
    pub fn required(name: &str, kind: ParamType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: String::new(),
            required: true,
            default: None,
            choices: None,
            role: ParamRole::Plain,
            aliases: Vec::new(),
        }
    }

    pub fn optional(name: &str, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_role(mut self, role: ParamRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    /// 名称或别名是否匹配
    pub fn answers_to(&self, key: &str) -> bool {
        self.name == key || self.aliases.iter().any(|a| a == key)
    }
}

/// 工具能力描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub risk_class: RiskClass,
    /// 重复调用是否无副作用；非幂等工具执行前必须快照
    #[serde(default)]
    pub idempotent: bool,
    /// 是否访问网络（受全局网络开关约束）
    #[serde(default)]
    pub network: bool,
    /// 效果是否可用文件字节/元数据快照表示
    #[serde(default = "default_reversible")]
    pub reversible: bool,
    /// 清单要求确认（仅在策略 confirm_writes 打开时生效）
    #[serde(default)]
    pub requires_confirmation: bool,
    /// 确认提示模板，{param} 替换为参数值
    #[serde(default)]
    pub confirmation_message: Option<String>,
    /// 覆盖全局工具超时（秒）
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_reversible() -> bool {
    true
}

impl ToolManifest {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
            risk_class: RiskClass::Low,
            idempotent: false,
            network: false,
            reversible: true,
            requires_confirmation: false,
            confirmation_message: None,
            timeout_secs: None,
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn risk(mut self, risk: RiskClass) -> Self {
        self.risk_class = risk;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn reversible(mut self, reversible: bool) -> Self {
        self.reversible = reversible;
        self
    }

    pub fn confirm(mut self, message: &str) -> Self {
        self.requires_confirmation = true;
        self.confirmation_message = Some(message.to_string());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.answers_to(key))
    }

    pub fn path_parameters(&self) -> impl Iterator<Item = &ToolParameter> {
        self.parameters.iter().filter(|p| p.role.is_path())
    }

    /// 结构校验：名称、参数唯一性、默认值与可选值的类型
    pub fn validate_structure(&self) -> Result<(), String> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .split('.')
                .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        if !valid_name {
            return Err(format!("invalid tool name '{}'", self.name));
        }

        let mut seen = std::collections::HashSet::new();
        for p in &self.parameters {
            if p.name.is_empty() {
                return Err(format!("tool '{}' has a parameter without a name", self.name));
            }
            for key in std::iter::once(&p.name).chain(p.aliases.iter()) {
                if !seen.insert(key.clone()) {
                    return Err(format!("tool '{}' declares parameter '{}' twice", self.name, key));
                }
            }
            if let Some(default) = &p.default {
                if !p.kind.accepts(default) {
                    return Err(format!(
                        "tool '{}': default of '{}' does not match type {:?}",
                        self.name, p.name, p.kind
                    ));
                }
            }
            if let Some(choices) = &p.choices {
                if choices.is_empty() {
                    return Err(format!("tool '{}': '{}' has empty choices", self.name, p.name));
                }
                if let Some(bad) = choices.iter().find(|c| !p.kind.accepts(c)) {
                    return Err(format!(
                        "tool '{}': choice {} of '{}' does not match type {:?}",
                        self.name, bad, p.name, p.kind
                    ));
                }
            }
            let role_fits = match p.role {
                ParamRole::Path | ParamRole::Command | ParamRole::Url => {
                    matches!(p.kind, ParamType::String | ParamType::Any)
                }
                ParamRole::PathList => matches!(p.kind, ParamType::Array | ParamType::Any),
                ParamRole::Plain => true,
            };
            if !role_fits {
                return Err(format!(
                    "tool '{}': role {:?} of '{}' does not fit type {:?}",
                    self.name, p.role, p.name, p.kind
                ));
            }
        }
        Ok(())
    }

    /// 按参数值渲染确认提示
    pub fn confirmation_text(&self, args: &serde_json::Map<String, Value>) -> String {
        match &self.confirmation_message {
            Some(template) => {
                let mut text = template.clone();
                for (k, v) in args {
                    let val = match v {
                        Value::String(s) => s.clone(),
                        _ => v.to_string(),
                    };
                    text = text.replace(&format!("{{{}}}", k), &val);
                }
                text
            }
            None => format!("Execute {}?", self.name),
        }
    }

    /// 供规划器 prompt 使用的 JSON Schema
    pub fn to_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = serde_json::Map::new();
            if let Some(t) = p.kind.json_type() {
                prop.insert("type".into(), Value::String(t.into()));
            }
            prop.insert("description".into(), Value::String(p.description.clone()));
            if let Some(choices) = &p.choices {
                prop.insert("enum".into(), Value::Array(choices.clone()));
            }
            if let Some(default) = &p.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(p.name.clone(), Value::Object(prop));
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "risk_class": self.risk_class,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ToolManifest {
        ToolManifest::new("filesystem.move", "Move files")
            .param(ToolParameter::required("source", ParamType::String).with_role(ParamRole::Path))
            .param(ToolParameter::required("destination", ParamType::String).with_role(ParamRole::Path))
            .risk(RiskClass::Medium)
            .confirm("Move {source} to {destination}?")
    }

    #[test]
    fn test_valid_manifest_passes() {
        assert!(sample().validate_structure().is_ok());
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let m = sample().param(ToolParameter::optional("dst", ParamType::String).with_alias("source"));
        assert!(m.validate_structure().unwrap_err().contains("twice"));
    }

    #[test]
    fn test_bad_name_and_default_rejected() {
        assert!(ToolManifest::new("bad name", "").validate_structure().is_err());
        let m = ToolManifest::new("x.y", "")
            .param(ToolParameter::optional("n", ParamType::Integer).with_default(json!("ten")));
        assert!(m.validate_structure().is_err());
    }

    #[test]
    fn test_path_list_role_requires_array() {
        let m = ToolManifest::new("x.y", "")
            .param(ToolParameter::required("paths", ParamType::String).with_role(ParamRole::PathList));
        assert!(m.validate_structure().is_err());
    }

    #[test]
    fn test_confirmation_text_substitutes_params() {
        let mut args = serde_json::Map::new();
        args.insert("source".into(), json!("/tmp/a"));
        args.insert("destination".into(), json!("/tmp/b"));
        assert_eq!(sample().confirmation_text(&args), "Move /tmp/a to /tmp/b?");
    }

    #[test]
    fn test_risk_class_parses_both_cases() {
        let hi: RiskClass = serde_json::from_value(json!("HIGH")).unwrap();
        let lo: RiskClass = serde_json::from_value(json!("low")).unwrap();
        assert_eq!(hi, RiskClass::High);
        assert_eq!(lo, RiskClass::Low);
        assert!(RiskClass::High > RiskClass::Medium);
    }
}
