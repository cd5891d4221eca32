//! 计划构建器
//!
//! 提供流畅的 API 构建 Plan（测试与 CLI 使用；规划器通常直接给 JSON）

use serde_json::Value;

use crate::core::EngineError;
use crate::plan::{ArgValue, Plan, Step};
use crate::tools::RiskClass;

#[derive(Default)]
pub struct PlanBuilder {
    goal: Option<String>,
    steps: Vec<Step>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// 添加一步；args 为 JSON 对象，其中的 {"$ref": i} / "$result[i]" 被识别为引用
    pub fn step(mut self, tool_name: impl Into<String>, args: Value) -> Self {
        let mut step = Step::new(tool_name);
        if let Value::Object(map) = args {
            step.arguments = map
                .into_iter()
                .map(|(k, v)| (k, ArgValue::from_value(v)))
                .collect();
        }
        self.steps.push(step);
        self
    }

    /// 设置最后一步的风险等级
    pub fn with_risk(mut self, risk: RiskClass) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.risk_class = Some(risk);
        }
        self
    }

    /// 设置最后一步的快照目标
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.target_paths = Some(targets);
        }
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.description = Some(description.into());
        }
        self
    }

    /// 给最后一步加一个引用参数
    pub fn reference_arg(mut self, name: &str, step: usize, path: Option<&str>) -> Self {
        if let Some(last) = self.steps.last_mut() {
            last.arguments.insert(name.to_string(), ArgValue::reference(step, path));
        }
        self
    }

    pub fn build(self) -> Result<Plan, EngineError> {
        if let Some((i, _)) = self
            .steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.tool_name.trim().is_empty())
        {
            return Err(EngineError::InvalidArguments(format!("step {} has no tool name", i)));
        }
        Ok(Plan {
            goal: self.goal,
            steps: self.steps,
        })
    }
}
