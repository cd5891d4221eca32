//! 执行计划：数据模型、引用解析、依赖图、构建器

pub mod builder;
pub mod graph;
pub mod resolve;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::PlanGraph;
pub use resolve::{resolve_arguments, PriorResult, ResolveError};
pub use types::{ArgValue, Plan, Step, StepRef};

impl Plan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 提交时的结构检查：只报告问题（前向引用、空工具名），不拒绝计划；
    /// 执行期同样的问题会以 UnresolvedReference / UnknownTool 终止计划
    pub fn structural_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.tool_name.trim().is_empty() {
                issues.push(format!("step {} has no tool name", i));
            }
        }
        for (from, to) in PlanGraph::new(self).forward_references() {
            issues.push(format!("step {} references step {} which runs later", from, to));
        }
        issues
    }
}
