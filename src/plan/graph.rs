//! 计划依赖图
//!
//! 由参数引用建立：邻接表（被引用步 → 引用它的步）与每步的依赖列表。
//! 执行仍是严格顺序的，图只用于提交时的结构检查和「失败后哪些步仍然独立」的判断。

use std::collections::{BTreeSet, HashMap};

use crate::plan::Plan;

pub struct PlanGraph {
    /// 步骤下标 -> 它引用的步骤
    pub dependencies: Vec<Vec<usize>>,
    /// 步骤下标 -> 引用它的步骤
    pub dependents: HashMap<usize, Vec<usize>>,
}

impl PlanGraph {
    pub fn new(plan: &Plan) -> Self {
        let mut dependencies = Vec::with_capacity(plan.steps.len());
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (index, step) in plan.steps.iter().enumerate() {
            let refs = step.references();
            for dep in &refs {
                dependents.entry(*dep).or_default().push(index);
            }
            dependencies.push(refs);
        }
        Self {
            dependencies,
            dependents,
        }
    }

    /// 引用了尚未执行（下标不小于自身）的步骤：(引用方, 被引用方)
    pub fn forward_references(&self) -> Vec<(usize, usize)> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(i, deps)| deps.iter().filter(move |d| **d >= i).map(move |d| (i, *d)))
            .collect()
    }

    /// 直接或间接依赖 step 的全部步骤
    pub fn transitive_dependents(&self, step: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![step];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.dependents.get(&current) {
                for child in children {
                    if seen.insert(*child) {
                        stack.push(*child);
                    }
                }
            }
        }
        seen
    }
}
