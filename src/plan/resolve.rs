//! 参数引用解析
//!
//! 引用只能指向已经 DONE 的更早步骤。指向运行期失败（超时、资源超限、工具报错）的步骤时
//! 返回 FailedDependency，执行器据此把当前步记为 SKIPPED；其余不可用情况为 Unresolved。

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::plan::{ArgValue, StepRef};

/// 之前某一步在解析时刻的可用状态
#[derive(Debug, Clone, Copy)]
pub enum PriorResult<'a> {
    Done(&'a Value),
    /// 运行期失败
    RuntimeFailed,
    /// 尚未执行、被跳过或以结构性错误失败
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    Unresolved(String),
    FailedDependency { step: usize, reason: String },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Unresolved(msg) => write!(f, "{}", msg),
            ResolveError::FailedDependency { reason, .. } => write!(f, "{}", reason),
        }
    }
}

/// 解析一步的全部参数，得到纯 JSON 对象
pub fn resolve_arguments<'a, F>(
    args: &BTreeMap<String, ArgValue>,
    current: usize,
    lookup: F,
) -> Result<Value, ResolveError>
where
    F: Fn(usize) -> PriorResult<'a>,
{
    let mut out = Map::new();
    for (name, value) in args {
        out.insert(name.clone(), resolve_value(value, current, &lookup)?);
    }
    Ok(Value::Object(out))
}

fn resolve_value<'a, F>(value: &ArgValue, current: usize, lookup: &F) -> Result<Value, ResolveError>
where
    F: Fn(usize) -> PriorResult<'a>,
{
    match value {
        ArgValue::Literal(v) => Ok(v.clone()),
        ArgValue::Reference(r) => resolve_ref(r, current, lookup),
        ArgValue::List(items) => items
            .iter()
            .map(|v| resolve_value(v, current, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ArgValue::Map(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, current, lookup)?);
            }
            Ok(Value::Object(out))
        }
    }
}

fn resolve_ref<'a, F>(r: &StepRef, current: usize, lookup: &F) -> Result<Value, ResolveError>
where
    F: Fn(usize) -> PriorResult<'a>,
{
    if r.step >= current {
        return Err(ResolveError::Unresolved(format!(
            "step {} references {} which has not run yet",
            current, r
        )));
    }
    match lookup(r.step) {
        PriorResult::Done(result) => match &r.path {
            None => Ok(result.clone()),
            Some(path) => select_path(result, path).cloned().ok_or_else(|| {
                ResolveError::Unresolved(format!("{} has no field '{}'", r, path))
            }),
        },
        PriorResult::RuntimeFailed => Err(ResolveError::FailedDependency {
            step: r.step,
            reason: format!("step {} depends on failed step {}", current, r.step),
        }),
        PriorResult::Unavailable => Err(ResolveError::Unresolved(format!(
            "step {} references {} which did not complete",
            current, r
        ))),
    }
}

/// 按点号路径取子值；数字段同时可作数组下标
pub fn select_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |cur, seg| match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
