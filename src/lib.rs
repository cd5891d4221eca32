//! Hearth - 本地智能体运行时的任务编排与可回滚执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、执行会话、会话调度、优雅关闭、运行时上下文
//! - **engine**: 计划执行器、确认通道、事件总线、执行报告
//! - **plan**: 执行计划数据模型、步骤间引用、依赖图
//! - **policy**: 路径允许/拒绝、批量阈值、风险确认规则
//! - **snapshot**: 内容寻址快照、快照链与回滚
//! - **tools**: 工具清单、注册表、受监管的执行器与内置工具
//! - **observability**: tracing 初始化与事件日志

pub mod config;
pub mod core;
pub mod engine;
pub mod observability;
pub mod plan;
pub mod policy;
pub mod snapshot;
pub mod tools;

pub use crate::core::{EngineError, RuntimeBuilder, RuntimeContext};
pub use crate::engine::{ConfirmationChannel, Decision, PlanReport};
pub use crate::plan::{Plan, PlanBuilder, Step};
