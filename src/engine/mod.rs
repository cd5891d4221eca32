//! 执行引擎：计划执行器、确认通道、事件总线、执行报告

pub mod confirm;
pub mod events;
pub mod executor;
pub mod report;

pub use confirm::{
    AutoApprove, AutoDeny, ChannelConfirmation, ConfirmationChannel, ConfirmationRequest, Decision,
    PendingConfirmation,
};
pub use events::{EngineEvent, EventBus};
pub use executor::PlanExecutor;
pub use report::PlanReport;
