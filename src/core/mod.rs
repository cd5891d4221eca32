//! 核心层：错误类型、执行会话、会话调度、优雅关闭、运行时上下文

pub mod context;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod shutdown;

pub use context::{RuntimeBuilder, RuntimeContext};
pub use error::{EngineError, ErrorKind, StepError};
pub use scheduler::SessionScheduler;
pub use session::{
    ExecutionSession, HaltCause, SessionRecord, SessionState, SessionStatus, StepRecord, StepState,
};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
