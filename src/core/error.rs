//! 引擎错误类型
//!
//! 结构性错误（未知工具、参数不符、引用无法解析、权限拒绝、用户拒绝、快照失败）会中止整个计划；
//! 运行期错误（超时、资源超限、工具自身失败）只记录在该步上。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排与回滚过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("User denied: {0}")]
    UserDenied(String),

    #[error("Snapshot capture failed: {0}")]
    SnapshotCaptureFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Resource exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Tool execution failed: {0}")]
    ToolFailed(String),

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("Nothing to rollback for session {0}")]
    NothingToRollback(String),

    /// 仅作提示：不可快照的步骤在回滚中被跳过
    #[error("Irreversible step: {0}")]
    Irreversible(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Tool registration failed: {0}")]
    Registration(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime is shutting down")]
    Shutdown,
}

/// 错误种类（可序列化，写入步骤记录与审计事件）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownTool,
    InvalidArguments,
    UnresolvedReference,
    PermissionDenied,
    UserDenied,
    SnapshotCaptureFailed,
    ToolTimeout,
    ResourceExceeded,
    ToolFailed,
    RestoreFailed,
    NothingToRollback,
    Irreversible,
    SessionNotFound,
    InvalidState,
    Registration,
    Config,
    Persistence,
    Io,
    Shutdown,
}

impl ErrorKind {
    /// 是否为中止整个计划的结构性错误
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            ErrorKind::UnknownTool
                | ErrorKind::InvalidArguments
                | ErrorKind::UnresolvedReference
                | ErrorKind::PermissionDenied
                | ErrorKind::UserDenied
                | ErrorKind::SnapshotCaptureFailed
        )
    }

    /// 是否为只影响当前步骤的运行期错误
    pub fn is_runtime(self) -> bool {
        matches!(
            self,
            ErrorKind::ToolTimeout | ErrorKind::ResourceExceeded | ErrorKind::ToolFailed
        )
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnknownTool(_) => ErrorKind::UnknownTool,
            EngineError::InvalidArguments(_) => ErrorKind::InvalidArguments,
            EngineError::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::UserDenied(_) => ErrorKind::UserDenied,
            EngineError::SnapshotCaptureFailed(_) => ErrorKind::SnapshotCaptureFailed,
            EngineError::ToolTimeout(_) => ErrorKind::ToolTimeout,
            EngineError::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            EngineError::ToolFailed(_) => ErrorKind::ToolFailed,
            EngineError::RestoreFailed(_) => ErrorKind::RestoreFailed,
            EngineError::NothingToRollback(_) => ErrorKind::NothingToRollback,
            EngineError::Irreversible(_) => ErrorKind::Irreversible,
            EngineError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::Registration(_) => ErrorKind::Registration,
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub fn is_structural(&self) -> bool {
        self.kind().is_structural()
    }
}

/// 步骤记录里保存的错误（种类 + 文本）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for StepError {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        StepError::from(&err)
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
