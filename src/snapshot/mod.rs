//! 快照：破坏性步骤执行前的文件系统前状态
//!
//! - **store**: 按 SHA-256 内容寻址的 blob 存储（每会话一个目录）
//! - **metadata**: 持久键值存储（快照记录、快照链、会话记录）
//! - **manager**: capture / restore / chain_rollback / expire
//!
//! 快照链按会话追加，只会被回滚消费或过期清理移除，正常结束的计划不会删除快照。

pub mod manager;
pub mod metadata;
pub mod store;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::{SnapshotChain, SnapshotLimits, SnapshotManager};
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use store::BlobStore;

/// 文件元数据（权限位与时间戳，时间以 Unix 秒 + 纳秒保存）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub mode: u32,
    pub mtime: (i64, u32),
    pub atime: (i64, u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    File { blob: String, size: u64 },
    Dir,
    Symlink { target: PathBuf },
}

/// 目标下的一个节点；relative 为空表示目标本身
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedNode {
    pub relative: PathBuf,
    #[serde(flatten)]
    pub kind: NodeKind,
    pub meta: FileMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TargetState {
    /// 捕获时不存在：还原时删除
    Absent,
    /// 父目录在前、子节点在后
    Present { nodes: Vec<CapturedNode> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedTarget {
    pub path: PathBuf,
    #[serde(flatten)]
    pub state: TargetState,
}

/// 一次捕获的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub step_index: usize,
    pub tool_name: String,
    pub created_at: DateTime<Utc>,
    pub target_paths: Vec<PathBuf>,
    pub backing_store_location: PathBuf,
    pub size_bytes: u64,
    pub targets: Vec<CapturedTarget>,
}

impl Snapshot {
    /// 引用的全部 blob 哈希
    pub fn blobs(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().flat_map(|t| match &t.state {
            TargetState::Absent => Vec::new(),
            TargetState::Present { nodes } => nodes
                .iter()
                .filter_map(|n| match &n.kind {
                    NodeKind::File { blob, .. } => Some(blob.as_str()),
                    _ => None,
                })
                .collect(),
        })
    }
}

/// 快照链条目：可还原的快照，或不可快照步骤的占位标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum ChainEntry {
    Snapshot(Snapshot),
    Irreversible {
        step_index: usize,
        tool_name: String,
        recorded_at: DateTime<Utc>,
    },
}

impl ChainEntry {
    pub fn step_index(&self) -> usize {
        match self {
            ChainEntry::Snapshot(s) => s.step_index,
            ChainEntry::Irreversible { step_index, .. } => *step_index,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            ChainEntry::Snapshot(s) => s.created_at,
            ChainEntry::Irreversible { recorded_at, .. } => *recorded_at,
        }
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            ChainEntry::Snapshot(s) => Some(s),
            ChainEntry::Irreversible { .. } => None,
        }
    }
}

/// 单个快照的还原结果
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub snapshot_id: String,
    pub step_index: usize,
    pub restored_paths: Vec<PathBuf>,
    /// 捕获时不存在、被还原删除的路径
    pub removed_paths: Vec<PathBuf>,
    pub files_written: usize,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackItem {
    Restored(RestoreResult),
    /// 不可快照的步骤：跳过并报告
    Irreversible { step_index: usize, tool_name: String },
}

/// 一次 chain_rollback 的结果，items 按还原顺序（新到旧）
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub session_id: String,
    pub items: Vec<RollbackItem>,
    pub remaining: usize,
}

impl RollbackReport {
    pub fn restored_snapshot_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|i| match i {
                RollbackItem::Restored(r) => Some(r.snapshot_id.as_str()),
                RollbackItem::Irreversible { .. } => None,
            })
            .collect()
    }

    pub fn irreversible_steps(&self) -> Vec<usize> {
        self.items
            .iter()
            .filter_map(|i| match i {
                RollbackItem::Irreversible { step_index, .. } => Some(*step_index),
                RollbackItem::Restored(_) => None,
            })
            .collect()
    }
}

/// expire 的统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpireReport {
    pub sessions_scanned: usize,
    pub entries_removed: usize,
    pub blobs_removed: usize,
}
