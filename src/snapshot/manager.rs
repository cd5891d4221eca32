//! 快照管理器
//!
//! 每个会话一条快照链（SnapshotChain），链的互斥锁同时是该会话的回滚锁：
//! 捕获、执行、还原与过期清理都在持锁期间进行，不同会话之间互不阻塞。
//! 回滚严格从新到旧，全部还原成功后才提交链的截断；任一还原失败时链保持不变。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::config::SnapshotSection;
use crate::core::EngineError;
use crate::snapshot::{
    BlobStore, CapturedNode, CapturedTarget, ChainEntry, ExpireReport, FileMeta, MetadataStore,
    NodeKind, RestoreResult, RollbackItem, RollbackReport, Snapshot, TargetState,
};

/// 捕获大小上限与保留期
#[derive(Debug, Clone, Copy)]
pub struct SnapshotLimits {
    pub max_file_bytes: u64,
    pub max_snapshot_bytes: u64,
    pub ttl: chrono::Duration,
}

impl SnapshotLimits {
    pub fn from_section(section: &SnapshotSection) -> Self {
        Self {
            max_file_bytes: section.max_file_mb.saturating_mul(1024 * 1024),
            max_snapshot_bytes: section.max_snapshot_mb.saturating_mul(1024 * 1024),
            ttl: chrono::Duration::days(section.ttl_days as i64),
        }
    }
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self::from_section(&SnapshotSection::default())
    }
}

/// 单个会话的快照链（最旧在前）
#[derive(Debug)]
pub struct SnapshotChain {
    session_id: String,
    entries: Mutex<Vec<ChainEntry>>,
}

impl SnapshotChain {
    pub fn new(session_id: &str, entries: Vec<ChainEntry>) -> Self {
        Self {
            session_id: session_id.to_string(),
            entries: Mutex::new(entries),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 获取会话锁
    pub async fn lock(&self) -> MutexGuard<'_, Vec<ChainEntry>> {
        self.entries.lock().await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn entries(&self) -> Vec<ChainEntry> {
        self.entries.lock().await.clone()
    }
}

pub struct SnapshotManager {
    store: BlobStore,
    metadata: Arc<dyn MetadataStore>,
    limits: SnapshotLimits,
    chains: RwLock<HashMap<String, Arc<SnapshotChain>>>,
}

fn chain_key(session_id: &str) -> String {
    format!("chain/{}", session_id)
}

fn snapshot_key(session_id: &str, snapshot_id: &str) -> String {
    format!("snapshot/{}/{}", session_id, snapshot_id)
}

fn capture_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::SnapshotCaptureFailed(e.to_string())
}

fn restore_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::RestoreFailed(e.to_string())
}

impl SnapshotManager {
    pub fn new(store: BlobStore, metadata: Arc<dyn MetadataStore>, limits: SnapshotLimits) -> Self {
        Self {
            store,
            metadata,
            limits,
            chains: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn limits(&self) -> SnapshotLimits {
        self.limits
    }

    /// 取得（必要时创建）会话的快照链
    pub async fn open_chain(&self, session_id: &str) -> Arc<SnapshotChain> {
        if let Some(chain) = self.chains.read().await.get(session_id) {
            return chain.clone();
        }
        self.chains
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SnapshotChain::new(session_id, Vec::new())))
            .clone()
    }

    pub async fn chain(&self, session_id: &str) -> Option<Arc<SnapshotChain>> {
        self.chains.read().await.get(session_id).cloned()
    }

    /// 从元数据存储重新加载会话的快照链（崩溃恢复或跨进程回滚）
    pub async fn recover(&self, session_id: &str) -> Result<Arc<SnapshotChain>, EngineError> {
        let entries = self.load_persisted(session_id).await?;
        let chain = self.open_chain(session_id).await;
        {
            let mut guard = chain.lock().await;
            if guard.is_empty() {
                *guard = entries;
            }
        }
        let entries = chain.len().await;
        tracing::info!(session = %session_id, entries = entries, "snapshot chain recovered");
        Ok(chain)
    }

    async fn load_persisted(&self, session_id: &str) -> Result<Vec<ChainEntry>, EngineError> {
        match self.metadata.get(&chain_key(session_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| EngineError::Persistence(format!("chain of {}: {}", session_id, e))),
            None => Ok(Vec::new()),
        }
    }

    async fn persist_chain(&self, session_id: &str, entries: &[ChainEntry]) -> Result<(), EngineError> {
        let value = serde_json::to_value(entries)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.metadata.put(&chain_key(session_id), &value).await
    }

    /// 捕获目标路径的当前状态；返回前快照记录已写入元数据存储
    pub async fn capture(
        &self,
        session_id: &str,
        step_index: usize,
        tool_name: &str,
        target_paths: &[PathBuf],
    ) -> Result<Snapshot, EngineError> {
        let store = self.store.clone();
        let limits = self.limits;
        let sid = session_id.to_string();
        let targets = target_paths.to_vec();

        let (captured, size_bytes, created) =
            tokio::task::spawn_blocking(move || capture_blocking(&store, &sid, &targets, limits))
                .await
                .map_err(capture_err)??;

        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            step_index,
            tool_name: tool_name.to_string(),
            created_at: Utc::now(),
            target_paths: target_paths.to_vec(),
            backing_store_location: self.store.session_dir(session_id),
            size_bytes,
            targets: captured,
        };

        let record = serde_json::to_value(&snapshot).map_err(capture_err)?;
        if let Err(e) = self
            .metadata
            .put(&snapshot_key(session_id, &snapshot.id), &record)
            .await
        {
            tracing::error!(session = %session_id, step = step_index, error = %e, "snapshot metadata write failed");
            self.remove_blobs(session_id, created).await;
            return Err(capture_err(e));
        }

        tracing::info!(
            session = %session_id,
            step = step_index,
            tool = %tool_name,
            snapshot = %snapshot.id,
            targets = snapshot.target_paths.len(),
            size_bytes,
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// 追加链条目：先持久化新链，再修改内存中的链
    pub async fn record(
        &self,
        session_id: &str,
        chain: &mut Vec<ChainEntry>,
        entry: ChainEntry,
    ) -> Result<(), EngineError> {
        let mut next = chain.clone();
        next.push(entry);
        self.persist_chain(session_id, &next).await?;
        *chain = next;
        Ok(())
    }

    /// 丢弃未进入链的快照（记录失败时调用）
    pub async fn discard_snapshot(&self, snapshot: &Snapshot, chain: &[ChainEntry]) {
        let keep = referenced_blobs(chain);
        let _ = self
            .metadata
            .delete(&snapshot_key(&snapshot.session_id, &snapshot.id))
            .await;
        let orphans: Vec<String> = snapshot
            .blobs()
            .filter(|b| !keep.contains(*b))
            .map(String::from)
            .collect();
        self.remove_blobs(&snapshot.session_id, orphans).await;
    }

    /// 还原单个快照：先校验全部 blob，再逆序处理目标
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<RestoreResult, EngineError> {
        let store = self.store.clone();
        let snap = snapshot.clone();
        let result = tokio::task::spawn_blocking(move || restore_blocking(&store, &snap))
            .await
            .map_err(restore_err)?;
        match &result {
            Ok(r) => tracing::info!(
                session = %snapshot.session_id,
                step = snapshot.step_index,
                snapshot = %snapshot.id,
                files = r.files_written,
                "snapshot restored"
            ),
            Err(e) => tracing::error!(
                session = %snapshot.session_id,
                snapshot = %snapshot.id,
                error = %e,
                "snapshot restore failed"
            ),
        }
        result
    }

    /// 从新到旧回滚 steps_back 个链条目
    pub async fn chain_rollback(&self, session_id: &str, steps_back: usize) -> Result<RollbackReport, EngineError> {
        let chain = self
            .chain(session_id)
            .await
            .ok_or_else(|| EngineError::NothingToRollback(session_id.to_string()))?;
        let mut guard = chain.lock().await;
        self.rollback_locked(session_id, &mut guard, steps_back).await
    }

    /// 已持有会话锁时的回滚
    pub async fn rollback_locked(
        &self,
        session_id: &str,
        chain: &mut Vec<ChainEntry>,
        steps_back: usize,
    ) -> Result<RollbackReport, EngineError> {
        if chain.is_empty() {
            return Err(EngineError::NothingToRollback(session_id.to_string()));
        }
        if steps_back == 0 {
            return Err(EngineError::InvalidArguments(
                "steps_back must be at least 1".to_string(),
            ));
        }

        let count = steps_back.min(chain.len());
        let keep_len = chain.len() - count;

        // 任何一个快照损坏都在写盘之前失败，避免只回滚了较新的几步
        let to_restore: Vec<Snapshot> = chain[keep_len..].iter().filter_map(|e| e.snapshot()).cloned().collect();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || to_restore.iter().try_for_each(|s| verify_blobs(&store, s)))
            .await
            .map_err(restore_err)??;

        let mut items = Vec::with_capacity(count);
        for entry in chain[keep_len..].iter().rev() {
            match entry {
                ChainEntry::Snapshot(snapshot) => {
                    items.push(RollbackItem::Restored(self.restore(snapshot).await?));
                }
                ChainEntry::Irreversible { step_index, tool_name, .. } => {
                    tracing::warn!(
                        session = %session_id,
                        step = step_index,
                        tool = %tool_name,
                        "irreversible step skipped during rollback"
                    );
                    items.push(RollbackItem::Irreversible {
                        step_index: *step_index,
                        tool_name: tool_name.clone(),
                    });
                }
            }
        }

        let remaining: Vec<ChainEntry> = chain[..keep_len].to_vec();
        self.persist_chain(session_id, &remaining).await?;
        let consumed: Vec<ChainEntry> = chain.split_off(keep_len);
        self.release_entries(session_id, &consumed, &remaining).await;

        tracing::info!(session = %session_id, consumed = count, remaining = chain.len(), "rollback committed");
        Ok(RollbackReport {
            session_id: session_id.to_string(),
            items,
            remaining: chain.len(),
        })
    }

    /// 删除被移除条目的快照记录与不再被引用的 blob
    async fn release_entries(&self, session_id: &str, removed: &[ChainEntry], remaining: &[ChainEntry]) -> usize {
        let keep = referenced_blobs(remaining);
        let mut orphans = HashSet::new();
        for snapshot in removed.iter().filter_map(|e| e.snapshot()) {
            if let Err(e) = self.metadata.delete(&snapshot_key(session_id, &snapshot.id)).await {
                tracing::warn!(session = %session_id, snapshot = %snapshot.id, error = %e, "snapshot record not deleted");
            }
            orphans.extend(snapshot.blobs().filter(|b| !keep.contains(*b)).map(String::from));
        }
        self.remove_blobs(session_id, orphans.into_iter().collect()).await
    }

    async fn remove_blobs(&self, session_id: &str, hashes: Vec<String>) -> usize {
        if hashes.is_empty() {
            return 0;
        }
        let store = self.store.clone();
        let sid = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            hashes
                .iter()
                .filter(|h| matches!(store.remove(&sid, h), Ok(true)))
                .count()
        })
        .await
        .unwrap_or(0)
    }

    /// 清理早于 TTL 的条目；包括只存在于元数据存储中的会话
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<ExpireReport, EngineError> {
        let cutoff = now - self.limits.ttl;
        let mut report = ExpireReport::default();

        let mut session_ids: HashSet<String> = self.chains.read().await.keys().cloned().collect();
        for key in self.metadata.keys("chain/").await? {
            if let Some(id) = key.strip_prefix("chain/") {
                session_ids.insert(id.to_string());
            }
        }

        for session_id in session_ids {
            let chain = match self.chain(&session_id).await {
                Some(chain) => chain,
                None => self.recover(&session_id).await?,
            };
            let mut guard = chain.lock().await;
            report.sessions_scanned += 1;

            let (expired, kept): (Vec<ChainEntry>, Vec<ChainEntry>) =
                guard.iter().cloned().partition(|e| e.recorded_at() < cutoff);
            if expired.is_empty() {
                continue;
            }
            self.persist_chain(&session_id, &kept).await?;
            *guard = kept;
            report.entries_removed += expired.len();
            report.blobs_removed += self.release_entries(&session_id, &expired, &guard).await;
            tracing::info!(session = %session_id, removed = expired.len(), "expired snapshots purged");
        }
        Ok(report)
    }

    /// 会话结束：删除会话目录与全部元数据
    pub async fn discard_session(&self, session_id: &str) -> Result<(), EngineError> {
        let chain = self.chains.write().await.remove(session_id);
        let _guard = match &chain {
            Some(chain) => Some(chain.lock().await),
            None => None,
        };
        for key in self.metadata.keys(&format!("snapshot/{}/", session_id)).await? {
            self.metadata.delete(&key).await?;
        }
        self.metadata.delete(&chain_key(session_id)).await?;
        let store = self.store.clone();
        let sid = session_id.to_string();
        tokio::task::spawn_blocking(move || store.remove_session(&sid))
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))??;
        tracing::info!(session = %session_id, "session snapshots discarded");
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), EngineError> {
        self.metadata.flush().await
    }
}

fn referenced_blobs(entries: &[ChainEntry]) -> HashSet<String> {
    entries
        .iter()
        .filter_map(|e| e.snapshot())
        .flat_map(|s| s.blobs().map(String::from).collect::<Vec<_>>())
        .collect()
}

fn read_meta(meta: &fs::Metadata) -> FileMeta {
    let mtime = filetime::FileTime::from_last_modification_time(meta);
    let atime = filetime::FileTime::from_last_access_time(meta);
    FileMeta {
        mode: file_mode(meta),
        mtime: (mtime.unix_seconds(), mtime.nanoseconds()),
        atime: (atime.unix_seconds(), atime.nanoseconds()),
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// 一个待存入的文件
struct PendingFile {
    source: PathBuf,
    size: u64,
}

fn scan_target(path: &Path) -> io::Result<Option<Vec<(CapturedNode, Option<PendingFile>)>>> {
    let root_meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut nodes = Vec::new();
    if !root_meta.is_dir() {
        nodes.push(scan_node(path, PathBuf::new(), &root_meta)?);
        return Ok(Some(nodes));
    }
    for entry in walkdir::WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(path)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let meta = fs::symlink_metadata(entry.path())?;
        nodes.push(scan_node(entry.path(), relative, &meta)?);
    }
    Ok(Some(nodes))
}

fn scan_node(path: &Path, relative: PathBuf, meta: &fs::Metadata) -> io::Result<(CapturedNode, Option<PendingFile>)> {
    let file_meta = read_meta(meta);
    let ft = meta.file_type();
    if ft.is_symlink() {
        let target = fs::read_link(path)?;
        return Ok((
            CapturedNode { relative, kind: NodeKind::Symlink { target }, meta: file_meta },
            None,
        ));
    }
    if ft.is_dir() {
        return Ok((CapturedNode { relative, kind: NodeKind::Dir, meta: file_meta }, None));
    }
    let pending = PendingFile { source: path.to_path_buf(), size: meta.len() };
    Ok((
        CapturedNode {
            relative,
            kind: NodeKind::File { blob: String::new(), size: meta.len() },
            meta: file_meta,
        },
        Some(pending),
    ))
}

fn capture_blocking(
    store: &BlobStore,
    session_id: &str,
    targets: &[PathBuf],
    limits: SnapshotLimits,
) -> Result<(Vec<CapturedTarget>, u64, Vec<String>), EngineError> {
    // 先扫描并检查大小上限，任何字节复制之前
    let mut scanned = Vec::with_capacity(targets.len());
    let mut total = 0u64;
    for path in targets {
        let nodes = scan_target(path).map_err(|e| capture_err(format!("{}: {}", path.display(), e)))?;
        if let Some(nodes) = &nodes {
            for pending in nodes.iter().filter_map(|(_, p)| p.as_ref()) {
                if pending.size > limits.max_file_bytes {
                    return Err(capture_err(format!(
                        "{} is {} bytes, over the per-file limit of {}",
                        pending.source.display(),
                        pending.size,
                        limits.max_file_bytes
                    )));
                }
                total += pending.size;
            }
        }
        scanned.push((path.clone(), nodes));
    }
    if total > limits.max_snapshot_bytes {
        return Err(capture_err(format!(
            "snapshot would hold {} bytes, over the limit of {}",
            total, limits.max_snapshot_bytes
        )));
    }

    let mut created: Vec<String> = Vec::new();
    let result = (|| {
        let mut captured = Vec::with_capacity(scanned.len());
        let mut size_bytes = 0u64;
        for (path, nodes) in scanned {
            let state = match nodes {
                None => TargetState::Absent,
                Some(nodes) => {
                    let mut out = Vec::with_capacity(nodes.len());
                    for (mut node, pending) in nodes {
                        if let Some(pending) = pending {
                            let (hash, size, is_new) = store
                                .put_file(session_id, &pending.source)
                                .map_err(|e| capture_err(format!("{}: {}", pending.source.display(), e)))?;
                            if is_new {
                                created.push(hash.clone());
                            }
                            size_bytes += size;
                            node.kind = NodeKind::File { blob: hash, size };
                        }
                        out.push(node);
                    }
                    TargetState::Present { nodes: out }
                }
            };
            captured.push(CapturedTarget { path, state });
        }
        Ok::<_, EngineError>((captured, size_bytes))
    })();

    match result {
        Ok((captured, size_bytes)) => Ok((captured, size_bytes, created)),
        Err(e) => {
            for hash in &created {
                let _ = store.remove(session_id, hash);
            }
            Err(e)
        }
    }
}

fn remove_existing(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|_| true),
        Ok(_) => fs::remove_file(path).map(|_| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn apply_meta(path: &Path, meta: &FileMeta) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(meta.mode))?;
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(meta.mode & 0o200 == 0);
        fs::set_permissions(path, perms)?;
    }
    let atime = filetime::FileTime::from_unix_time(meta.atime.0, meta.atime.1);
    let mtime = filetime::FileTime::from_unix_time(meta.mtime.0, meta.mtime.1);
    filetime::set_file_times(path, atime, mtime)
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::other(format!("cannot recreate symlink {}", link.display())))
}

fn node_path(root: &Path, node: &CapturedNode) -> PathBuf {
    if node.relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(&node.relative)
    }
}

/// 校验快照引用的所有 blob 存在且哈希匹配
fn verify_blobs(store: &BlobStore, snapshot: &Snapshot) -> Result<(), EngineError> {
    let sid = &snapshot.session_id;
    for hash in snapshot.blobs() {
        match store.verify(sid, hash) {
            Ok(true) => {}
            Ok(false) => {
                return Err(restore_err(format!(
                    "blob {} of snapshot {} is missing or corrupt",
                    hash, snapshot.id
                )))
            }
            Err(e) => return Err(restore_err(format!("blob {}: {}", hash, e))),
        }
    }
    Ok(())
}

fn restore_blocking(store: &BlobStore, snapshot: &Snapshot) -> Result<RestoreResult, EngineError> {
    verify_blobs(store, snapshot)?;

    let mut result = RestoreResult {
        snapshot_id: snapshot.id.clone(),
        step_index: snapshot.step_index,
        restored_paths: Vec::new(),
        removed_paths: Vec::new(),
        files_written: 0,
        bytes_written: 0,
    };

    for target in snapshot.targets.iter().rev() {
        let at = |e: io::Error| restore_err(format!("{}: {}", target.path.display(), e));
        let existed = remove_existing(&target.path).map_err(at)?;
        let nodes = match &target.state {
            TargetState::Absent => {
                if existed {
                    result.removed_paths.push(target.path.clone());
                }
                continue;
            }
            TargetState::Present { nodes } => nodes,
        };
        if let Some(parent) = target.path.parent() {
            fs::create_dir_all(parent).map_err(at)?;
        }
        for node in nodes {
            let dest = node_path(&target.path, node);
            match &node.kind {
                NodeKind::Dir => fs::create_dir_all(&dest).map_err(at)?,
                NodeKind::File { blob, .. } => {
                    result.bytes_written += store.write_to(&snapshot.session_id, blob, &dest).map_err(at)?;
                    result.files_written += 1;
                }
                NodeKind::Symlink { target: link } => make_symlink(link, &dest).map_err(at)?,
            }
        }
        // 文件先于目录、深层目录先于浅层，避免写子节点时改掉父目录的 mtime
        for node in nodes.iter().filter(|n| matches!(n.kind, NodeKind::File { .. })) {
            apply_meta(&node_path(&target.path, node), &node.meta).map_err(at)?;
        }
        for node in nodes.iter().rev().filter(|n| matches!(n.kind, NodeKind::Dir)) {
            apply_meta(&node_path(&target.path, node), &node.meta).map_err(at)?;
        }
        result.restored_paths.push(target.path.clone());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemoryMetadataStore;

    fn manager(root: &Path) -> SnapshotManager {
        SnapshotManager::new(
            BlobStore::new(root.join("snapshots")),
            Arc::new(MemoryMetadataStore::new()),
            SnapshotLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_capture_and_restore_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let f = dir.path().join("doc.txt");
        fs::write(&f, b"original").unwrap();

        let snap = mgr.capture("s1", 0, "filesystem.write", &[f.clone()]).await.unwrap();
        assert_eq!(snap.size_bytes, 8);
        fs::write(&f, b"changed").unwrap();

        let result = mgr.restore(&snap).await.unwrap();
        assert_eq!(result.files_written, 1);
        assert_eq!(fs::read(&f).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_absent_target_is_removed_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let created = dir.path().join("new_dir");
        let snap = mgr.capture("s1", 0, "filesystem.create_directory", &[created.clone()]).await.unwrap();
        fs::create_dir_all(created.join("inner")).unwrap();
        let result = mgr.restore(&snap).await.unwrap();
        assert!(!created.exists());
        assert_eq!(result.removed_paths, vec![created]);
    }

    #[tokio::test]
    async fn test_directory_is_captured_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("a/b")).unwrap();
        fs::write(tree.join("a/b/c.txt"), b"deep").unwrap();
        fs::write(tree.join("top.txt"), b"top").unwrap();

        let snap = mgr.capture("s1", 0, "filesystem.delete", &[tree.clone()]).await.unwrap();
        fs::remove_dir_all(&tree).unwrap();
        mgr.restore(&snap).await.unwrap();
        assert_eq!(fs::read(tree.join("a/b/c.txt")).unwrap(), b"deep");
        assert_eq!(fs::read(tree.join("top.txt")).unwrap(), b"top");
    }

    #[tokio::test]
    async fn test_move_is_reversed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"moving").unwrap();
        let snap = mgr.capture("s1", 0, "filesystem.move", &[src.clone(), dst.clone()]).await.unwrap();
        fs::rename(&src, &dst).unwrap();
        mgr.restore(&snap).await.unwrap();
        assert_eq!(fs::read(&src).unwrap(), b"moving");
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn test_size_ceiling_fails_before_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SnapshotManager::new(
            BlobStore::new(dir.path().join("snapshots")),
            Arc::new(MemoryMetadataStore::new()),
            SnapshotLimits { max_file_bytes: 4, max_snapshot_bytes: 100, ttl: chrono::Duration::days(7) },
        );
        let f = dir.path().join("big.bin");
        fs::write(&f, b"more than four").unwrap();
        let err = mgr.capture("s1", 0, "filesystem.delete", &[f]).await.unwrap_err();
        assert!(matches!(err, EngineError::SnapshotCaptureFailed(_)));
        assert!(mgr.store().list("s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cumulative_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SnapshotManager::new(
            BlobStore::new(dir.path().join("snapshots")),
            Arc::new(MemoryMetadataStore::new()),
            SnapshotLimits { max_file_bytes: 10, max_snapshot_bytes: 12, ttl: chrono::Duration::days(7) },
        );
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"12345678").unwrap();
        fs::write(&b, b"12345678").unwrap();
        assert!(mgr.capture("s1", 0, "x.y", &[a, b]).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_restore_without_touching_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let f = dir.path().join("f.txt");
        fs::write(&f, b"v1").unwrap();
        let snap = mgr.capture("s1", 0, "filesystem.write", &[f.clone()]).await.unwrap();
        fs::write(&f, b"v2").unwrap();
        let hash = snap.blobs().next().unwrap().to_string();
        fs::write(mgr.store().blob_path("s1", &hash), b"garbage").unwrap();

        let err = mgr.restore(&snap).await.unwrap_err();
        assert!(matches!(err, EngineError::RestoreFailed(_)));
        assert_eq!(fs::read(&f).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_rollback_consumes_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let f = dir.path().join("f.txt");
        fs::write(&f, b"v0").unwrap();

        let chain = mgr.open_chain("s1").await;
        for (i, next) in ["v1", "v2"].iter().enumerate() {
            let snap = mgr.capture("s1", i, "filesystem.write", &[f.clone()]).await.unwrap();
            let mut guard = chain.lock().await;
            mgr.record("s1", &mut guard, ChainEntry::Snapshot(snap)).await.unwrap();
            fs::write(&f, next).unwrap();
        }
        {
            let mut guard = chain.lock().await;
            let marker = ChainEntry::Irreversible { step_index: 2, tool_name: "system.command".into(), recorded_at: Utc::now() };
            mgr.record("s1", &mut guard, marker).await.unwrap();
        }

        let report = mgr.chain_rollback("s1", 2).await.unwrap();
        assert_eq!(report.irreversible_steps(), vec![2]);
        assert_eq!(report.remaining, 1);
        assert_eq!(fs::read(&f).unwrap(), b"v1");

        mgr.chain_rollback("s1", 5).await.unwrap();
        assert_eq!(fs::read(&f).unwrap(), b"v0");
        assert!(matches!(
            mgr.chain_rollback("s1", 1).await,
            Err(EngineError::NothingToRollback(_))
        ));
        assert!(mgr.store().list("s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_steps_back_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let chain = mgr.open_chain("s1").await;
        let mut guard = chain.lock().await;
        let marker = ChainEntry::Irreversible { step_index: 0, tool_name: "x.y".into(), recorded_at: Utc::now() };
        mgr.record("s1", &mut guard, marker).await.unwrap();
        assert!(matches!(
            mgr.rollback_locked("s1", &mut guard, 0).await,
            Err(EngineError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_chain_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let f = dir.path().join("f.txt");
        fs::write(&f, b"v0").unwrap();
        let chain = mgr.open_chain("s1").await;
        let snap = mgr.capture("s1", 0, "filesystem.write", &[f.clone()]).await.unwrap();
        let hash = snap.blobs().next().unwrap().to_string();
        mgr.record("s1", &mut *chain.lock().await, ChainEntry::Snapshot(snap)).await.unwrap();
        mgr.store().remove("s1", &hash).unwrap();

        assert!(matches!(mgr.chain_rollback("s1", 1).await, Err(EngineError::RestoreFailed(_))));
        assert_eq!(chain.len().await, 1);
    }

    #[tokio::test]
    async fn test_multi_step_rollback_verifies_every_snapshot_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"a-original").unwrap();
        fs::write(&b, b"b-original").unwrap();

        let chain = mgr.open_chain("s1").await;
        let snap_a = mgr.capture("s1", 0, "filesystem.write", &[a.clone()]).await.unwrap();
        let hash_a = snap_a.blobs().next().unwrap().to_string();
        mgr.record("s1", &mut *chain.lock().await, ChainEntry::Snapshot(snap_a)).await.unwrap();
        fs::write(&a, b"a-changed").unwrap();
        let snap_b = mgr.capture("s1", 1, "filesystem.write", &[b.clone()]).await.unwrap();
        mgr.record("s1", &mut *chain.lock().await, ChainEntry::Snapshot(snap_b)).await.unwrap();
        fs::write(&b, b"b-changed").unwrap();

        fs::write(mgr.store().blob_path("s1", &hash_a), b"garbage").unwrap();
        let err = mgr.chain_rollback("s1", 2).await.unwrap_err();
        assert!(matches!(err, EngineError::RestoreFailed(_)));
        assert_eq!(chain.len().await, 2);
        assert_eq!(fs::read(&a).unwrap(), b"a-changed");
        assert_eq!(fs::read(&b).unwrap(), b"b-changed");
    }

    #[tokio::test]
    async fn test_expire_waits_for_in_progress_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(SnapshotManager::new(
            BlobStore::new(dir.path().join("snapshots")),
            Arc::new(MemoryMetadataStore::new()),
            SnapshotLimits { ttl: chrono::Duration::zero(), ..SnapshotLimits::default() },
        ));
        let f = dir.path().join("f.txt");
        fs::write(&f, b"v0").unwrap();
        let chain = mgr.open_chain("s1").await;
        for (i, next) in ["v1", "v2"].iter().enumerate() {
            let snap = mgr.capture("s1", i, "filesystem.write", &[f.clone()]).await.unwrap();
            mgr.record("s1", &mut *chain.lock().await, ChainEntry::Snapshot(snap)).await.unwrap();
            fs::write(&f, next).unwrap();
        }

        let mut guard = chain.lock().await;
        let expire = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.expire(Utc::now() + chrono::Duration::seconds(1)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!expire.is_finished());

        let report = mgr.rollback_locked("s1", &mut guard, 1).await.unwrap();
        assert_eq!(report.remaining, 1);
        assert_eq!(fs::read(&f).unwrap(), b"v1");
        drop(guard);

        // 正在回滚的条目已被消费；expire 只看到剩下的一个
        let report = expire.await.unwrap().unwrap();
        assert_eq!(report.entries_removed, 1);
        assert_eq!(chain.len().await, 0);
        assert_eq!(fs::read(&f).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_expire_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let f = dir.path().join("f.txt");
        fs::write(&f, b"v0").unwrap();
        let chain = mgr.open_chain("s1").await;
        let snap = mgr.capture("s1", 0, "filesystem.write", &[f.clone()]).await.unwrap();
        mgr.record("s1", &mut *chain.lock().await, ChainEntry::Snapshot(snap)).await.unwrap();

        let report = mgr.expire(Utc::now()).await.unwrap();
        assert_eq!(report.entries_removed, 0);
        let report = mgr.expire(Utc::now() + chrono::Duration::days(8)).await.unwrap();
        assert_eq!(report.entries_removed, 1);
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(chain.len().await, 0);
        assert!(mgr.metadata().get("chain/s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let store = BlobStore::new(dir.path().join("snapshots"));
        let f = dir.path().join("f.txt");
        fs::write(&f, b"v0").unwrap();
        {
            let mgr = SnapshotManager::new(store.clone(), metadata.clone(), SnapshotLimits::default());
            let chain = mgr.open_chain("s1").await;
            let snap = mgr.capture("s1", 0, "filesystem.write", &[f.clone()]).await.unwrap();
            mgr.record("s1", &mut *chain.lock().await, ChainEntry::Snapshot(snap)).await.unwrap();
        }
        fs::write(&f, b"v1").unwrap();

        let mgr = SnapshotManager::new(store, metadata, SnapshotLimits::default());
        assert_eq!(mgr.recover("s1").await.unwrap().len().await, 1);
        mgr.chain_rollback("s1", 1).await.unwrap();
        assert_eq!(fs::read(&f).unwrap(), b"v0");

        mgr.discard_session("s1").await.unwrap();
        assert!(mgr.metadata().get("chain/s1").await.unwrap().is_none());
        assert!(!mgr.store().session_dir("s1").exists());
    }
}
