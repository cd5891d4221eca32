//! 元数据持久化边界：只依赖一个持久的键值写
//!
//! 键形如 `chain/<session>`、`snapshot/<session>/<id>`、`session/<session>`，值为 JSON。
//! FileMetadataStore 每个键一个文件，写入走「临时文件 + sync + rename」保证原子性。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::core::EngineError;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put(&self, key: &str, value: &Value) -> Result<(), EngineError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;

    async fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// 以 prefix 开头的全部键（排序）
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, EngineError>;

    /// 落盘挂起的写入；默认实现的写入已是同步持久的
    async fn flush(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// 基于目录的实现
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, EngineError> {
        let valid = !key.is_empty()
            && key
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains('\\'));
        if !valid {
            return Err(EngineError::Persistence(format!("invalid metadata key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

fn persistence_err(key: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence(format!("{}: {}", key, e))
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn put(&self, key: &str, value: &Value) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_err(key, e))?;
        }
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| persistence_err(key, e))?;
        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(persistence_err(key, e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| persistence_err(key, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence_err(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_err(key, e)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        let dir = self.dir.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            if !dir.exists() {
                return Ok(keys);
            }
            for entry in walkdir::WalkDir::new(&dir) {
                let entry = entry.map_err(|e| persistence_err(&prefix, e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&dir) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                if let Some(key) = rel.strip_suffix(".json") {
                    if key.starts_with(&prefix) {
                        keys.push(key.to_string());
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }
}

/// 内存实现（测试与 --ephemeral）
#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, key: &str, value: &Value) -> Result<(), EngineError> {
        self.entries.write().await.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
