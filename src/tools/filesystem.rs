//! 文件系统工具
//!
//! 路径参数先经 `~` 展开与词法归一；允许/拒绝由权限评估在调用前完成，这里不再做沙箱校验。
//! 阻塞 IO 经 ToolContext::run_blocking 执行；超时后执行器取消 token 并等待这些任务结束，
//! 逐项处理的循环（搜索、复制、删除）在每项之前检查取消。

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::policy::paths::expand_path;
use crate::tools::manifest::{ParamRole, ParamType, RiskClass, ToolManifest, ToolParameter};
use crate::tools::schema::{bool_arg, require_str, str_arg, string_list};
use crate::tools::{Tool, ToolContext, ToolError};

/// 内容搜索时跳过超过此大小的文件
const CONTENT_SEARCH_MAX_BYTES: u64 = 1024 * 1024;

fn io_err(path: &Path, e: std::io::Error) -> ToolError {
    ToolError::Failed(format!("{}: {}", path.display(), e))
}

fn modified_rfc3339(meta: &fs::Metadata) -> Option<String> {
    meta.modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
}

fn path_param(name: &str, description: &str) -> ToolParameter {
    ToolParameter::required(name, ParamType::String)
        .with_role(ParamRole::Path)
        .describe(description)
}

fn entry_json(path: &Path, meta: &fs::Metadata) -> Value {
    json!({
        "name": path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        "path": path.to_string_lossy(),
        "size": meta.len(),
        "modified": modified_rfc3339(meta),
        "is_dir": meta.is_dir(),
    })
}

/// 按文件名（可选内容）搜索
pub struct SearchTool {
    manifest: ToolManifest,
}

impl SearchTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new(
            "filesystem.search",
            "Search files by name (and optionally content) under a directory.",
        )
        .param(ToolParameter::required("query", ParamType::String).describe("Text to look for"))
        .param(
            ToolParameter::optional("path", ParamType::String)
                .with_role(ParamRole::Path)
                .with_default(json!("~"))
                .describe("Directory to search"),
        )
        .param(
            ToolParameter::optional("extensions", ParamType::Array)
                .with_alias("ext")
                .with_default(json!([]))
                .describe("File extensions to keep, e.g. [\".xlsx\"]"),
        )
        .param(ToolParameter::optional("max_results", ParamType::Integer).with_default(json!(50)))
        .param(ToolParameter::optional("search_content", ParamType::Boolean).with_default(json!(false)))
        .idempotent(true);
        Self { manifest }
    }
}

impl Default for SearchTool {
    fn default() -> Self {
        Self::new()
    }
}

fn extension_matches(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    extensions
        .iter()
        .any(|want| want.trim_start_matches('.').to_lowercase() == ext)
}

fn content_contains(path: &Path, needle: &str, size: u64) -> bool {
    if size > CONTENT_SEARCH_MAX_BYTES {
        return false;
    }
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_lowercase().contains(needle),
        Err(_) => false,
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = require_str(&args, "query")?.to_string();
        let root = expand_path(str_arg(&args, "path").unwrap_or("~"));
        let extensions = string_list(&args, "extensions");
        let max_results = args.get("max_results").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
        let search_content = bool_arg(&args, "search_content");
        tracing::info!(query = %query, root = %root.display(), "filesystem search");

        ctx.run_blocking(move |cancel| {
            if !root.is_dir() {
                return Err(ToolError::Failed(format!("{} is not a directory", root.display())));
            }
            let needle = query.to_lowercase();
            let mut results = Vec::new();
            let mut truncated = false;
            let walker = walkdir::WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
            for entry in walker.filter_map(|e| e.ok()) {
                if cancel.is_cancelled() {
                    return Err(ToolError::cancelled());
                }
                if entry.depth() == 0 || !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if !extension_matches(path, &extensions) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let name_hit = entry.file_name().to_string_lossy().to_lowercase().contains(&needle);
                if name_hit || (search_content && content_contains(path, &needle, meta.len())) {
                    if results.len() >= max_results {
                        truncated = true;
                        break;
                    }
                    results.push(entry_json(path, &meta));
                }
            }
            Ok(json!({
                "query": query,
                "path": root.to_string_lossy(),
                "count": results.len(),
                "truncated": truncated,
                "results": results,
            }))
        })
        .await
    }
}

/// 读取文本文件
pub struct ReadTool {
    manifest: ToolManifest,
}

impl ReadTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.read", "Read a text file.")
            .param(path_param("path", "File to read"))
            .param(
                ToolParameter::optional("max_bytes", ParamType::Integer)
                    .with_default(json!(1_048_576))
                    .describe("Read at most this many bytes"),
            )
            .idempotent(true);
        Self { manifest }
    }
}

impl Default for ReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = expand_path(require_str(&args, "path")?);
        let max_bytes = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(1_048_576)
            .min(ctx.memory_limit_bytes);
        ctx.run_blocking(move |_| {
            let meta = fs::metadata(&path).map_err(|e| io_err(&path, e))?;
            if meta.is_dir() {
                return Err(ToolError::Failed(format!("{} is a directory", path.display())));
            }
            let mut file = fs::File::open(&path).map_err(|e| io_err(&path, e))?;
            let mut buf = Vec::new();
            Read::by_ref(&mut file)
                .take(max_bytes)
                .read_to_end(&mut buf)
                .map_err(|e| io_err(&path, e))?;
            Ok(json!({
                "path": path.to_string_lossy(),
                "size": meta.len(),
                "truncated": meta.len() > buf.len() as u64,
                "content": String::from_utf8_lossy(&buf),
            }))
        })
        .await
    }
}

/// 列出目录
pub struct ListTool {
    manifest: ToolManifest,
}

impl ListTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.list", "List a directory.")
            .param(
                ToolParameter::optional("path", ParamType::String)
                    .with_role(ParamRole::Path)
                    .with_default(json!("."))
                    .describe("Directory to list"),
            )
            .param(ToolParameter::optional("include_hidden", ParamType::Boolean).with_default(json!(false)))
            .idempotent(true);
        Self { manifest }
    }
}

impl Default for ListTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ListTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let dir = expand_path(str_arg(&args, "path").unwrap_or("."));
        let include_hidden = bool_arg(&args, "include_hidden");
        ctx.run_blocking(move |_| {
            let mut entries = Vec::new();
            for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !include_hidden && name.starts_with('.') {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                entries.push((name, entry_json(&entry.path(), &meta)));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let entries: Vec<Value> = entries.into_iter().map(|(_, v)| v).collect();
            Ok(json!({
                "path": dir.to_string_lossy(),
                "count": entries.len(),
                "entries": entries,
            }))
        })
        .await
    }
}

/// 文件/目录信息
pub struct InfoTool {
    manifest: ToolManifest,
}

impl InfoTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.info", "Show metadata of a path.")
            .param(path_param("path", "Path to inspect"))
            .idempotent(true);
        Self { manifest }
    }
}

impl Default for InfoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for InfoTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = expand_path(require_str(&args, "path")?);
        ctx.run_blocking(move |_| {
            let meta = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(json!({"path": path.to_string_lossy(), "exists": false}))
                }
                Err(e) => return Err(io_err(&path, e)),
            };
            Ok(json!({
                "path": path.to_string_lossy(),
                "exists": true,
                "is_dir": meta.is_dir(),
                "is_file": meta.is_file(),
                "is_symlink": meta.file_type().is_symlink(),
                "size": meta.len(),
                "modified": modified_rfc3339(&meta),
                "readonly": meta.permissions().readonly(),
            }))
        })
        .await
    }
}

/// 写文件（覆盖或追加）
pub struct WriteTool {
    manifest: ToolManifest,
}

impl WriteTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.write", "Write text to a file.")
            .param(path_param("path", "File to write"))
            .param(ToolParameter::required("content", ParamType::String))
            .param(
                ToolParameter::optional("mode", ParamType::String)
                    .with_choices(vec![json!("overwrite"), json!("append")])
                    .with_default(json!("overwrite")),
            )
            .param(ToolParameter::optional("create_dirs", ParamType::Boolean).with_default(json!(true)))
            .risk(RiskClass::Medium)
            .confirm("Write to {path}?");
        Self { manifest }
    }
}

impl Default for WriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = expand_path(require_str(&args, "path")?);
        let content = require_str(&args, "content")?.to_string();
        let append = str_arg(&args, "mode") == Some("append");
        let create_dirs = args.get("create_dirs").and_then(|v| v.as_bool()).unwrap_or(true);
        ctx.run_blocking(move |_| {
            if create_dirs {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;
            file.write_all(content.as_bytes()).map_err(|e| io_err(&path, e))?;
            Ok(json!({
                "path": path.to_string_lossy(),
                "bytes_written": content.len(),
                "mode": if append { "append" } else { "overwrite" },
            }))
        })
        .await
    }
}

fn copy_recursive(source: &Path, destination: &Path, cancel: &CancellationToken) -> Result<usize, ToolError> {
    let meta = fs::symlink_metadata(source).map_err(|e| io_err(source, e))?;
    if !meta.is_dir() {
        fs::copy(source, destination).map_err(|e| io_err(source, e))?;
        return Ok(1);
    }
    let mut files = 0;
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        if cancel.is_cancelled() {
            return Err(ToolError::cancelled());
        }
        let entry = entry.map_err(|e| ToolError::Failed(e.to_string()))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let target = destination.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| io_err(entry.path(), e))?;
            files += 1;
        }
    }
    Ok(files)
}

fn ensure_destination(destination: &Path, overwrite: bool) -> Result<(), ToolError> {
    if destination.exists() && !overwrite {
        return Err(ToolError::Failed(format!(
            "{} already exists (set overwrite=true)",
            destination.display()
        )));
    }
    if destination.exists() {
        remove_path(destination, true)?;
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    Ok(())
}

fn remove_path(path: &Path, recursive: bool) -> Result<(), ToolError> {
    let meta = fs::symlink_metadata(path).map_err(|e| io_err(path, e))?;
    if meta.is_dir() {
        if recursive {
            fs::remove_dir_all(path).map_err(|e| io_err(path, e))
        } else {
            fs::remove_dir(path).map_err(|e| io_err(path, e))
        }
    } else {
        fs::remove_file(path).map_err(|e| io_err(path, e))
    }
}

fn source_and_destination(args: &Value) -> Result<(PathBuf, PathBuf, bool), ToolError> {
    Ok((
        expand_path(require_str(args, "source")?),
        expand_path(require_str(args, "destination")?),
        bool_arg(args, "overwrite"),
    ))
}

/// 复制文件或目录
pub struct CopyTool {
    manifest: ToolManifest,
}

impl CopyTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.copy", "Copy a file or directory.")
            .param(path_param("source", "Path to copy"))
            .param(path_param("destination", "Where to put the copy"))
            .param(ToolParameter::optional("overwrite", ParamType::Boolean).with_default(json!(false)));
        Self { manifest }
    }
}

impl Default for CopyTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CopyTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let (source, destination, overwrite) = source_and_destination(&args)?;
        ctx.run_blocking(move |cancel| {
            if !source.exists() {
                return Err(ToolError::Failed(format!("{} does not exist", source.display())));
            }
            ensure_destination(&destination, overwrite)?;
            let files = copy_recursive(&source, &destination, &cancel)?;
            Ok(json!({
                "source": source.to_string_lossy(),
                "destination": destination.to_string_lossy(),
                "files_copied": files,
            }))
        })
        .await
    }
}

/// 移动/重命名
pub struct MoveTool {
    manifest: ToolManifest,
}

impl MoveTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.move", "Move or rename a file or directory.")
            .param(path_param("source", "Path to move"))
            .param(path_param("destination", "New location"))
            .param(ToolParameter::optional("overwrite", ParamType::Boolean).with_default(json!(false)))
            .risk(RiskClass::Medium)
            .confirm("Move {source} to {destination}?");
        Self { manifest }
    }
}

impl Default for MoveTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for MoveTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let (source, destination, overwrite) = source_and_destination(&args)?;
        ctx.run_blocking(move |cancel| {
            if fs::symlink_metadata(&source).is_err() {
                return Err(ToolError::Failed(format!("{} does not exist", source.display())));
            }
            ensure_destination(&destination, overwrite)?;
            if fs::rename(&source, &destination).is_err() {
                // 跨文件系统时退化为复制 + 删除
                copy_recursive(&source, &destination, &cancel)?;
                remove_path(&source, true)?;
            }
            Ok(json!({
                "source": source.to_string_lossy(),
                "destination": destination.to_string_lossy(),
            }))
        })
        .await
    }
}

/// 删除文件或目录
pub struct DeleteTool {
    manifest: ToolManifest,
}

impl DeleteTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.delete", "Delete files or directories.")
            .param(
                ToolParameter::required("paths", ParamType::Array)
                    .with_role(ParamRole::PathList)
                    .with_alias("path")
                    .describe("Paths to delete"),
            )
            .param(
                ToolParameter::optional("recursive", ParamType::Boolean)
                    .with_default(json!(false))
                    .describe("Allow deleting non-empty directories"),
            )
            .risk(RiskClass::High)
            .confirm("Delete {paths}?");
        Self { manifest }
    }
}

impl Default for DeleteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for DeleteTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let paths: Vec<PathBuf> = string_list(&args, "paths").iter().map(|p| expand_path(p)).collect();
        let recursive = bool_arg(&args, "recursive");
        if paths.is_empty() {
            return Err(ToolError::Failed("no paths given".to_string()));
        }
        ctx.run_blocking(move |cancel| {
            let mut deleted = Vec::with_capacity(paths.len());
            for path in &paths {
                if cancel.is_cancelled() {
                    return Err(ToolError::Failed(format!(
                        "cancelled after deleting {} of {}",
                        deleted.len(),
                        paths.len()
                    )));
                }
                if let Err(e) = remove_path(path, recursive) {
                    return Err(ToolError::Failed(format!(
                        "deleted {} of {} before failing: {}",
                        deleted.len(),
                        paths.len(),
                        e
                    )));
                }
                deleted.push(Value::String(path.to_string_lossy().to_string()));
            }
            Ok(json!({ "count": deleted.len(), "deleted": deleted }))
        })
        .await
    }
}

/// 创建目录
pub struct CreateDirectoryTool {
    manifest: ToolManifest,
}

impl CreateDirectoryTool {
    pub fn new() -> Self {
        let manifest = ToolManifest::new("filesystem.create_directory", "Create a directory.")
            .param(path_param("path", "Directory to create"))
            .param(ToolParameter::optional("parents", ParamType::Boolean).with_default(json!(true)));
        Self { manifest }
    }
}

impl Default for CreateDirectoryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CreateDirectoryTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = expand_path(require_str(&args, "path")?);
        let parents = args.get("parents").and_then(|v| v.as_bool()).unwrap_or(true);
        ctx.run_blocking(move |_| {
            let existed = path.is_dir();
            let result = if parents {
                fs::create_dir_all(&path)
            } else {
                fs::create_dir(&path)
            };
            result.map_err(|e| io_err(&path, e))?;
            Ok(json!({"path": path.to_string_lossy(), "created": !existed}))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::normalize_arguments;

    async fn run(tool: &dyn Tool, args: Value) -> Result<Value, ToolError> {
        let normalized = normalize_arguments(tool.manifest(), &args).unwrap();
        tool.execute(Value::Object(normalized), &ToolContext::default()).await
    }

    #[tokio::test]
    async fn test_search_by_name_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Budget-2024.xlsx"), b"x").unwrap();
        fs::write(dir.path().join("budget.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join(".hidden/budget.xlsx"), b"x").unwrap();

        let out = run(
            &SearchTool::new(),
            json!({"query": "budget", "ext": [".xlsx"], "path": dir.path().to_string_lossy()}),
        )
        .await
        .unwrap();
        assert_eq!(out["count"], json!(1));
        assert_eq!(out["results"][0]["name"], json!("Budget-2024.xlsx"));
    }

    #[tokio::test]
    async fn test_search_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), b"quarterly budget review").unwrap();
        let out = run(
            &SearchTool::new(),
            json!({"query": "budget", "search_content": true, "path": dir.path().to_string_lossy()}),
        )
        .await
        .unwrap();
        assert_eq!(out["count"], json!(1));
    }

    #[tokio::test]
    async fn test_write_read_append() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sub/a.txt");
        let p = file.to_string_lossy().to_string();
        run(&WriteTool::new(), json!({"path": p, "content": "hello"})).await.unwrap();
        run(&WriteTool::new(), json!({"path": p, "content": " world", "mode": "append"})).await.unwrap();
        let out = run(&ReadTool::new(), json!({"path": p})).await.unwrap();
        assert_eq!(out["content"], json!("hello world"));
    }

    #[tokio::test]
    async fn test_read_truncates_at_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("long.txt");
        fs::write(&file, b"0123456789").unwrap();
        let out = run(&ReadTool::new(), json!({"path": file.to_string_lossy(), "max_bytes": 4}))
            .await
            .unwrap();
        assert_eq!(out["content"], json!("0123"));
        assert_eq!(out["truncated"], json!(true));
        assert_eq!(out["size"], json!(10));
    }

    #[tokio::test]
    async fn test_copy_move_delete() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let c = dir.path().join("moved/c.txt");
        fs::write(&a, b"data").unwrap();

        run(&CopyTool::new(), json!({"source": a.to_string_lossy(), "destination": b.to_string_lossy()}))
            .await
            .unwrap();
        assert!(run(&CopyTool::new(), json!({"source": a.to_string_lossy(), "destination": b.to_string_lossy()}))
            .await
            .is_err());
        run(&MoveTool::new(), json!({"source": b.to_string_lossy(), "destination": c.to_string_lossy()}))
            .await
            .unwrap();
        assert!(!b.exists());
        assert_eq!(fs::read(&c).unwrap(), b"data");

        let out = run(&DeleteTool::new(), json!({"path": a.to_string_lossy()})).await.unwrap();
        assert_eq!(out["count"], json!(1));
        assert!(!a.exists());
    }

    #[tokio::test]
    async fn test_delete_non_empty_dir_needs_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().join("d");
        fs::create_dir(&d).unwrap();
        fs::write(d.join("f"), b"x").unwrap();
        assert!(run(&DeleteTool::new(), json!({"paths": [d.to_string_lossy()]})).await.is_err());
        run(&DeleteTool::new(), json!({"paths": [d.to_string_lossy()], "recursive": true}))
            .await
            .unwrap();
        assert!(!d.exists());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let src = dir.path().join("src");
        fs::write(&a, b"keep").unwrap();
        fs::create_dir(&src).unwrap();
        fs::write(src.join("f"), b"x").unwrap();

        let ctx = ToolContext::default();
        ctx.cancel.cancel();
        let delete = DeleteTool::new();
        let args = normalize_arguments(delete.manifest(), &json!({"paths": [a.to_string_lossy()]})).unwrap();
        let err = delete.execute(Value::Object(args), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("cancelled after deleting 0 of 1"));
        assert!(a.exists());

        let dest = dir.path().join("dest");
        let copy = CopyTool::new();
        let args = normalize_arguments(
            copy.manifest(),
            &json!({"source": src.to_string_lossy(), "destination": dest.to_string_lossy()}),
        )
        .unwrap();
        assert!(copy.execute(Value::Object(args), &ctx).await.is_err());
        assert!(!dest.join("f").exists());
    }

    #[tokio::test]
    async fn test_list_info_and_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("x/y");
        let out = run(&CreateDirectoryTool::new(), json!({"path": nested.to_string_lossy()})).await.unwrap();
        assert_eq!(out["created"], json!(true));
        fs::write(dir.path().join("f.txt"), b"abc").unwrap();

        let out = run(&ListTool::new(), json!({"path": dir.path().to_string_lossy()})).await.unwrap();
        assert_eq!(out["count"], json!(2));
        let out = run(&InfoTool::new(), json!({"path": dir.path().join("f.txt").to_string_lossy()}))
            .await
            .unwrap();
        assert_eq!(out["size"], json!(3));
        let out = run(&InfoTool::new(), json!({"path": dir.path().join("nope").to_string_lossy()}))
            .await
            .unwrap();
        assert_eq!(out["exists"], json!(false));
    }
}
