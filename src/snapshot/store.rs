//! 内容寻址 blob 存储：<root>/<session>/objects/<aa>/<bb>/<sha256>
//!
//! 写入时边读边哈希到临时文件，完成后 rename 到最终位置；同一内容只存一份。
//! 全部为阻塞 IO，由 SnapshotManager 放到 spawn_blocking 中调用。

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn objects_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("objects")
    }

    pub fn blob_path(&self, session_id: &str, hash: &str) -> PathBuf {
        let (a, b) = if hash.len() >= 4 {
            (&hash[0..2], &hash[2..4])
        } else {
            ("xx", "xx")
        };
        self.objects_dir(session_id).join(a).join(b).join(hash)
    }

    /// 存入文件内容，返回 (哈希, 字节数, 是否新建)
    pub fn put_file(&self, session_id: &str, source: &Path) -> io::Result<(String, u64, bool)> {
        let tmp_dir = self.objects_dir(session_id).join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());

        let result = (|| {
            let mut input = fs::File::open(source)?;
            let mut output = fs::File::create(&tmp_path)?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut size = 0u64;
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                output.write_all(&buf[..n])?;
                size += n as u64;
            }
            output.sync_all()?;
            Ok::<_, io::Error>((hex(&hasher.finalize()), size))
        })();

        let (hash, size) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        let dest = self.blob_path(session_id, &hash);
        if dest.exists() {
            fs::remove_file(&tmp_path)?;
            return Ok((hash, size, false));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp_path, &dest)?;
        Ok((hash, size, true))
    }

    /// 重新计算 blob 哈希并与文件名比对
    pub fn verify(&self, session_id: &str, hash: &str) -> io::Result<bool> {
        let path = self.blob_path(session_id, hash);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex(&hasher.finalize()) == hash)
    }

    /// 把 blob 内容写到目标路径（先写同目录临时文件再 rename）
    pub fn write_to(&self, session_id: &str, hash: &str, dest: &Path) -> io::Result<u64> {
        let src = self.blob_path(session_id, hash);
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "restore".to_string());
        let tmp = dest.with_file_name(format!(".{}.hearth-restore", file_name));
        let copied = fs::copy(&src, &tmp)?;
        if let Err(e) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(copied)
    }

    pub fn remove(&self, session_id: &str, hash: &str) -> io::Result<bool> {
        match fs::remove_file(self.blob_path(session_id, hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 会话目录中现存的 blob 哈希
    pub fn list(&self, session_id: &str) -> io::Result<Vec<String>> {
        let dir = self.objects_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).min_depth(3).max_depth(3) {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_file() {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn remove_session(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
