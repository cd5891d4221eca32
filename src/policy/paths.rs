//! 路径规范化：`~` 展开、转绝对路径、词法归一（不访问文件系统，不解析符号链接）

use std::path::{Component, Path, PathBuf};

/// 当前用户主目录（$HOME）
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// 展开开头的 `~` 或 `~/`
pub fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// 词法归一：去掉 `.`，按 `..` 回退；根目录之上的 `..` 丢弃
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// `~` 展开 + 相对路径基于当前目录 + 词法归一
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = expand_tilde(raw.trim());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(expanded)
    };
    normalize(&absolute)
}

/// 命令行中形似路径的词（`/`、`~`、`./`、`../` 开头）
pub fn path_like_tokens(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|t| t.trim_matches(|c| c == '"' || c == '\''))
        .filter(|t| {
            t.starts_with('/') || t.starts_with('~') || t.starts_with("./") || t.starts_with("../")
        })
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_removes_dots() {
        assert_eq!(normalize(Path::new("/tmp/a/./b/../c")), PathBuf::from("/tmp/a/c"));
        assert_eq!(normalize(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/tmp/")), PathBuf::from("/tmp"));
    }

    #[test]
    fn test_expand_path_is_absolute() {
        let p = expand_path("some/relative/../file.txt");
        assert!(p.is_absolute());
        assert!(p.ends_with("some/file.txt"));
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        if let Some(home) = home_dir() {
            assert_eq!(expand_tilde("~/docs"), home.join("docs"));
            assert_eq!(expand_tilde("~"), home);
        }
        assert_eq!(expand_tilde("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn test_path_like_tokens_from_command() {
        let tokens = path_like_tokens("rm -rf / ./build '~/x' name");
        assert_eq!(tokens, vec!["/", "./build", "~/x"]);
    }
}
