//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HEARTH__*` 覆盖（双下划线表示嵌套，如 `HEARTH__POLICY__NETWORK_ENABLED=true`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub executor: ExecutorSection,
    pub snapshot: SnapshotSection,
    pub policy: PolicySection,
    pub tools: ToolsSection,
}

impl AppConfig {
    /// 数据目录：优先配置，其次 $XDG_DATA_HOME/hearth，最后 ~/.local/share/hearth
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.app.data_dir {
            return dir.clone();
        }
        if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("hearth");
        }
        crate::policy::paths::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local/share/hearth")
    }

    /// 快照后备存储根目录，未设置时为 <data_dir>/snapshots
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("snapshots"))
    }

    /// 元数据存储目录（会话记录与快照链）
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir().join("metadata")
    }
}

/// [app] 段：应用名、数据目录、并发会话上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// 同时执行的会话数上限
    pub max_concurrent_sessions: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: None,
            max_concurrent_sessions: 5,
        }
    }
}

/// [executor] 段：单次工具调用的超时与资源上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub tool_timeout_secs: u64,
    pub memory_limit_mb: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 60,
            memory_limit_mb: 512,
        }
    }
}

/// [snapshot] 段：保留期与大小上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub dir: Option<PathBuf>,
    pub ttl_days: u64,
    /// 单文件上限（MB）
    pub max_file_mb: u64,
    /// 单个快照累计上限（MB）
    pub max_snapshot_mb: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_days: 7,
            max_file_mb: 100,
            max_snapshot_mb: 1024,
        }
    }
}

/// [policy] 段：路径允许/拒绝 glob、批量确认阈值、网络开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub bulk_threshold: usize,
    /// MEDIUM 风险的写操作是否需要确认
    pub confirm_writes: bool,
    pub network_enabled: bool,
    pub allowed_hosts: Vec<String>,
    /// 写入内容的大小上限（MB）
    pub max_file_mb: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            allow: vec!["~/**".into(), "/tmp/**".into()],
            deny: vec![
                "/".into(),
                "~/.ssh/**".into(),
                "~/.gnupg/**".into(),
                "/etc/**".into(),
                "/usr/**".into(),
                "/bin/**".into(),
                "/sbin/**".into(),
                "/boot/**".into(),
                "/sys/**".into(),
                "/proc/**".into(),
            ],
            bulk_threshold: 50,
            confirm_writes: true,
            network_enabled: false,
            allowed_hosts: Vec::new(),
            max_file_mb: 100,
        }
    }
}

/// [tools] 段：自定义工具目录、Shell 白名单、网络抓取限制
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    /// 用户工具清单目录（*.toml），未设置时为 <data_dir>/tools
    pub custom_dir: Option<PathBuf>,
    pub shell: ShellSection,
    pub fetch: FetchSection,
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: vec![
                "ls".into(),
                "grep".into(),
                "cat".into(),
                "head".into(),
                "tail".into(),
                "wc".into(),
                "find".into(),
                "echo".into(),
                "rm".into(),
                "mv".into(),
                "cp".into(),
                "mkdir".into(),
                "touch".into(),
            ],
        }
    }
}

/// [tools.fetch] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HEARTH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HEARTH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HEARTH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 会话之间重新加载配置；运行中的会话持有自己的策略副本，不受影响
pub fn reload_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    load_config(config_path)
}
