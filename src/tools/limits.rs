//! 子进程资源上限
//!
//! 在 exec 之前以 setrlimit(RLIMIT_AS) 限制子进程地址空间；非 unix 平台不施加。
//! 进程内工具不经过这里，只受输出字节上限约束。

use std::process::ExitStatus;

use tokio::process::Command;

/// 为即将 spawn 的命令设置地址空间上限；0 表示不限制
pub fn apply_memory_limit(cmd: &mut Command, bytes: u64) {
    if bytes == 0 {
        return;
    }
    #[cfg(unix)]
    {
        let limit = bytes as libc::rlim_t;
        // SAFETY: 闭包只调用 async-signal-safe 的 setrlimit，不分配内存也不加锁
        unsafe {
            cmd.pre_exec(move || {
                let rlimit = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    let _ = (cmd, bytes);
}

/// 失败的子进程是否撞上了内存上限
///
/// 分配失败通常表现为 SIGSEGV/SIGABRT/SIGKILL 终止，或 stderr 中的分配错误信息。
pub fn hit_memory_limit(status: &ExitStatus, stderr: &str) -> bool {
    if status.success() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if matches!(
            status.signal(),
            Some(libc::SIGSEGV) | Some(libc::SIGABRT) | Some(libc::SIGKILL)
        ) {
            return true;
        }
    }
    let stderr = stderr.to_lowercase();
    [
        "cannot allocate memory",
        "out of memory",
        "memory exhausted",
        "memory allocation failed",
        "bad_alloc",
    ]
    .iter()
    .any(|marker| stderr.contains(marker))
}
