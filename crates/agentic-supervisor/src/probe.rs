use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::shell;

/// Asks and signals the OS process table.
pub trait ProcessProbe: Send + Sync {
    /// `false` covers both "dead" and "cannot tell".
    fn is_alive(&self, pid: u32) -> bool;

    /// Pids whose full command line matches `pattern` (`pgrep -f` semantics).
    fn find_pids<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Vec<u32>>;

    /// SIGTERM to the process group led by `pid`.
    fn terminate_group(&self, pid: u32) -> bool;

    /// Best-effort `pkill -f pattern`.
    fn kill_matching<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, ()>;

    /// SIGKILLs whatever holds `port`; returns how many were signalled.
    fn free_port(&self, port: u16) -> BoxFuture<'_, usize>;
}

#[derive(Debug, Clone)]
pub struct OsProbe {
    timeout: Duration,
}

impl OsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ProcessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_alive(pid)
    }

    fn find_pids<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Vec<u32>> {
        Box::pin(find_pids(pattern, self.timeout))
    }

    fn terminate_group(&self, pid: u32) -> bool {
        terminate_group(pid)
    }

    fn kill_matching<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(kill_matching(pattern, self.timeout))
    }

    fn free_port(&self, port: u16) -> BoxFuture<'_, usize> {
        Box::pin(free_tcp_port(port, self.timeout))
    }
}

fn to_signal_pid(pid: u32) -> Option<i32> {
    // 0 and negative values address process groups, never a single process.
    i32::try_from(pid).ok().filter(|p| *p > 0)
}

/// Signal-0 probe.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_signal_pid(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Sends SIGTERM to the process group led by `pid`.
pub fn terminate_group(pid: u32) -> bool {
    let Some(pid) = to_signal_pid(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        unsafe { libc::kill(-pid, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub fn force_kill(pid: u32) -> bool {
    let Some(pid) = to_signal_pid(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub(crate) fn parse_pid_lines(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|p| *p != 0)
        .collect()
}

pub async fn find_pids(pattern: &str, timeout: Duration) -> Vec<u32> {
    // pgrep exits 1 when nothing matches; either way stdout is authoritative.
    match shell::run("pgrep", ["-f", pattern], timeout).await {
        Ok(out) => {
            let own = std::process::id();
            parse_pid_lines(&out.stdout)
                .into_iter()
                .filter(|p| *p != own)
                .collect()
        }
        Err(e) => {
            tracing::debug!(pattern, error = %e, "pgrep unavailable");
            Vec::new()
        }
    }
}

/// Best-effort `pkill -f`; a pattern without matches is not an error.
pub async fn kill_matching(pattern: &str, timeout: Duration) {
    match shell::run("pkill", ["-f", pattern], timeout).await {
        Ok(out) if out.success() => tracing::info!(pattern, "signalled matching processes"),
        Ok(_) => tracing::debug!(pattern, "no matching processes"),
        Err(e) => tracing::warn!(pattern, error = %e, "pkill failed"),
    }
}

/// SIGKILLs every process holding `port` open, as reported by `lsof`.
/// Returns how many processes were signalled.
pub async fn free_tcp_port(port: u16, timeout: Duration) -> usize {
    let arg = format!("-ti:{port}");
    let pids = match shell::run("lsof", [arg.as_str()], timeout).await {
        Ok(out) => parse_pid_lines(&out.stdout),
        Err(e) => {
            tracing::warn!(port, error = %e, "lsof failed");
            return 0;
        }
    };

    let own = std::process::id();
    let mut killed = 0;
    for pid in pids.into_iter().filter(|p| *p != own) {
        if force_kill(pid) {
            killed += 1;
        }
    }
    if killed > 0 {
        tracing::info!(port, killed, "freed port");
    }
    killed
}
