//! Process supervision for the dashboard: the shared state document, detached
//! process spawning with per-run logs, liveness probing and one-shot shell
//! commands.

pub mod probe;
pub mod runner;
pub mod shell;
pub mod store;

pub use probe::{OsProbe, ProcessProbe};
pub use runner::{DetachedProcess, ExitReport, ProcessRunner, SpawnSpec};
pub use store::{StateStore, StoreError};

/// Flattens an error chain into one line, skipping repeated messages.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicU64, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };

    pub fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "agentic-supervisor-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ));
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::format_error_chain;
    use anyhow::Context;

    #[test]
    fn error_chain_joins_causes() {
        let err = std::fs::read("/definitely/not/here")
            .context("read state")
            .unwrap_err();
        let msg = format_error_chain(&err);
        assert!(msg.starts_with("read state: "));
    }
}
