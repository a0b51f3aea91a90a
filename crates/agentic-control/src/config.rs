use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use agentic_process::DEFAULT_OUTPUT_TAIL_CHARS;
use agentic_supervisor::shell::ScriptEnv;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

/// Server settings, read once at boot from `AGENTIC_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub tools_root: PathBuf,
    pub projects_root: PathBuf,
    /// `None` runs environment commands as the server's own user.
    pub run_as_user: Option<String>,
    pub ssh_host: String,
    pub automaker_port: u16,
    pub output_tail_chars: usize,
    pub command_timeout: Duration,
    pub continuous_claude_bin: String,
    pub python_bin: String,
    pub npm_bin: String,
    /// Directories searched first by shell commands.
    pub extra_path: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 3000).into(),
            state_file: PathBuf::from("/tmp/agentic-dashboard-state.json"),
            log_dir: PathBuf::from("/tmp/agentic-logs"),
            tools_root: PathBuf::from("/root/agentic-tools"),
            projects_root: PathBuf::from("/data/projects"),
            run_as_user: Some("ubuntu".to_string()),
            ssh_host: "localhost".to_string(),
            automaker_port: 3007,
            output_tail_chars: DEFAULT_OUTPUT_TAIL_CHARS,
            command_timeout: Duration::from_secs(60),
            continuous_claude_bin: "continuous-claude".to_string(),
            python_bin: "python".to_string(),
            npm_bin: "npm".to_string(),
            extra_path: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let listen_addr = match env_string("AGENTIC_LISTEN_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid AGENTIC_LISTEN_ADDR {raw:?}: {e}"))?,
            None => d.listen_addr,
        };

        // An explicitly empty value means "run as myself".
        let run_as_user = match std::env::var("AGENTIC_RUN_AS_USER") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => d.run_as_user,
        };

        let automaker_port = match env_u64("AGENTIC_AUTOMAKER_PORT") {
            Some(p) => u16::try_from(p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| anyhow::anyhow!("invalid AGENTIC_AUTOMAKER_PORT: {p}"))?,
            None => d.automaker_port,
        };

        Ok(Self {
            listen_addr,
            state_file: env_string("AGENTIC_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.state_file),
            log_dir: env_string("AGENTIC_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.log_dir),
            tools_root: env_string("AGENTIC_TOOLS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.tools_root),
            projects_root: env_string("AGENTIC_PROJECTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.projects_root),
            run_as_user,
            ssh_host: env_string("AGENTIC_SSH_HOST").unwrap_or(d.ssh_host),
            automaker_port,
            output_tail_chars: env_usize("AGENTIC_OUTPUT_TAIL_CHARS")
                .map(|v| v.clamp(100, 100_000))
                .unwrap_or(d.output_tail_chars),
            command_timeout: env_u64("AGENTIC_COMMAND_TIMEOUT_MS")
                .map(|v| Duration::from_millis(v.clamp(1000, 600_000)))
                .unwrap_or(d.command_timeout),
            continuous_claude_bin: env_string("AGENTIC_CONTINUOUS_CLAUDE_BIN")
                .unwrap_or(d.continuous_claude_bin),
            python_bin: env_string("AGENTIC_PYTHON_BIN").unwrap_or(d.python_bin),
            npm_bin: env_string("AGENTIC_NPM_BIN").unwrap_or(d.npm_bin),
            extra_path: std::env::var_os("AGENTIC_EXTRA_PATH")
                .map(|v| {
                    std::env::split_paths(&v)
                        .filter(|p| !p.as_os_str().is_empty())
                        .collect()
                })
                .unwrap_or(d.extra_path),
        })
    }

    pub fn auto_claude_backend_dir(&self) -> PathBuf {
        self.tools_root
            .join("Auto-Claude")
            .join("apps")
            .join("backend")
    }

    pub fn automaker_dir(&self) -> PathBuf {
        self.tools_root.join("automaker")
    }

    pub fn automaker_url(&self) -> String {
        format!("http://localhost:{}", self.automaker_port)
    }

    pub fn project_dir(&self, session: &str) -> PathBuf {
        self.projects_root.join(session)
    }

    /// `user@host` for copy-pasteable ssh hints.
    pub fn ssh_target(&self) -> String {
        match &self.run_as_user {
            Some(u) => format!("{u}@{}", self.ssh_host),
            None => self.ssh_host.clone(),
        }
    }

    pub fn run_as(&self) -> Option<&str> {
        self.run_as_user.as_deref()
    }

    /// Shell for environment-tool commands, as the configured user.
    pub fn user_shell(&self) -> ScriptEnv {
        ScriptEnv {
            run_as: self.run_as_user.clone(),
            ..self.local_shell()
        }
    }

    /// Shell running as the server's own user.
    pub fn local_shell(&self) -> ScriptEnv {
        ScriptEnv {
            extra_path: self.extra_path.clone(),
            ..ScriptEnv::new(self.command_timeout)
        }
    }

    /// Config rooted in `dir`, running everything as the current user.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            state_file: dir.join("state.json"),
            log_dir: dir.join("logs"),
            tools_root: dir.join("tools"),
            projects_root: dir.join("projects"),
            run_as_user: None,
            command_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }
}
