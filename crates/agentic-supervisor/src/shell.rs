use std::{ffi::OsStr, path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::process::Command;

/// PATH additions for user-installed toolchains (bun, cargo, go, uv, ...).
const USER_PATH_DIRS: &str =
    "\"$HOME/.local/bin:$HOME/.bun/bin:$HOME/.cargo/bin:/usr/local/go/bin:$PATH\"";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout if it has anything to say, stderr otherwise.
    pub fn combined(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

pub fn first_line(s: &str) -> &str {
    s.trim().lines().next().unwrap_or_default().trim()
}

/// Runs a command to completion, killing it if `timeout` elapses.
pub async fn run<I, S>(program: &str, args: I, timeout: Duration) -> anyhow::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    output_with_timeout(cmd, program, timeout).await
}

/// Where and as whom shell snippets run.
#[derive(Debug, Clone)]
pub struct ScriptEnv {
    /// `None` runs through `bash -lc` as the server's own user.
    pub run_as: Option<String>,
    /// Searched before the user toolchain directories.
    pub extra_path: Vec<PathBuf>,
    pub timeout: Duration,
}

impl ScriptEnv {
    pub fn new(timeout: Duration) -> Self {
        Self {
            run_as: None,
            extra_path: Vec::new(),
            timeout,
        }
    }

    fn path_export(&self) -> String {
        let mut export = String::from("export PATH=");
        for dir in &self.extra_path {
            export.push_str(&quote(&dir.display().to_string()));
            export.push(':');
        }
        export.push_str(USER_PATH_DIRS);
        export.push_str("; ");
        export
    }

    /// Runs a snippet, through `sudo -u <user> -i` when a user is set.
    pub async fn run(&self, script: &str) -> anyhow::Result<CommandOutput> {
        let full = format!("{}{script}", self.path_export());
        let mut cmd = match self.run_as.as_deref() {
            Some(user) => {
                let mut c = Command::new("sudo");
                c.args(["-u", user, "-i", "bash", "-c", full.as_str()]);
                c
            }
            None => {
                let mut c = Command::new("bash");
                c.args(["-lc", full.as_str()]);
                c
            }
        };
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);
        output_with_timeout(cmd, script, self.timeout).await
    }

    /// Like `run`, but a non-zero exit is an error carrying the output.
    pub async fn run_checked(&self, script: &str) -> anyhow::Result<CommandOutput> {
        let out = self.run(script).await?;
        if !out.success() {
            let detail = first_line(out.combined());
            match out.code {
                Some(code) => anyhow::bail!("command failed with code {code}: {script}: {detail}"),
                None => anyhow::bail!("command terminated by signal: {script}"),
            }
        }
        Ok(out)
    }
}

/// Single-quotes `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn output_with_timeout(
    mut cmd: Command,
    what: &str,
    timeout: Duration,
) -> anyhow::Result<CommandOutput> {
    let out = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {}ms: {what}", timeout.as_millis()))?
        .with_context(|| format!("spawn `{what}`"))?;
    Ok(CommandOutput {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}
