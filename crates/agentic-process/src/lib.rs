use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};

/// Maximum number of historical runs kept in the dashboard document.
pub const MAX_RUNS: usize = 20;

/// Default trailing window (in chars) kept for tool output.
pub const DEFAULT_OUTPUT_TAIL_CHARS: usize = 1000;

/// Stable key of one of the supervised tools.
///
/// The serialized form doubles as the key in `DashboardState::tools`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKey {
    AutoClaude,
    ContinuousClaude,
    Automaker,
    Acfs,
}

impl ToolKey {
    pub const ALL: [ToolKey; 4] = [
        ToolKey::AutoClaude,
        ToolKey::ContinuousClaude,
        ToolKey::Automaker,
        ToolKey::Acfs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKey::AutoClaude => "auto-claude",
            ToolKey::ContinuousClaude => "continuous-claude",
            ToolKey::Automaker => "automaker",
            ToolKey::Acfs => "acfs",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKey::AutoClaude => "Auto-Claude",
            ToolKey::ContinuousClaude => "Continuous Claude",
            ToolKey::Automaker => "Automaker",
            ToolKey::Acfs => "ACFS",
        }
    }
}

impl fmt::Display for ToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToolKey(pub String);

impl fmt::Display for UnknownToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tool key: {}", self.0)
    }
}

impl std::error::Error for UnknownToolKey {}

impl FromStr for ToolKey {
    type Err = UnknownToolKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownToolKey(s.to_string()))
    }
}

/// Last known status of a tool. Any writer may set any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Idle,
    Running,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolState {
    pub name: String,
    pub status: ToolStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ToolState {
    pub fn idle(key: ToolKey) -> Self {
        Self {
            name: key.display_name().to_string(),
            status: ToolStatus::Idle,
            output: String::new(),
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Historical record of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Run {
    pub id: String,
    pub tool: String,
    pub prompt: String,
    pub status: RunStatus,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(default)]
    pub output: String,
}

/// Root document persisted by the state store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DashboardState {
    #[serde(default)]
    pub tools: BTreeMap<String, ToolState>,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl Default for DashboardState {
    fn default() -> Self {
        let tools = ToolKey::ALL
            .into_iter()
            .map(|k| (k.as_str().to_string(), ToolState::idle(k)))
            .collect();
        Self {
            tools,
            runs: Vec::new(),
        }
    }
}

impl DashboardState {
    pub fn tool(&self, key: ToolKey) -> Option<&ToolState> {
        self.tools.get(key.as_str())
    }

    /// Replaces (does not merge) the tool entry.
    pub fn set_tool(
        &mut self,
        key: ToolKey,
        status: ToolStatus,
        output: impl Into<String>,
        pid: Option<u32>,
    ) {
        self.tools.insert(
            key.as_str().to_string(),
            ToolState {
                name: key.display_name().to_string(),
                status,
                output: output.into(),
                pid,
            },
        );
    }

    /// Inserts a run at the head and drops everything past `MAX_RUNS`.
    /// Returns the id of the new run.
    pub fn prepend_run(
        &mut self,
        tool: &str,
        prompt: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> String {
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        // Ids must stay unique even when two runs land in the same millisecond.
        let id = match self.runs.first().and_then(|r| r.id.parse::<u64>().ok()) {
            Some(head) if head >= now_ms => head.saturating_add(1),
            _ => now_ms,
        }
        .to_string();

        self.runs.insert(
            0,
            Run {
                id: id.clone(),
                tool: tool.to_string(),
                prompt: prompt.to_string(),
                status,
                started_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
                output: String::new(),
            },
        );
        self.runs.truncate(MAX_RUNS);
        id
    }

    /// Records the final outcome of a run. Returns false if it already aged out.
    pub fn finish_run(&mut self, id: &str, status: RunStatus, output: impl Into<String>) -> bool {
        let Some(run) = self.runs.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        run.status = status;
        run.output = output.into();
        true
    }
}

/// Returns the trailing `max_chars` characters of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Bounded accumulator that keeps only the most recent output.
#[derive(Debug, Clone)]
pub struct OutputTail {
    max_chars: usize,
    buf: String,
}

impl OutputTail {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            buf: String::new(),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.max_chars {
            let keep = tail_chars(&self.buf, self.max_chars);
            if keep.len() != self.buf.len() {
                self.buf = keep.to_string();
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
