// Session protocol - launch descriptor and the event records written to durable streams
// All records are JSON; one record per appended line

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::SpawnError;

/// Well-known key of the stream shared by all sessions.
pub const REGISTRY_STREAM_KEY: &str = "__registry__";

/// Prefix for the argv entry carrying the serialized [`SpawnConfig`].
pub const CONFIG_ARG_PREFIX: &str = "--config=";

/// Stream key holding the events of one session.
pub fn session_stream_key(session_id: &str) -> String {
    format!("sessions/{}", session_id)
}

/// Supported agent backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Codex,
}

impl AgentType {
    /// Name of the CLI executable for this backend
    pub fn program(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentType::Claude),
            "codex" => Ok(AgentType::Codex),
            _ => Err(format!("Unknown agent type: {}", s)),
        }
    }
}

/// Lifecycle status of an agent session as observed by watchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Working,
    WaitingApproval,
    WaitingInput,
    /// Alive but not doing anything observable
    Idle,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// States in which the agent is expected to produce changes soon.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending
                | SessionStatus::Running
                | SessionStatus::Working
                | SessionStatus::WaitingApproval
                | SessionStatus::WaitingInput
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Working => "working",
            SessionStatus::WaitingApproval => "waiting_approval",
            SessionStatus::WaitingInput => "waiting_input",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "working" => Ok(SessionStatus::Working),
            "waiting_approval" => Ok(SessionStatus::WaitingApproval),
            "waiting_input" => Ok(SessionStatus::WaitingInput),
            "idle" => Ok(SessionStatus::Idle),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

// ============================================================================
// Launch descriptor
// ============================================================================

/// Immutable launch descriptor for one agent run.
///
/// Serialized as JSON into the daemon's single `--config=<json>` argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    /// Globally unique session identifier
    pub session_id: String,
    pub agent_type: AgentType,
    pub prompt: String,
    /// Absolute path the daemon (and the agent CLI) runs in
    pub working_dir: PathBuf,
    #[serde(default)]
    pub resume: bool,
    /// Agent-native session id to resume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-launch random value distinguishing retried launches of one session
    pub nonce: String,
    /// Base URL of the durable stream server
    pub stream_url: String,
}

impl SpawnConfig {
    pub fn new(
        session_id: impl Into<String>,
        agent_type: AgentType,
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_type,
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            resume: false,
            resume_session_id: None,
            task_path: None,
            model: None,
            nonce: uuid::Uuid::new_v4().to_string(),
            stream_url: stream_url.into(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_task_path(mut self, task_path: impl Into<PathBuf>) -> Self {
        self.task_path = Some(task_path.into());
        self
    }

    /// Resume a prior agent-native session
    pub fn with_resume(mut self, cli_session_id: impl Into<String>) -> Self {
        self.resume = true;
        self.resume_session_id = Some(cli_session_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), SpawnError> {
        if self.session_id.trim().is_empty() {
            return Err(SpawnError::InvalidConfig("session id is empty".into()));
        }
        if self.session_id == "." || self.session_id == ".." {
            return Err(SpawnError::InvalidConfig(format!(
                "session id {:?} is not addressable as a stream",
                self.session_id
            )));
        }
        if !self.working_dir.is_absolute() {
            return Err(SpawnError::InvalidConfig(format!(
                "working directory must be absolute: {}",
                self.working_dir.display()
            )));
        }
        if self.resume && self.resume_session_id.is_none() {
            return Err(SpawnError::InvalidConfig(
                "resume requested without a prior session id".into(),
            ));
        }
        Ok(())
    }

    /// Render the daemon argument (`--config=<json>`)
    pub fn to_arg(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{}{}", CONFIG_ARG_PREFIX, serde_json::to_string(self)?))
    }

    /// Find and parse the `--config=<json>` argument
    pub fn from_args<I, S>(args: I) -> Result<Self, SpawnError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let json = args
            .into_iter()
            .find_map(|arg| {
                arg.as_ref()
                    .strip_prefix(CONFIG_ARG_PREFIX)
                    .map(str::to_string)
            })
            .ok_or_else(|| SpawnError::InvalidConfig("missing --config=<json> argument".into()))?;

        let config: SpawnConfig = serde_json::from_str(&json)
            .map_err(|e| SpawnError::InvalidConfig(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Registry stream records
// ============================================================================

/// Token accounting reported by the agent on completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Lifecycle record on the shared registry stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RegistryEvent {
    SessionCreated {
        session_id: String,
        timestamp: DateTime<Utc>,
        agent_type: AgentType,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        working_dir: PathBuf,
    },
    SessionCompleted {
        session_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    SessionFailed {
        session_id: String,
        timestamp: DateTime<Utc>,
        error: String,
    },
    SessionCancelled {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl RegistryEvent {
    pub fn session_id(&self) -> &str {
        match self {
            RegistryEvent::SessionCreated { session_id, .. }
            | RegistryEvent::SessionCompleted { session_id, .. }
            | RegistryEvent::SessionFailed { session_id, .. }
            | RegistryEvent::SessionCancelled { session_id, .. } => session_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RegistryEvent::SessionCreated { timestamp, .. }
            | RegistryEvent::SessionCompleted { timestamp, .. }
            | RegistryEvent::SessionFailed { timestamp, .. }
            | RegistryEvent::SessionCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Status a session is in after this record
    pub fn status(&self) -> SessionStatus {
        match self {
            RegistryEvent::SessionCreated { .. } => SessionStatus::Pending,
            RegistryEvent::SessionCompleted { .. } => SessionStatus::Completed,
            RegistryEvent::SessionFailed { .. } => SessionStatus::Failed,
            RegistryEvent::SessionCancelled { .. } => SessionStatus::Cancelled,
        }
    }
}

// ============================================================================
// Session stream records
// ============================================================================

/// Origin of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    /// Emitted by the daemon itself rather than the agent CLI
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl OutputChunk {
    pub fn new(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: None,
        }
    }
}

/// Record on a per-session stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionStreamEvent {
    Output {
        timestamp: DateTime<Utc>,
        chunk: OutputChunk,
    },
    /// Native CLI session id, remembered for later resumption
    CliSessionId {
        timestamp: DateTime<Utc>,
        cli_session_id: String,
    },
    StatusChanged {
        timestamp: DateTime<Utc>,
        status: SessionStatus,
    },
}

impl SessionStreamEvent {
    pub fn output(chunk: OutputChunk) -> Self {
        SessionStreamEvent::Output {
            timestamp: Utc::now(),
            chunk,
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        SessionStreamEvent::StatusChanged {
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionStreamEvent::Output { timestamp, .. }
            | SessionStreamEvent::CliSessionId { timestamp, .. }
            | SessionStreamEvent::StatusChanged { timestamp, .. } => *timestamp,
        }
    }
}

// ============================================================================
// Record encoding
// ============================================================================

/// Serialize a record to the single-line JSON form appended to a stream
pub fn encode_record<T: Serialize>(record: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(record)
}

/// Parse a record read back from a stream (tolerates a trailing newline)
pub fn decode_record<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end_matches('\n'))
}
