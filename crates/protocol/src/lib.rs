use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub mod config;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Install,
    Remove,
    Update,
    List,
    Search,
    Info,
    Export,
    EnvList,
    EnvCreate,
    EnvUpdate,
    EnvRemove,
    Clean,
    Compare,
    Run,
    Help,
    Build,
}

impl Operation {
    pub const ALL: [Operation; 17] = [
        Operation::Create,
        Operation::Install,
        Operation::Remove,
        Operation::Update,
        Operation::List,
        Operation::Search,
        Operation::Info,
        Operation::Export,
        Operation::EnvList,
        Operation::EnvCreate,
        Operation::EnvUpdate,
        Operation::EnvRemove,
        Operation::Clean,
        Operation::Compare,
        Operation::Run,
        Operation::Help,
        Operation::Build,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Install => "install",
            Operation::Remove => "remove",
            Operation::Update => "update",
            Operation::List => "list",
            Operation::Search => "search",
            Operation::Info => "info",
            Operation::Export => "export",
            Operation::EnvList => "env_list",
            Operation::EnvCreate => "env_create",
            Operation::EnvUpdate => "env_update",
            Operation::EnvRemove => "env_remove",
            Operation::Clean => "clean",
            Operation::Compare => "compare",
            Operation::Run => "run",
            Operation::Help => "help",
            Operation::Build => "build",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Structured,
    #[default]
    Plain,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Foreground,
    Background,
}

/// A validated-on-build request for one package-manager operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation: Operation,
    pub params: Map<String, Value>,
    pub format: OutputFormat,
    pub mode: Option<ExecutionMode>,
    pub timeout_ms: Option<u64>,
}

impl OperationRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            params: Map::new(),
            format: OutputFormat::Plain,
            mode: None,
            timeout_ms: None,
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn structured(mut self) -> Self {
        self.format = OutputFormat::Structured;
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    UnsupportedOperation,
    ExecutableNotFound,
    Timeout,
    ProcessFailed,
    PartialOutput,
    NotFound,
    AlreadyTerminal,
    StillRunning,
    ResourceExhausted,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::ExecutableNotFound => "executable_not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProcessFailed => "process_failed",
            ErrorKind::PartialOutput => "partial_output",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::StillRunning => "still_running",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            stderr_tail: None,
        }
    }
}

/// Normalized stdout. Consumers must handle every variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Structured(Value),
    Plain(String),
    PartialOutput(String),
}

impl Payload {
    pub fn is_partial(&self) -> bool {
        matches!(self, Payload::PartialOutput(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
    Aborted,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Exited => "exited",
            Termination::TimedOut => "timed_out",
            Termination::Cancelled => "cancelled",
            Termination::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub command: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub termination: Termination,
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Raw stdout; its normalized form travels in `payload`.
    #[serde(skip_serializing, default)]
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn partial_output(&self) -> bool {
        self.payload.is_partial()
    }

    /// Hard failure kind, if any. `PartialOutput` is never a failure.
    pub fn failure(&self) -> Option<ErrorKind> {
        match self.termination {
            Termination::TimedOut => Some(ErrorKind::Timeout),
            Termination::Aborted => Some(ErrorKind::InternalError),
            Termination::Cancelled => None,
            Termination::Exited if self.success => None,
            Termination::Exited => Some(ErrorKind::ProcessFailed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TailChunk {
    pub job_id: String,
    pub state: JobState,
    pub start: u64,
    pub offset: u64,
    #[serde(default)]
    pub dropped: u64,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub job_id: String,
    pub operation: String,
    pub state: JobState,
    pub started_at: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job_id: String,
    pub operation: String,
    pub command: Vec<String>,
    pub state: JobState,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub elapsed_ms: u64,
    pub output_offset: u64,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Requested,
    AlreadyTerminal,
}

impl CancelOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelOutcome::Requested => "requested",
            CancelOutcome::AlreadyTerminal => "already_terminal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    pub cpus: usize,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub total_memory_bytes: Option<u64>,
}

/// Everything the façade can hand back for one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResponse {
    Result {
        operation: Operation,
        result: ExecutionResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolError>,
    },
    Job {
        job: JobSummary,
    },
    Status {
        job: JobStatus,
    },
    Tail {
        chunk: TailChunk,
    },
    Cancel {
        job_id: String,
        outcome: CancelOutcome,
        state: JobState,
    },
    Cleanup {
        job_id: String,
    },
    Jobs {
        jobs: Vec<JobSummary>,
    },
    SystemInfo {
        info: SystemInfo,
    },
    Error {
        error: ToolError,
    },
}

impl ToolResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ToolResponse::Error {
            error: ToolError::new(kind, message),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            ToolResponse::Error { .. } => true,
            ToolResponse::Result { error, .. } => error.is_some(),
            _ => false,
        }
    }
}
