use std::path::PathBuf;
use std::sync::Arc;

use protocol::{
    ErrorKind, ExecutionMode, ExecutionResult, Operation, OperationRequest, OutputFormat,
    ToolError, ToolResponse,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::builder::{catalog, CommandBuilder, TimeoutPolicy};
use crate::error::{EngineError, Result};
use crate::jobs::{JobLimits, JobRegistry};
use crate::runner::capture::last_lines;
use crate::runner::{ProcessRunner, RunnerLimits};
use crate::sysinfo::{HostInfo, SystemInfoProvider};

pub const JOB_STATUS: &str = "job_status";
pub const JOB_TAIL: &str = "job_tail";
pub const JOB_CANCEL: &str = "job_cancel";
pub const JOB_CLEANUP: &str = "job_cleanup";
pub const LIST_JOBS: &str = "list_jobs";
pub const SYSTEM_INFO: &str = "system_info";

pub const ARG_OUTPUT_FORMAT: &str = "output_format";
pub const ARG_MODE: &str = "mode";
pub const ARG_TIMEOUT_MS: &str = "timeout_ms";

pub(crate) const DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub program: PathBuf,
    pub build_env: Option<String>,
    pub timeouts: TimeoutPolicy,
    pub runner: RunnerLimits,
    pub jobs: JobLimits,
    pub record_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            build_env: None,
            timeouts: TimeoutPolicy::default(),
            runner: RunnerLimits::default(),
            jobs: JobLimits::default(),
            record_dir: None,
        }
    }
}

/// Single entry point for tool invocations. Every outcome, including
/// failures, comes back as a [`ToolResponse`].
#[derive(Clone)]
pub struct Engine {
    builder: CommandBuilder,
    runner: ProcessRunner,
    registry: JobRegistry,
    sysinfo: Arc<dyn SystemInfoProvider>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let builder = CommandBuilder::new(config.program, config.build_env, config.timeouts)?;
        let runner = ProcessRunner::new(config.runner);
        let registry = JobRegistry::new(runner.clone(), config.jobs, config.record_dir);
        Ok(Self {
            builder,
            runner,
            registry,
            sysinfo: Arc::new(HostInfo),
        })
    }

    pub fn with_system_info(mut self, provider: Arc<dyn SystemInfoProvider>) -> Self {
        self.sysinfo = provider;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn program(&self) -> &PathBuf {
        self.builder.program()
    }

    pub async fn invoke(&self, tool: &str, args: Map<String, Value>) -> ToolResponse {
        let response = match tool {
            JOB_STATUS | JOB_TAIL | JOB_CANCEL | JOB_CLEANUP | LIST_JOBS | SYSTEM_INFO => {
                self.job_tool(tool, args)
            }
            _ => match Operation::from_name(tool) {
                Some(operation) => match operation_request(operation, args) {
                    Ok(request) => return self.execute(request).await,
                    Err(err) => Err(err),
                },
                None => Err(EngineError::UnsupportedOperation(format!("unknown tool `{tool}`"))),
            },
        };
        response.unwrap_or_else(error_response)
    }

    /// Foreground requests block until the process is done; background ones
    /// return a job handle right after spawning.
    pub async fn execute(&self, request: OperationRequest) -> ToolResponse {
        let descriptor = match self.builder.build(&request) {
            Ok(descriptor) => descriptor,
            Err(err) => return error_response(err),
        };
        let spec = catalog::spec_for(request.operation);
        match request.mode.unwrap_or(spec.default_mode) {
            ExecutionMode::Foreground => match self.runner.run(&descriptor).await {
                Ok(result) => result_response(request.operation, result),
                Err(err) => error_response(err),
            },
            ExecutionMode::Background => match self.registry.submit(descriptor) {
                Ok(job) => ToolResponse::Job { job },
                Err(err) => error_response(err),
            },
        }
    }

    fn job_tool(&self, tool: &str, args: Map<String, Value>) -> Result<ToolResponse> {
        let response = match JobCommand::parse(tool, args)? {
            JobCommand::Status(id) => ToolResponse::Status {
                job: self.registry.status(&id)?,
            },
            JobCommand::Tail { id, since } => ToolResponse::Tail {
                chunk: self.registry.tail(&id, since)?,
            },
            JobCommand::TailLines { id, lines } => ToolResponse::Tail {
                chunk: self.registry.tail_lines(&id, lines)?,
            },
            JobCommand::Cancel(id) => {
                let (outcome, state) = self.registry.cancel(&id)?;
                ToolResponse::Cancel {
                    job_id: id,
                    outcome,
                    state,
                }
            }
            JobCommand::Cleanup(id) => {
                self.registry.cleanup(&id)?;
                ToolResponse::Cleanup { job_id: id }
            }
            JobCommand::List => ToolResponse::Jobs {
                jobs: self.registry.list(),
            },
            JobCommand::SystemInfo => ToolResponse::SystemInfo {
                info: self.sysinfo.system_info(),
            },
        };
        Ok(response)
    }
}

enum JobCommand {
    Status(String),
    Tail { id: String, since: u64 },
    TailLines { id: String, lines: usize },
    Cancel(String),
    Cleanup(String),
    List,
    SystemInfo,
}

impl JobCommand {
    fn parse(tool: &str, mut args: Map<String, Value>) -> Result<Self> {
        let command = match tool {
            JOB_STATUS => JobCommand::Status(take_job_id(&mut args)?),
            JOB_TAIL => {
                let id = take_job_id(&mut args)?;
                let since: Option<u64> = take_arg(&mut args, "since_offset")?;
                let lines: Option<usize> = take_arg(&mut args, "lines")?;
                match (since, lines) {
                    (Some(_), Some(_)) => {
                        return Err(EngineError::invalid(
                            "`since_offset` and `lines` cannot be combined",
                        ))
                    }
                    (_, Some(lines)) => JobCommand::TailLines { id, lines },
                    (since, None) => JobCommand::Tail {
                        id,
                        since: since.unwrap_or(0),
                    },
                }
            }
            JOB_CANCEL => JobCommand::Cancel(take_job_id(&mut args)?),
            JOB_CLEANUP => JobCommand::Cleanup(take_job_id(&mut args)?),
            LIST_JOBS => JobCommand::List,
            SYSTEM_INFO => JobCommand::SystemInfo,
            _ => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "unknown tool `{tool}`"
                )))
            }
        };
        if let Some(name) = args.keys().next() {
            return Err(EngineError::invalid(format!(
                "unknown parameter `{name}` for {tool}"
            )));
        }
        Ok(command)
    }
}

/// Splits the reserved arguments off an operation tool call.
pub fn operation_request(operation: Operation, mut args: Map<String, Value>) -> Result<OperationRequest> {
    let format: Option<OutputFormat> = take_arg(&mut args, ARG_OUTPUT_FORMAT)?;
    let mode: Option<ExecutionMode> = take_arg(&mut args, ARG_MODE)?;
    let timeout_ms: Option<u64> = take_arg(&mut args, ARG_TIMEOUT_MS)?;
    Ok(OperationRequest {
        operation,
        params: args,
        format: format.unwrap_or_default(),
        mode,
        timeout_ms,
    })
}

fn take_arg<T: DeserializeOwned>(args: &mut Map<String, Value>, name: &str) -> Result<Option<T>> {
    match args.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| EngineError::invalid(format!("`{name}`: {err}"))),
    }
}

fn take_job_id(args: &mut Map<String, Value>) -> Result<String> {
    let id: Option<String> = take_arg(args, "job_id")?;
    id.filter(|id| !id.trim().is_empty())
        .ok_or_else(|| EngineError::invalid("missing required parameter `job_id`"))
}

fn result_response(operation: Operation, result: ExecutionResult) -> ToolResponse {
    let source = if result.stderr.trim().is_empty() {
        &result.stdout
    } else {
        &result.stderr
    };
    let tail = last_lines(source, DIAGNOSTIC_LINES);
    let error = failure_error(operation, &result, (!tail.trim().is_empty()).then_some(tail));
    if let Some(error) = &error {
        tracing::warn!(
            operation = %operation,
            kind = %error.kind,
            exit_code = ?error.exit_code,
            "operation failed"
        );
    }
    ToolResponse::Result {
        operation,
        result,
        error,
    }
}

/// Error report for a finished process, `None` when it did not fail.
pub(crate) fn failure_error(
    operation: Operation,
    result: &ExecutionResult,
    stderr_tail: Option<String>,
) -> Option<ToolError> {
    let kind = result.failure()?;
    let message = result.error.clone().unwrap_or_else(|| match result.exit_code {
        Some(code) => format!("{operation} exited with code {code}"),
        None => format!("{operation} failed"),
    });
    Some(ToolError {
        kind,
        message,
        exit_code: result.exit_code,
        stderr_tail,
    })
}

fn error_response(err: EngineError) -> ToolResponse {
    let kind = err.kind();
    if kind == ErrorKind::InternalError {
        tracing::error!(error = %err, "engine error");
    } else {
        tracing::debug!(error = %err, "request rejected");
    }
    ToolResponse::Error { error: err.into() }
}
