pub mod capture;
mod process;
mod stream;

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{ExecutionResult, OutputFormat, Payload, Termination};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::builder::CommandDescriptor;
use crate::error::{EngineError, Result};
use crate::{locate, parser};

pub use capture::{LogChunk, OutputCapture, OutputSnapshot, Stream};
use process::{apply_process_group, leader_exit, reap_child, terminate_child};
use stream::pump_stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerLimits {
    pub grace: Duration,
    pub max_output_bytes: usize,
    /// How much stdout structured output may span and still be parsed.
    pub max_structured_bytes: usize,
    pub max_log_bytes: usize,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            max_output_bytes: 1024 * 1024,
            max_structured_bytes: 64 * 1024 * 1024,
            max_log_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    limits: RunnerLimits,
}

/// Live view of a running process. Cloning shares the same process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    output: Arc<OutputCapture>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output(&self) -> &Arc<OutputCapture> {
        &self.output
    }

    /// Best-effort: SIGTERM now, SIGKILL after the grace period.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Resolves to the final result once the process has been reaped.
#[derive(Debug)]
pub struct Completion {
    task: JoinHandle<ExecutionResult>,
    command: Vec<String>,
    pid: Option<u32>,
    output: Arc<OutputCapture>,
    started: Instant,
}

impl Completion {
    pub async fn wait(self) -> ExecutionResult {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "process supervisor aborted");
                self.output.freeze();
                finish(
                    self.command,
                    self.pid,
                    &self.output,
                    OutputFormat::Plain,
                    Termination::Aborted,
                    None,
                    self.started,
                    Some(format!("supervisor aborted: {err}")),
                )
            }
        }
    }
}

#[derive(Debug)]
pub struct RunningProcess {
    handle: ProcessHandle,
    completion: Completion,
}

impl RunningProcess {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (ProcessHandle, Completion) {
        (self.handle, self.completion)
    }

    pub async fn wait(self) -> ExecutionResult {
        self.completion.wait().await
    }
}

impl ProcessRunner {
    pub fn new(limits: RunnerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> RunnerLimits {
        self.limits
    }

    /// Foreground run: blocks the calling task until exit, timeout or kill.
    pub async fn run(&self, desc: &CommandDescriptor) -> Result<ExecutionResult> {
        Ok(self.spawn(desc)?.wait().await)
    }

    /// Starts the process and a supervising task, returning immediately.
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, desc: &CommandDescriptor) -> Result<RunningProcess> {
        let program = locate::resolve_program(&desc.program)
            .ok_or_else(|| EngineError::ExecutableNotFound(desc.program.display().to_string()))?;

        let mut cmd = Command::new(&program);
        cmd.args(&desc.args);
        if let Some(cwd) = &desc.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&desc.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        apply_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                EngineError::ExecutableNotFound(program.display().to_string())
            }
            _ => EngineError::Io(err),
        })?;
        let started = Instant::now();
        let pid = child.id();
        let output = Arc::new(match desc.format {
            OutputFormat::Structured => OutputCapture::with_parse_limit(
                self.limits.max_output_bytes,
                self.limits.max_structured_bytes,
                self.limits.max_log_bytes,
            ),
            OutputFormat::Plain => {
                OutputCapture::new(self.limits.max_output_bytes, self.limits.max_log_bytes)
            }
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Internal("missing stderr pipe".to_string()))?;
        let readers = vec![
            tokio::spawn(pump_stream(stdout, Stream::Stdout, Arc::clone(&output))),
            tokio::spawn(pump_stream(stderr, Stream::Stderr, Arc::clone(&output))),
        ];

        let command = desc.argv();
        tracing::debug!(
            pid = ?pid,
            operation = %desc.operation,
            timeout = %humantime::format_duration(desc.timeout),
            "spawned process"
        );

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            child,
            readers,
            command: command.clone(),
            pid,
            output: Arc::clone(&output),
            cancel: cancel.clone(),
            timeout: desc.timeout,
            grace: self.limits.grace,
            format: desc.format,
            started,
        };
        let task = tokio::spawn(supervisor.run());

        Ok(RunningProcess {
            handle: ProcessHandle {
                pid,
                output: Arc::clone(&output),
                cancel,
            },
            completion: Completion {
                task,
                command,
                pid,
                output,
                started,
            },
        })
    }
}

struct Supervisor {
    child: Child,
    readers: Vec<JoinHandle<io::Result<u64>>>,
    command: Vec<String>,
    pid: Option<u32>,
    output: Arc<OutputCapture>,
    cancel: CancellationToken,
    timeout: Duration,
    grace: Duration,
    format: OutputFormat,
    started: Instant,
}

impl Supervisor {
    async fn run(mut self) -> ExecutionResult {
        let mut error = None;
        let termination = tokio::select! {
            exited = leader_exit(&mut self.child) => match exited {
                Ok(()) => Termination::Exited,
                Err(err) => {
                    error = Some(format!("wait failed: {err}"));
                    terminate_child(&mut self.child, self.grace).await;
                    Termination::Aborted
                }
            },
            _ = self.cancel.cancelled() => {
                terminate_child(&mut self.child, self.grace).await;
                Termination::Cancelled
            }
            _ = tokio::time::sleep(self.timeout) => {
                error = Some(format!(
                    "timed out after {}",
                    humantime::format_duration(self.timeout)
                ));
                terminate_child(&mut self.child, self.grace).await;
                Termination::TimedOut
            }
        };
        let status = reap_child(&mut self.child, self.grace).await;

        let deadline = tokio::time::Instant::now() + self.grace;
        for mut reader in self.readers {
            match tokio::time::timeout_at(deadline, &mut reader).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => tracing::warn!(error = %err, "output stream read failed"),
                Ok(Err(err)) => tracing::warn!(error = %err, "output reader join failed"),
                Err(_) => {
                    tracing::debug!(pid = ?self.pid, "output reader still open after exit, dropping");
                    reader.abort();
                }
            }
        }
        self.output.freeze();

        let result = finish(
            self.command,
            self.pid,
            &self.output,
            self.format,
            termination,
            status,
            self.started,
            error,
        );
        tracing::debug!(
            pid = ?self.pid,
            termination = ?result.termination,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "process finished"
        );
        result
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    command: Vec<String>,
    pid: Option<u32>,
    output: &OutputCapture,
    format: OutputFormat,
    termination: Termination,
    status: Option<ExitStatus>,
    started: Instant,
    error: Option<String>,
) -> ExecutionResult {
    let snapshot = output.snapshot();
    let stdout = String::from_utf8_lossy(&snapshot.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&snapshot.stderr).into_owned();
    let payload = match format {
        OutputFormat::Structured => {
            let (source, _) = output.parse_source();
            match parser::parse_output(&String::from_utf8_lossy(&source), format) {
                Payload::PartialOutput(_) => Payload::PartialOutput(stdout.clone()),
                parsed => parsed,
            }
        }
        OutputFormat::Plain => parser::parse_output(&stdout, format),
    };
    let success = termination == Termination::Exited && status.is_some_and(|s| s.success());
    let error = error.or_else(|| status.and_then(describe_signal));
    ExecutionResult {
        command,
        pid,
        termination,
        success,
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        stdout_truncated: snapshot.stdout_truncated,
        stderr_truncated: snapshot.stderr_truncated,
        duration_ms: started.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
        payload,
        error,
    }
}

#[cfg(unix)]
fn describe_signal(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|signal| format!("terminated by signal {signal}"))
}

#[cfg(not(unix))]
fn describe_signal(_status: ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{block_on, process_alive};
    use protocol::Operation;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn sh(script: &str, timeout: Duration) -> CommandDescriptor {
        CommandDescriptor {
            operation: Operation::Run,
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            env: BTreeMap::new(),
            timeout,
            format: OutputFormat::Plain,
        }
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(RunnerLimits {
            grace: Duration::from_millis(500),
            ..RunnerLimits::default()
        })
    }

    #[test]
    fn captures_streams_separately() {
        let result = block_on(runner().run(&sh(
            "echo out; echo err 1>&2; exit 3",
            Duration::from_secs(10),
        )))
        .expect("run");
        assert_eq!(result.termination, Termination::Exited);
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.payload, Payload::Plain("out\n".to_string()));
        assert_eq!(result.command[0], "/bin/sh");
    }

    #[test]
    fn timeout_kills_process_and_keeps_output() {
        let started = Instant::now();
        let result = block_on(runner().run(&sh("echo before; sleep 5", Duration::from_secs(1))))
            .expect("run");
        let elapsed = started.elapsed();
        assert_eq!(result.termination, Termination::TimedOut);
        assert!(!result.success);
        assert_eq!(result.stdout, "before\n");
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        let pid = result.pid.expect("pid");
        assert!(!process_alive(pid));
        assert_eq!(result.failure(), Some(protocol::ErrorKind::Timeout));
    }

    #[test]
    fn timeout_reaches_grandchildren() {
        let result = block_on(runner().run(&sh(
            "sleep 30 & echo $!; wait",
            Duration::from_millis(500),
        )))
        .expect("run");
        assert_eq!(result.termination, Termination::TimedOut);
        let grandchild: u32 = result.stdout.trim().parse().expect("grandchild pid");
        std::thread::sleep(Duration::from_millis(100));
        assert!(!process_alive(grandchild));
    }

    #[test]
    fn structured_output_larger_than_the_stdout_cap_still_parses() {
        let mut desc = sh(
            "printf '['; yes '\"0123456789012345678901234567890123456789012345678901234567890123456789\",' | head -n 20000; printf '0]'",
            Duration::from_secs(20),
        );
        desc.format = OutputFormat::Structured;
        let limits = RunnerLimits::default();
        let result = block_on(runner().run(&desc)).expect("run");
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.len(), limits.max_output_bytes);
        assert!(result.stdout_truncated);
        match &result.payload {
            Payload::Structured(value) => {
                assert_eq!(value.as_array().map(Vec::len), Some(20001));
            }
            other => panic!("expected structured payload, got {other:?}"),
        }
    }

    #[test]
    fn structured_output_past_the_parse_limit_is_partial() {
        let mut desc = sh("printf '[\"%s\"]' 0123456789abcdef", Duration::from_secs(5));
        desc.format = OutputFormat::Structured;
        let runner = ProcessRunner::new(RunnerLimits {
            grace: Duration::from_millis(500),
            max_output_bytes: 4,
            max_structured_bytes: 8,
            ..RunnerLimits::default()
        });
        let result = block_on(runner.run(&desc)).expect("run");
        assert!(result.success);
        assert_eq!(result.payload, Payload::PartialOutput("[\"01".to_string()));
    }

    #[test]
    fn missing_executable_fails_before_spawn() {
        let mut desc = sh("true", Duration::from_secs(1));
        desc.program = PathBuf::from("/no/such/conda");
        let err = block_on(runner().run(&desc)).expect_err("missing");
        assert_eq!(err.kind(), protocol::ErrorKind::ExecutableNotFound);
    }

    #[test]
    fn cancellation_terminates_running_process() {
        block_on(async {
            let running = runner()
                .spawn(&sh("echo started; sleep 30", Duration::from_secs(60)))
                .expect("spawn");
            let handle = running.handle().clone();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(handle.output().tail(0).data, "started\n");
            handle.cancel();
            let result = running.wait().await;
            assert_eq!(result.termination, Termination::Cancelled);
            assert!(handle.output().is_frozen());
            assert!(!process_alive(handle.pid().expect("pid")));
        });
    }

    #[test]
    fn env_and_cwd_are_applied() {
        let mut desc = sh("echo \"$GREETING\"; pwd", Duration::from_secs(5));
        desc.env.insert("GREETING".to_string(), "hello".to_string());
        desc.cwd = Some(PathBuf::from("/"));
        let result = block_on(runner().run(&desc)).expect("run");
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n/\n");
    }

    #[test]
    fn lingering_pipe_holder_does_not_block_completion() {
        let started = Instant::now();
        let result = block_on(runner().run(&sh(
            "(sleep 10) & echo parent done",
            Duration::from_secs(20),
        )))
        .expect("run");
        assert!(result.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
