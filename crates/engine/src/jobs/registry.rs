use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

use protocol::{CancelOutcome, ExecutionResult, JobState, JobSummary, Termination};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builder::CommandDescriptor;
use crate::error::{EngineError, Result};
use crate::record;
use crate::runner::{OutputCapture, ProcessHandle, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub max_running: usize,
    pub max_retained: usize,
    pub retention: Duration,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_running: 4,
            max_retained: 64,
            retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug)]
pub(super) struct JobRecord {
    pub(super) state: JobState,
    pub(super) result: Option<ExecutionResult>,
    handle: Option<ProcessHandle>,
    pub(super) cancel_requested: bool,
    pub(super) finished_at: Option<SystemTime>,
    finished: Option<Instant>,
}

#[derive(Debug)]
pub(super) struct JobSlot {
    pub(super) id: String,
    pub(super) descriptor: CommandDescriptor,
    pub(super) command: Vec<String>,
    pub(super) started_at: SystemTime,
    pub(super) started: Instant,
    pub(super) pid: Option<u32>,
    pub(super) output: Arc<OutputCapture>,
    record: Mutex<JobRecord>,
    done: CancellationToken,
}

impl JobSlot {
    /// Only the supervising task and `cancel` write through this lock.
    pub(super) fn record(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn state(&self) -> JobState {
        self.record().state
    }

    fn finished(&self) -> Option<Instant> {
        self.record().finished
    }

    pub(super) fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            operation: self.descriptor.operation.to_string(),
            state: self.state(),
            started_at: timestamp(self.started_at),
            pid: self.pid,
        }
    }
}

pub(super) fn timestamp(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at).to_string()
}

#[derive(Debug)]
struct Inner {
    jobs: RwLock<HashMap<String, Arc<JobSlot>>>,
    runner: ProcessRunner,
    limits: JobLimits,
    record_dir: Option<PathBuf>,
}

/// Process-wide table of background jobs. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    pub fn new(runner: ProcessRunner, limits: JobLimits, record_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                runner,
                limits,
                record_dir,
            }),
        }
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<JobSlot>>> {
        self.inner.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<JobSlot>>> {
        self.inner.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn slot(&self, id: &str) -> Result<Arc<JobSlot>> {
        self.read_jobs()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub(super) fn slots(&self) -> Vec<Arc<JobSlot>> {
        self.read_jobs().values().cloned().collect()
    }

    /// Starts `descriptor` as a background job. Returns once the process is
    /// spawned; a supervising task records the terminal state.
    pub fn submit(&self, descriptor: CommandDescriptor) -> Result<JobSummary> {
        self.evict_expired();

        let mut jobs = self.write_jobs();
        let running = jobs
            .values()
            .filter(|slot| slot.state() == JobState::Running)
            .count();
        if running >= self.inner.limits.max_running {
            return Err(EngineError::ResourceExhausted(format!(
                "{running} background jobs already running (limit {})",
                self.inner.limits.max_running
            )));
        }

        let process = self.inner.runner.spawn(&descriptor)?;
        let (handle, completion) = process.into_parts();
        let id = Uuid::new_v4().to_string();
        let slot = Arc::new(JobSlot {
            id: id.clone(),
            command: descriptor.argv(),
            descriptor,
            started_at: SystemTime::now(),
            started: Instant::now(),
            pid: handle.pid(),
            output: Arc::clone(handle.output()),
            record: Mutex::new(JobRecord {
                state: JobState::Running,
                result: None,
                handle: Some(handle),
                cancel_requested: false,
                finished_at: None,
                finished: None,
            }),
            done: CancellationToken::new(),
        });
        jobs.insert(id.clone(), Arc::clone(&slot));
        drop(jobs);

        tracing::info!(
            job_id = %id,
            operation = %slot.descriptor.operation,
            pid = ?slot.pid,
            "job started"
        );

        let registry = self.clone();
        let supervised = Arc::clone(&slot);
        tokio::spawn(async move {
            let result = completion.wait().await;
            registry.complete(&supervised, result).await;
        });

        Ok(slot.summary())
    }

    /// Terminal transition. Runs at most once per job.
    async fn complete(&self, slot: &JobSlot, result: ExecutionResult) {
        let state = {
            let mut record = slot.record();
            if record.state.is_terminal() {
                return;
            }
            let state = match result.termination {
                Termination::Cancelled => JobState::Cancelled,
                Termination::Exited if result.success => JobState::Succeeded,
                _ => JobState::Failed,
            };
            slot.output.freeze();
            record.state = state;
            record.result = Some(result.clone());
            record.handle = None;
            record.finished_at = Some(SystemTime::now());
            record.finished = Some(Instant::now());
            state
        };

        match state {
            JobState::Failed => tracing::warn!(
                job_id = %slot.id,
                operation = %slot.descriptor.operation,
                exit_code = ?result.exit_code,
                error = ?result.error,
                "job failed"
            ),
            _ => tracing::info!(
                job_id = %slot.id,
                operation = %slot.descriptor.operation,
                state = ?state,
                duration_ms = result.duration_ms,
                "job finished"
            ),
        }

        if let Some(dir) = &self.inner.record_dir {
            record::write_job_record(dir, &slot.id, slot.descriptor.operation, state, &result)
                .await;
        }
        slot.done.cancel();
    }

    /// Requests termination. Already-finished jobs are left untouched.
    pub fn cancel(&self, id: &str) -> Result<(CancelOutcome, JobState)> {
        let slot = self.slot(id)?;
        let mut record = slot.record();
        if record.state.is_terminal() {
            return Ok((CancelOutcome::AlreadyTerminal, record.state));
        }
        record.cancel_requested = true;
        if let Some(handle) = &record.handle {
            handle.cancel();
        }
        tracing::info!(job_id = %id, "job cancellation requested");
        Ok((CancelOutcome::Requested, record.state))
    }

    /// Forgets a finished job.
    pub fn cleanup(&self, id: &str) -> Result<()> {
        let mut jobs = self.write_jobs();
        let slot = jobs
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if slot.state() == JobState::Running {
            return Err(EngineError::StillRunning(id.to_string()));
        }
        jobs.remove(id);
        tracing::debug!(job_id = %id, "job cleaned up");
        Ok(())
    }

    /// Drops finished jobs past their retention and trims the oldest ones
    /// beyond `max_retained`. Running jobs are never evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let limits = self.inner.limits;
        let mut jobs = self.write_jobs();
        let before = jobs.len();
        jobs.retain(|_, slot| {
            slot.finished()
                .map_or(true, |at| now.duration_since(at) < limits.retention)
        });

        let mut finished: Vec<(Instant, String)> = jobs
            .iter()
            .filter_map(|(id, slot)| slot.finished().map(|at| (at, id.clone())))
            .collect();
        if finished.len() > limits.max_retained {
            finished.sort();
            let excess = finished.len() - limits.max_retained;
            for (_, id) in finished.into_iter().take(excess) {
                jobs.remove(&id);
            }
        }
        before - jobs.len()
    }

    pub fn spawn_reaper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted finished jobs");
                        }
                    }
                }
            }
        })
    }

    /// Cancels every running job and waits for them to be reaped.
    pub async fn shutdown(&self) {
        let running: Vec<Arc<JobSlot>> = self
            .slots()
            .into_iter()
            .filter(|slot| slot.state() == JobState::Running)
            .collect();
        if running.is_empty() {
            return;
        }
        tracing::info!(count = running.len(), "cancelling running jobs");
        for slot in &running {
            if let Some(handle) = &slot.record().handle {
                handle.cancel();
            }
        }
        let grace = self.inner.runner.limits().grace;
        let waits = running.iter().map(|slot| slot.done.cancelled());
        if tokio::time::timeout(grace * 3, futures_util::future::join_all(waits))
            .await
            .is_err()
        {
            tracing::warn!("some jobs did not stop before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerLimits;
    use crate::test_utils::{block_on, sh, temp_dir, test_registry};

    async fn wait_terminal(registry: &JobRegistry, id: &str) -> JobState {
        for _ in 0..200 {
            let state = registry.slot(id).expect("job").state();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {id} never finished");
    }

    #[test]
    fn background_job_runs_then_succeeds() {
        block_on(async {
            let registry = test_registry(JobLimits::default());
            let job = registry
                .submit(sh("sleep 2; echo built"))
                .expect("submit");
            assert_eq!(job.state, JobState::Running);
            assert_eq!(job.operation, "build");
            assert_eq!(registry.slot(&job.job_id).expect("job").state(), JobState::Running);

            tokio::time::sleep(Duration::from_millis(2500)).await;
            let slot = registry.slot(&job.job_id).expect("job");
            assert_eq!(slot.state(), JobState::Succeeded);
            let record = slot.record();
            let result = record.result.as_ref().expect("result");
            assert_eq!(result.stdout, "built\n");
            assert!(record.handle.is_none());
        });
    }

    #[test]
    fn failed_and_cancelled_states() {
        block_on(async {
            let registry = test_registry(JobLimits::default());
            let failing = registry.submit(sh("exit 4")).expect("submit");
            assert_eq!(wait_terminal(&registry, &failing.job_id).await, JobState::Failed);

            let slow = registry.submit(sh("sleep 30")).expect("submit");
            let (outcome, state) = registry.cancel(&slow.job_id).expect("cancel");
            assert_eq!(outcome, CancelOutcome::Requested);
            assert_eq!(state, JobState::Running);
            assert_eq!(wait_terminal(&registry, &slow.job_id).await, JobState::Cancelled);
            assert!(registry.slot(&slow.job_id).expect("job").record().cancel_requested);
        });
    }

    #[test]
    fn cancel_after_completion_is_already_terminal() {
        block_on(async {
            let registry = test_registry(JobLimits::default());
            let job = registry.submit(sh("echo done")).expect("submit");
            wait_terminal(&registry, &job.job_id).await;
            let before = registry.slot(&job.job_id).expect("job").record().result.clone();

            let (outcome, state) = registry.cancel(&job.job_id).expect("cancel");
            assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
            assert_eq!(state, JobState::Succeeded);
            let after = registry.slot(&job.job_id).expect("job").record().result.clone();
            assert_eq!(before, after);
        });
    }

    #[test]
    fn cleanup_rules() {
        block_on(async {
            let registry = test_registry(JobLimits::default());
            let err = registry.cleanup("no-such-job").expect_err("unknown");
            assert_eq!(err.kind(), protocol::ErrorKind::NotFound);

            let job = registry.submit(sh("sleep 30")).expect("submit");
            let err = registry.cleanup(&job.job_id).expect_err("running");
            assert_eq!(err.kind(), protocol::ErrorKind::StillRunning);
            assert!(registry.slot(&job.job_id).is_ok());

            registry.cancel(&job.job_id).expect("cancel");
            wait_terminal(&registry, &job.job_id).await;
            registry.cleanup(&job.job_id).expect("cleanup");
            assert!(registry.slot(&job.job_id).is_err());
        });
    }

    #[test]
    fn running_limit_is_enforced() {
        block_on(async {
            let registry = test_registry(JobLimits {
                max_running: 1,
                ..JobLimits::default()
            });
            let first = registry.submit(sh("sleep 30")).expect("submit");
            let err = registry.submit(sh("true")).expect_err("limit");
            assert_eq!(err.kind(), protocol::ErrorKind::ResourceExhausted);
            registry.shutdown().await;
            assert_eq!(
                registry.slot(&first.job_id).expect("job").state(),
                JobState::Cancelled
            );
        });
    }

    #[test]
    fn eviction_respects_retention_and_cap() {
        block_on(async {
            let registry = test_registry(JobLimits {
                max_running: 8,
                max_retained: 2,
                retention: Duration::from_secs(3600),
            });
            let mut ids = Vec::new();
            for _ in 0..3 {
                let job = registry.submit(sh("true")).expect("submit");
                wait_terminal(&registry, &job.job_id).await;
                ids.push(job.job_id);
            }
            let running = registry.submit(sh("sleep 30")).expect("submit");
            assert_eq!(registry.slots().len(), 3);
            assert!(registry.slot(&ids[0]).is_err());
            assert!(registry.slot(&ids[2]).is_ok());

            let registry_short = test_registry(JobLimits {
                retention: Duration::ZERO,
                ..JobLimits::default()
            });
            let job = registry_short.submit(sh("true")).expect("submit");
            wait_terminal(&registry_short, &job.job_id).await;
            assert_eq!(registry_short.evict_expired(), 1);

            registry.cancel(&running.job_id).expect("cancel");
            registry.shutdown().await;
        });
    }

    #[test]
    fn finished_jobs_write_records() {
        let dir = temp_dir("condamcp-jobs");
        block_on(async {
            let runner = ProcessRunner::new(RunnerLimits::default());
            let registry = JobRegistry::new(runner, JobLimits::default(), Some(dir.clone()));
            let job = registry.submit(sh("echo logged")).expect("submit");
            wait_terminal(&registry, &job.job_id).await;
            registry.slot(&job.job_id).expect("job").done.cancelled().await;
            assert!(dir.join(format!("{}.result.json", job.job_id)).exists());
            assert_eq!(
                std::fs::read_to_string(dir.join(format!("{}.stdout", job.job_id)))
                    .expect("stdout"),
                "logged\n"
            );
        });
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_executable_is_rejected_at_submit() {
        block_on(async {
            let registry = test_registry(JobLimits::default());
            let mut desc = sh("true");
            desc.program = PathBuf::from("/missing/conda");
            let err = registry.submit(desc).expect_err("missing");
            assert_eq!(err.kind(), protocol::ErrorKind::ExecutableNotFound);
            assert!(registry.slots().is_empty());
        });
    }
}
