use protocol::{ExecutionResult, JobState, Operation};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ResultRecord<'a> {
    id: &'a str,
    operation: Operation,
    state: JobState,
    command: &'a [String],
    exit_code: Option<i32>,
    error: Option<&'a str>,
    partial_output: bool,
    duration_ms: u64,
}

/// Persists a finished job under `dir`. Failures are logged and otherwise ignored.
pub(crate) async fn write_job_record(
    dir: &Path,
    id: &str,
    operation: Operation,
    state: JobState,
    result: &ExecutionResult,
) {
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(error = %err, dir = %dir.display(), "failed to create job record dir");
        return;
    }
    write_result_record(dir, id, operation, state, result).await;
    write_output_files(dir, id, result).await;
}

async fn write_result_record(
    dir: &Path,
    id: &str,
    operation: Operation,
    state: JobState,
    result: &ExecutionResult,
) {
    let record = ResultRecord {
        id,
        operation,
        state,
        command: &result.command,
        exit_code: result.exit_code,
        error: result.error.as_deref(),
        partial_output: result.partial_output(),
        duration_ms: result.duration_ms,
    };
    let path = dir.join(format!("{id}.result.json"));
    match serde_json::to_vec_pretty(&record) {
        Ok(payload) => {
            if let Err(err) = tokio::fs::write(path, payload).await {
                tracing::warn!(job_id = id, error = %err, "failed to write result record");
            }
        }
        Err(err) => tracing::warn!(job_id = id, error = %err, "failed to encode result record"),
    }
}

async fn write_output_files(dir: &Path, id: &str, result: &ExecutionResult) {
    if !result.stdout.is_empty() {
        let path = dir.join(format!("{id}.stdout"));
        if let Err(err) = tokio::fs::write(path, &result.stdout).await {
            tracing::warn!(job_id = id, error = %err, "failed to write stdout output");
        }
    }
    if !result.stderr.is_empty() {
        let path = dir.join(format!("{id}.stderr"));
        if let Err(err) = tokio::fs::write(path, &result.stderr).await {
            tracing::warn!(job_id = id, error = %err, "failed to write stderr output");
        }
    }
}
