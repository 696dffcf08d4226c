//! Read-only queries over the registry. None of these block on a process.

use protocol::{JobStatus, JobSummary, TailChunk};

use super::registry::{timestamp, JobRegistry, JobSlot};
use crate::error::Result;
use crate::facade::{failure_error, DIAGNOSTIC_LINES};
use crate::runner::LogChunk;

impl JobRegistry {
    pub fn status(&self, id: &str) -> Result<JobStatus> {
        let slot = self.slot(id)?;
        let record = slot.record();
        let elapsed = match &record.result {
            Some(result) => result.duration_ms,
            None => slot.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
        };
        let error = record.result.as_ref().and_then(|result| {
            failure_error(
                slot.descriptor.operation,
                result,
                slot.output.diagnostic_tail(DIAGNOSTIC_LINES),
            )
        });
        Ok(JobStatus {
            job_id: slot.id.clone(),
            operation: slot.descriptor.operation.to_string(),
            command: slot.command.clone(),
            state: record.state,
            started_at: timestamp(slot.started_at),
            finished_at: record.finished_at.map(timestamp),
            elapsed_ms: elapsed,
            output_offset: slot.output.offset(),
            cancel_requested: record.cancel_requested,
            result: record.result.clone(),
            error,
        })
    }

    /// Output appended since `since`. Unknown output simply yields an empty
    /// chunk at the current offset.
    pub fn tail(&self, id: &str, since: u64) -> Result<TailChunk> {
        let slot = self.slot(id)?;
        // State first: a chunk read after a terminal state is final.
        let state = slot.state();
        Ok(chunk(&slot, state, slot.output.tail(since)))
    }

    pub fn tail_lines(&self, id: &str, lines: usize) -> Result<TailChunk> {
        let slot = self.slot(id)?;
        let state = slot.state();
        Ok(chunk(&slot, state, slot.output.tail_lines(lines)))
    }

    /// Every retained job, newest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut slots = self.slots();
        slots.sort_by(|a, b| b.started.cmp(&a.started));
        slots.iter().map(|slot| slot.summary()).collect()
    }
}

fn chunk(slot: &JobSlot, state: protocol::JobState, log: LogChunk) -> TailChunk {
    TailChunk {
        job_id: slot.id.clone(),
        state,
        start: log.start,
        offset: log.offset,
        dropped: log.dropped,
        data: log.data,
    }
}
