//! Chunked read, process, write job runner.
//!
//! A run drains its source in fixed-size chunks: fetch a page, submit every
//! item to the worker pool, wait for all of them at the barrier, then commit
//! the chunk's outcomes through the writer. Chunk N+1 does not start until
//! chunk N's writes are committed.
//!
//! Item faults stay inside the chunk. A business failure is recorded against
//! the item and the chunk moves on; a not-yet-due item is skipped with no
//! state change, with no bound on how many items a run may skip. Only store
//! unavailability or an unclassified fault aborts the run, and chunks already
//! committed stay committed.
//!
//! ## Cursor discipline
//!
//! The source is a live query, not a snapshot: rows that reach a terminal
//! status drop out of it between fetches, and rows that fail re-sort behind
//! the unvisited region. The fetch offset therefore advances only past items
//! known to still occupy their position: skipped items, revisits of items
//! this run already attempted, and written items the writer reports as still
//! pending in the source. Everything else either left the query set or moved
//! behind the cursor. A per-run set of attempted item keys makes revisits
//! harmless, so every pending item gets at most one attempt per run and the
//! drain loop always terminates.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::store::StoreError;

use super::executor::BoundedExecutor;

/// Monotonically increasing per-job run identifier, assigned by the scheduler.
pub type RunId = u64;

/// Classified outcome of processing a single item.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The item is not yet due for an attempt; skip it without touching its
    /// state. Never aborts a run, no matter how often it occurs.
    #[error("not yet due: {0}")]
    TooEarly(String),
    /// The attempt failed in a recognized way; the failure has been recorded
    /// against the item and the chunk continues.
    #[error("attempt failed: {0}")]
    Business(String),
    /// The store went away mid-attempt; fatal to the current run.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal run errors. Per-item faults never surface here.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A worker died without reporting a result; treated like any other
    /// unclassified fault and aborts the run.
    #[error("a processing task was lost mid-chunk")]
    TaskLost,
}

/// Work item with a stable identity for per-run bookkeeping.
pub trait BatchItem {
    fn item_key(&self) -> Uuid;
}

/// Paginated view over the pending work set.
///
/// The same page arguments may return different rows across calls within one
/// run; that is expected, the query set shrinks and re-sorts as outcomes are
/// committed.
pub trait PageSource: Send + Sync {
    type Item: BatchItem + Send + 'static;

    fn fetch_page(&self, page_size: usize, offset: usize) -> Result<Vec<Self::Item>, StoreError>;
}

/// Attempts one item and classifies the outcome.
///
/// This is the only stage allowed to transition item state on failure; the
/// writer owns success-side persistence so that a whole chunk's successes
/// commit together at the barrier.
pub trait ItemProcessor: Send + Sync {
    type Item: BatchItem + Send + 'static;
    type Output: Send + 'static;

    fn process(&self, item: Self::Item) -> Result<Self::Output, ProcessError>;
}

/// Commits a chunk's successful outputs.
pub trait OutcomeWriter: Send + Sync {
    type Output: Send + 'static;

    fn write(&self, outputs: Vec<Self::Output>) -> Result<WriteSummary, StoreError>;
}

/// What the writer did with a chunk's outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Outputs persisted.
    pub written: usize,
    /// Of those, how many left the source's pending set. Written items that
    /// remain pending (a resubmission, say) keep their fetch position and the
    /// cursor must step over them.
    pub removed_from_source: usize,
}

impl WriteSummary {
    pub fn removed(written: usize) -> Self {
        Self {
            written,
            removed_from_source: written,
        }
    }
}

/// Counters for one completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: RunId,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chunks: usize,
    pub fetched: usize,
    pub written: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A named job the scheduler can trigger.
pub trait BatchJob: Send + Sync {
    fn name(&self) -> &str;

    /// Drain the job's pending set once. Fatal errors abort the run; chunks
    /// committed before the fault remain committed.
    fn execute(&self, run_id: RunId) -> Result<RunReport, JobError>;
}

impl<J: BatchJob + ?Sized> BatchJob for Arc<J> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn execute(&self, run_id: RunId) -> Result<RunReport, JobError> {
        (**self).execute(run_id)
    }
}

/// Sizing for a chunked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { chunk_size: 10 }
    }
}

/// Generic chunked drain job over a source, processor and writer.
pub struct ChunkedJob<S, P, W>
where
    S: PageSource,
    P: ItemProcessor<Item = S::Item>,
    W: OutcomeWriter<Output = P::Output>,
{
    name: String,
    config: ChunkConfig,
    source: S,
    processor: Arc<P>,
    writer: W,
    executor: Arc<BoundedExecutor>,
}

impl<S, P, W> ChunkedJob<S, P, W>
where
    S: PageSource,
    P: ItemProcessor<Item = S::Item> + 'static,
    W: OutcomeWriter<Output = P::Output>,
{
    pub fn new(
        name: impl Into<String>,
        config: ChunkConfig,
        source: S,
        processor: P,
        writer: W,
        executor: Arc<BoundedExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            source,
            processor: Arc::new(processor),
            writer,
            executor,
        }
    }

    fn run_chunks(&self, run_id: RunId) -> Result<RunReport, JobError> {
        let started_at = Utc::now();
        let chunk_size = self.config.chunk_size.max(1);
        let mut attempted: HashSet<Uuid> = HashSet::new();
        let mut offset = 0usize;
        let mut chunks = 0usize;
        let mut fetched_total = 0usize;
        let mut written_total = 0usize;
        let mut failed_total = 0usize;
        let mut skipped_total = 0usize;

        loop {
            let page = self.source.fetch_page(chunk_size, offset)?;
            if page.is_empty() {
                break;
            }
            fetched_total += page.len();

            let mut in_place = 0usize;
            let mut handles = Vec::with_capacity(page.len());
            for item in page {
                if !attempted.insert(item.item_key()) {
                    // Already attempted this run; the row merely shifted back
                    // into the fetch window.
                    in_place += 1;
                    continue;
                }
                let processor = Arc::clone(&self.processor);
                handles.push(self.executor.submit(move || processor.process(item)));
            }

            // Barrier: every item in the chunk settles before anything is
            // committed.
            let mut outputs = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.join() {
                    Ok(Ok(output)) => outputs.push(output),
                    Ok(Err(ProcessError::TooEarly(reason))) => {
                        debug!(job = %self.name, run_id, %reason, "item not yet due, skipping");
                        skipped_total += 1;
                        in_place += 1;
                    }
                    Ok(Err(ProcessError::Business(reason))) => {
                        warn!(job = %self.name, run_id, %reason, "item attempt failed, continuing");
                        failed_total += 1;
                    }
                    Ok(Err(ProcessError::Store(err))) => return Err(JobError::Store(err)),
                    Err(_) => return Err(JobError::TaskLost),
                }
            }

            if !outputs.is_empty() {
                let summary = self.writer.write(outputs)?;
                written_total += summary.written;
                in_place += summary.written.saturating_sub(summary.removed_from_source);
            }

            chunks += 1;
            offset += in_place;
            debug!(
                job = %self.name,
                run_id,
                chunk = chunks,
                offset,
                "chunk committed"
            );
        }

        Ok(RunReport {
            run_id,
            job: self.name.clone(),
            started_at,
            finished_at: Utc::now(),
            chunks,
            fetched: fetched_total,
            written: written_total,
            failed: failed_total,
            skipped: skipped_total,
        })
    }
}

impl<S, P, W> BatchJob for ChunkedJob<S, P, W>
where
    S: PageSource,
    P: ItemProcessor<Item = S::Item> + 'static,
    W: OutcomeWriter<Output = P::Output>,
{
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(job = %self.name), err)]
    fn execute(&self, run_id: RunId) -> Result<RunReport, JobError> {
        info!(job = %self.name, run_id, "run starting");
        let report = self.run_chunks(run_id)?;
        info!(
            job = %self.name,
            run_id,
            chunks = report.chunks,
            written = report.written,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = report.duration().num_milliseconds(),
            "run completed"
        );
        Ok(report)
    }
}
