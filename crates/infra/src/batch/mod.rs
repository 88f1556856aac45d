//! Chunked batch pipeline over the credential stores.
//!
//! Two jobs share the same machinery: the drain job turns pending credential
//! events into stored identity records, and the retrigger job resubmits
//! requests whose confirmation never arrived. Both are chunked drains run by
//! the scheduler on a fixed interval, fanning each chunk out over the
//! bounded worker pool.

pub mod credential;
pub mod executor;
pub mod retrigger;
pub mod runner;
pub mod scheduler;

pub use credential::{
    credential_store_job, CredentialProcessor, CredentialWriter, PendingEventSource,
    CREDENTIAL_STORE_JOB,
};
pub use executor::{
    BoundedExecutor, ExecutorConfig, ExecutorError, ExecutorStats, ExecutorStatsSnapshot,
    TaskHandle,
};
pub use retrigger::{
    retrigger_job, RetriggerDecision, RetriggerPolicy, RetriggerProcessor, RetriggerWriter,
    UnresolvedRequestSource, RETRIGGER_JOB,
};
pub use runner::{
    BatchItem, BatchJob, ChunkConfig, ChunkedJob, ItemProcessor, JobError, OutcomeWriter,
    PageSource, ProcessError, RunId, RunReport, WriteSummary,
};
pub use scheduler::{
    JobState, JobStats, RunOutcome, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle,
};
