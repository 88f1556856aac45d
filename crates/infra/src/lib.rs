//! Infrastructure layer: credential stores and the batch pipeline.

pub mod batch;
pub mod store;


pub use batch::{
    credential_store_job, retrigger_job, BatchJob, BoundedExecutor, ChunkConfig, ExecutorConfig,
    JobError, ProcessError, RetriggerPolicy, RunId, RunReport, Scheduler, SchedulerConfig,
    SchedulerError, SchedulerHandle, CREDENTIAL_STORE_JOB, RETRIGGER_JOB,
};
pub use store::{
    EventStore, InMemoryEventStore, InMemoryRequestStore, PostgresEventStore, PostgresRequestStore,
    RequestStore, StoreError,
};
