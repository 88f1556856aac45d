//! Composition root: pick stores, wire the two batch jobs, hand back a
//! scheduler ready to spawn.

pub mod config;

pub use config::Config;

use std::sync::Arc;

use credflow_infra::{
    credential_store_job, retrigger_job, BoundedExecutor, ChunkConfig, EventStore, ExecutorConfig,
    RequestStore, Scheduler,
};

/// A fully wired pipeline: both jobs registered on a scheduler, sharing one
/// worker pool.
pub struct Pipeline {
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<BoundedExecutor>,
}

/// Wire the credential-store and retrigger jobs over the given stores.
///
/// The jobs share one executor sized for a single chunk. Neither job can run
/// concurrently with itself, and the chunk barrier keeps a run's footprint at
/// one chunk of in-flight items, so pool contention between the two jobs only
/// stretches a chunk, never starves it.
pub fn build_pipeline<E, R>(events: E, requests: R, config: &Config) -> Pipeline
where
    E: EventStore + Clone + 'static,
    R: RequestStore + Clone + 'static,
{
    let executor = Arc::new(BoundedExecutor::new(ExecutorConfig::for_chunk_size(
        config.chunk_size,
    )));
    let chunk = ChunkConfig {
        chunk_size: config.chunk_size,
    };

    let scheduler = Arc::new(Scheduler::new());
    scheduler.register(
        config.store_job_interval,
        Arc::new(credential_store_job(
            events.clone(),
            requests.clone(),
            config.retry_interval,
            chunk,
            Arc::clone(&executor),
        )),
    );
    scheduler.register(
        config.retrigger_job_interval,
        Arc::new(retrigger_job(
            events,
            requests,
            config.retrigger.clone(),
            chunk,
            Arc::clone(&executor),
        )),
    );

    Pipeline {
        scheduler,
        executor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::{Duration, Instant};

    use credflow_core::{CredentialEvent, CredentialRequestId};
    use credflow_infra::{
        InMemoryEventStore, InMemoryRequestStore, CREDENTIAL_STORE_JOB, RETRIGGER_JOB,
    };

    #[test]
    fn pipeline_registers_both_jobs() {
        let pipeline = build_pipeline(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryRequestStore::new()),
            &Config::default(),
        );

        assert!(pipeline.scheduler.stats(CREDENTIAL_STORE_JOB).is_some());
        assert!(pipeline.scheduler.stats(RETRIGGER_JOB).is_some());
    }

    #[test]
    fn triggered_pipeline_drains_seeded_events() {
        let events = Arc::new(InMemoryEventStore::new());
        let requests = Arc::new(InMemoryRequestStore::new());
        for i in 0..3 {
            let payload = serde_json::json!({"identity": {"uin": format!("{i}")}});
            events
                .append(CredentialEvent::new(CredentialRequestId::new(), payload))
                .unwrap();
        }

        let pipeline = build_pipeline(Arc::clone(&events), Arc::clone(&requests), &Config::default());
        pipeline.scheduler.trigger_now(CREDENTIAL_STORE_JOB).unwrap();

        // The run executes on a detached thread; poll the store.
        let deadline = Instant::now() + Duration::from_secs(5);
        while events.pending_count().unwrap() > 0 {
            assert!(Instant::now() < deadline, "drain did not complete in time");
            thread::sleep(Duration::from_millis(10));
        }
        pipeline.executor.shutdown();
    }
}
