//! The retrigger job for never-confirmed credential requests.
//!
//! A request whose confirmation has not arrived after the resubmit interval
//! gets a fresh event appended to the pending set, putting it back through
//! the drain job. A request that has been resubmitted up to the lifetime
//! limit is abandoned instead. Unlike the drain job, this job's store writes
//! carry a backoff policy: each write is retried on failure with exponential
//! delays, and only an exhausted policy aborts the run.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::{debug, warn};

use credflow_core::{BackoffPolicy, CredentialEvent, CredentialRequest, RetryInterval};

use crate::store::{EventStore, RequestStore, StoreError};

use super::executor::BoundedExecutor;
use super::runner::{
    BatchItem, ChunkConfig, ChunkedJob, ItemProcessor, OutcomeWriter, PageSource, ProcessError,
    WriteSummary,
};

/// Registered name of the retrigger job.
pub const RETRIGGER_JOB: &str = "retrigger-missing-credentials";

impl BatchItem for CredentialRequest {
    fn item_key(&self) -> uuid::Uuid {
        *self.id.as_uuid()
    }
}

/// How the retrigger job treats a lingering request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetriggerPolicy {
    /// Minimum age since issuance, and between resubmissions, before a
    /// request is considered missing.
    pub resubmit_interval: RetryInterval,
    /// Lifetime resubmission limit; beyond it the request is abandoned.
    pub max_resubmits: u32,
    /// Backoff applied to each store write in the write phase.
    pub backoff: BackoffPolicy,
}

impl Default for RetriggerPolicy {
    fn default() -> Self {
        Self {
            resubmit_interval: RetryInterval::new(std::time::Duration::from_secs(600)),
            max_resubmits: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Pages through requests still waiting on a confirmation, oldest first.
pub struct UnresolvedRequestSource<R> {
    store: R,
}

impl<R> UnresolvedRequestSource<R> {
    pub fn new(store: R) -> Self {
        Self { store }
    }
}

impl<R: RequestStore> PageSource for UnresolvedRequestSource<R> {
    type Item = CredentialRequest;

    fn fetch_page(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialRequest>, StoreError> {
        self.store.fetch_unresolved(page_size, offset)
    }
}

/// What the write phase should do with one request.
#[derive(Debug, Clone)]
pub enum RetriggerDecision {
    Resubmit(CredentialRequest),
    Abandon(CredentialRequest),
}

/// Decides, without touching any store, whether a request is due for
/// resubmission, past its lifetime limit, or simply not old enough yet.
pub struct RetriggerProcessor {
    policy: RetriggerPolicy,
}

impl RetriggerProcessor {
    pub fn new(policy: RetriggerPolicy) -> Self {
        Self { policy }
    }
}

impl ItemProcessor for RetriggerProcessor {
    type Item = CredentialRequest;
    type Output = RetriggerDecision;

    fn process(&self, request: CredentialRequest) -> Result<RetriggerDecision, ProcessError> {
        if request.resubmit_count >= self.policy.max_resubmits {
            debug!(
                request_id = %request.id,
                resubmits = request.resubmit_count,
                "request past its resubmission limit, abandoning"
            );
            return Ok(RetriggerDecision::Abandon(request));
        }

        // A young request's confirmation may simply still be in flight.
        let reference = request.last_resubmitted_at.unwrap_or(request.created_at);
        if !self
            .policy
            .resubmit_interval
            .has_elapsed(Some(reference), Utc::now())
        {
            return Err(ProcessError::TooEarly(format!(
                "request {} within the resubmit interval",
                request.id
            )));
        }

        Ok(RetriggerDecision::Resubmit(request))
    }
}

/// Applies retrigger decisions: appends a fresh event for each resubmission
/// and records abandonments. Every store write goes through the backoff
/// policy before a failure is allowed to abort the run.
pub struct RetriggerWriter<E, R> {
    events: E,
    requests: R,
    backoff: BackoffPolicy,
}

impl<E, R> RetriggerWriter<E, R> {
    pub fn new(events: E, requests: R, backoff: BackoffPolicy) -> Self {
        Self {
            events,
            requests,
            backoff,
        }
    }
}

impl<E: EventStore, R: RequestStore> OutcomeWriter for RetriggerWriter<E, R> {
    type Output = RetriggerDecision;

    fn write(&self, outputs: Vec<RetriggerDecision>) -> Result<WriteSummary, StoreError> {
        let written = outputs.len();
        let mut removed = 0usize;

        for decision in outputs {
            match decision {
                RetriggerDecision::Resubmit(request) => {
                    let event = CredentialEvent::new(request.id, request.payload.clone());
                    let resubmitted_at = Utc::now();
                    retry_with_backoff(&self.backoff, "append_resubmitted_event", || {
                        self.events.append(event.clone())
                    })?;
                    retry_with_backoff(&self.backoff, "mark_resubmitted", || {
                        self.requests.mark_resubmitted(request.id, resubmitted_at)
                    })?;
                    debug!(
                        request_id = %request.id,
                        event_id = %event.id,
                        "request resubmitted"
                    );
                }
                RetriggerDecision::Abandon(request) => {
                    retry_with_backoff(&self.backoff, "mark_abandoned", || {
                        self.requests.mark_abandoned(request.id)
                    })?;
                    removed += 1;
                }
            }
        }

        // Resubmitted requests stay pending until their new event lands, so
        // only abandonments leave the source's query set.
        Ok(WriteSummary {
            written,
            removed_from_source: removed,
        })
    }
}

/// Run `operation` until it succeeds or the backoff policy gives up, sleeping
/// the policy's delay between attempts. Returns the last error on exhaustion.
fn retry_with_backoff<T>(
    policy: &BackoffPolicy,
    operation: &str,
    mut attempt_fn: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        match attempt_fn() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    warn!(%operation, attempt, error = %err, "store write failed, giving up");
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    %operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store write failed, backing off"
                );
                thread::sleep(delay);
            }
        }
    }
}

/// Wire the retrigger job against a pair of stores.
pub fn retrigger_job<E, R>(
    events: E,
    requests: R,
    policy: RetriggerPolicy,
    config: ChunkConfig,
    executor: Arc<BoundedExecutor>,
) -> ChunkedJob<UnresolvedRequestSource<R>, RetriggerProcessor, RetriggerWriter<E, R>>
where
    E: EventStore + 'static,
    R: RequestStore + Clone + 'static,
{
    let backoff = policy.backoff.clone();
    ChunkedJob::new(
        RETRIGGER_JOB,
        config,
        UnresolvedRequestSource::new(requests.clone()),
        RetriggerProcessor::new(policy),
        RetriggerWriter::new(events, requests, backoff),
        executor,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use serde_json::json;

    use credflow_core::{CredentialRequestId, EventId, EventStatus, IdentityRecord, RequestStatus};

    use crate::store::{InMemoryEventStore, InMemoryRequestStore};

    fn fast_backoff(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
            max_retries,
        }
    }

    fn policy(interval: Duration, max_resubmits: u32) -> RetriggerPolicy {
        RetriggerPolicy {
            resubmit_interval: RetryInterval::new(interval),
            max_resubmits,
            backoff: fast_backoff(3),
        }
    }

    #[test]
    fn young_request_is_not_yet_due() {
        let request = CredentialRequest::new(json!({ "identity": {} }));
        let processor = RetriggerProcessor::new(policy(Duration::from_secs(600), 3));

        assert!(matches!(
            processor.process(request),
            Err(ProcessError::TooEarly(_))
        ));
    }

    #[test]
    fn aged_request_is_resubmitted() {
        let request = CredentialRequest::new(json!({ "identity": {} }))
            .with_created_at(Utc::now() - chrono::Duration::hours(1));
        let processor = RetriggerProcessor::new(policy(Duration::from_secs(600), 3));

        match processor.process(request.clone()).unwrap() {
            RetriggerDecision::Resubmit(r) => assert_eq!(r.id, request.id),
            other => panic!("expected resubmission, got {other:?}"),
        }
    }

    #[test]
    fn recently_resubmitted_request_waits_again() {
        let mut request = CredentialRequest::new(json!({ "identity": {} }))
            .with_created_at(Utc::now() - chrono::Duration::hours(1));
        request.mark_resubmitted(Utc::now()).unwrap();
        let processor = RetriggerProcessor::new(policy(Duration::from_secs(600), 3));

        assert!(matches!(
            processor.process(request),
            Err(ProcessError::TooEarly(_))
        ));
    }

    #[test]
    fn exhausted_request_is_abandoned() {
        let mut request = CredentialRequest::new(json!({ "identity": {} }))
            .with_created_at(Utc::now() - chrono::Duration::hours(1));
        request
            .mark_resubmitted(Utc::now() - chrono::Duration::minutes(30))
            .unwrap();
        let processor = RetriggerProcessor::new(policy(Duration::from_secs(600), 1));

        let decision = processor.process(request.clone()).unwrap();
        assert!(matches!(decision, RetriggerDecision::Abandon(_)));
    }

    #[test]
    fn writer_resubmits_through_the_event_store() {
        let events = Arc::new(InMemoryEventStore::new());
        let requests = Arc::new(InMemoryRequestStore::new());
        let request = CredentialRequest::new(json!({ "identity": { "uin": "1" } }))
            .with_created_at(Utc::now() - chrono::Duration::hours(1));
        requests.record_request(request.clone()).unwrap();

        let writer = RetriggerWriter::new(
            Arc::clone(&events),
            Arc::clone(&requests),
            fast_backoff(3),
        );
        let summary = writer
            .write(vec![RetriggerDecision::Resubmit(request.clone())])
            .unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.removed_from_source, 0);

        let pending = events.fetch_pending(10, 0).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, request.id);
        assert_eq!(pending[0].status, EventStatus::New);

        let stored = requests.get(request.id).unwrap().unwrap();
        assert_eq!(stored.resubmit_count, 1);
        assert_eq!(stored.status, RequestStatus::Pending);
        assert!(stored.last_resubmitted_at.is_some());
    }

    #[test]
    fn writer_abandons_and_removes_from_the_pending_set() {
        let events = Arc::new(InMemoryEventStore::new());
        let requests = Arc::new(InMemoryRequestStore::new());
        let request = CredentialRequest::new(json!({ "identity": {} }));
        requests.record_request(request.clone()).unwrap();

        let writer = RetriggerWriter::new(
            Arc::clone(&events),
            Arc::clone(&requests),
            fast_backoff(3),
        );
        let summary = writer
            .write(vec![RetriggerDecision::Abandon(request.clone())])
            .unwrap();

        assert_eq!(summary.removed_from_source, 1);
        assert_eq!(
            requests.get(request.id).unwrap().unwrap().status,
            RequestStatus::Abandoned
        );
        assert!(requests.fetch_unresolved(10, 0).unwrap().is_empty());
    }

    /// Event store that fails its first N appends, then behaves.
    struct FlakyEventStore {
        inner: Arc<InMemoryEventStore>,
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    impl FlakyEventStore {
        fn failing(times: u32) -> Self {
            Self {
                inner: Arc::new(InMemoryEventStore::new()),
                failures_left: AtomicU32::new(times),
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl EventStore for FlakyEventStore {
        fn append(&self, event: CredentialEvent) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.append(event)
        }

        fn fetch_pending(
            &self,
            page_size: usize,
            offset: usize,
        ) -> Result<Vec<CredentialEvent>, StoreError> {
            self.inner.fetch_pending(page_size, offset)
        }

        fn record_processed(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
            self.inner.record_processed(identity)
        }

        fn record_failure(
            &self,
            id: EventId,
            attempted_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.record_failure(id, attempted_at)
        }

        fn get(&self, id: EventId) -> Result<Option<CredentialEvent>, StoreError> {
            self.inner.get(id)
        }

        fn get_identity(
            &self,
            request_id: CredentialRequestId,
        ) -> Result<Option<IdentityRecord>, StoreError> {
            self.inner.get_identity(request_id)
        }

        fn pending_count(&self) -> Result<u64, StoreError> {
            self.inner.pending_count()
        }
    }

    #[test]
    fn writer_retries_transient_append_failures() {
        let events = Arc::new(FlakyEventStore::failing(2));
        let requests = Arc::new(InMemoryRequestStore::new());
        let request = CredentialRequest::new(json!({ "identity": {} }))
            .with_created_at(Utc::now() - chrono::Duration::hours(1));
        requests.record_request(request.clone()).unwrap();

        let writer = RetriggerWriter::new(
            Arc::clone(&events),
            Arc::clone(&requests),
            fast_backoff(3),
        );
        writer
            .write(vec![RetriggerDecision::Resubmit(request.clone())])
            .unwrap();

        assert_eq!(events.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(events.inner.fetch_pending(10, 0).unwrap().len(), 1);
        assert_eq!(requests.get(request.id).unwrap().unwrap().resubmit_count, 1);
    }

    #[test]
    fn writer_aborts_once_backoff_is_exhausted() {
        let events = Arc::new(FlakyEventStore::failing(u32::MAX));
        let requests = Arc::new(InMemoryRequestStore::new());
        let request = CredentialRequest::new(json!({ "identity": {} }));

        let writer = RetriggerWriter::new(
            Arc::clone(&events),
            Arc::clone(&requests),
            fast_backoff(3),
        );
        let result = writer.write(vec![RetriggerDecision::Resubmit(request.clone())]);

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(events.attempts.load(Ordering::SeqCst), 3);
        // The request was never marked resubmitted.
        assert!(requests.get(request.id).unwrap().is_none());
    }
}
