//! The credential-store drain job.
//!
//! Turns pending credential events into identity records. The processor
//! gates each event on the minimum retry interval, validates its payload and
//! records failures immediately; the writer commits the chunk's successes and
//! resolves the originating requests so the retrigger job stops watching
//! them.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use credflow_core::{CredentialEvent, IdentityRecord, RetryInterval};

use crate::store::{EventStore, RequestStore, StoreError};

use super::executor::BoundedExecutor;
use super::runner::{
    BatchItem, ChunkConfig, ChunkedJob, ItemProcessor, OutcomeWriter, PageSource, ProcessError,
    WriteSummary,
};

/// Registered name of the drain job.
pub const CREDENTIAL_STORE_JOB: &str = "credential-store";

impl BatchItem for CredentialEvent {
    fn item_key(&self) -> uuid::Uuid {
        *self.id.as_uuid()
    }
}

/// Pages through events still waiting for an outcome, in fetch order:
/// `NEW` before `FAILED`, fewer retries first, then oldest first.
pub struct PendingEventSource<E> {
    store: E,
}

impl<E> PendingEventSource<E> {
    pub fn new(store: E) -> Self {
        Self { store }
    }
}

impl<E: EventStore> PageSource for PendingEventSource<E> {
    type Item = CredentialEvent;

    fn fetch_page(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialEvent>, StoreError> {
        self.store.fetch_pending(page_size, offset)
    }
}

/// Attempts one event.
///
/// An event whose last attempt is within the minimum retry interval is not
/// yet due and is skipped untouched. A payload that fails validation is a
/// business failure: the event is marked `FAILED` with its retry count
/// bumped, and the chunk moves on.
pub struct CredentialProcessor<E> {
    store: E,
    retry_interval: RetryInterval,
}

impl<E> CredentialProcessor<E> {
    pub fn new(store: E, retry_interval: RetryInterval) -> Self {
        Self {
            store,
            retry_interval,
        }
    }
}

impl<E: EventStore> ItemProcessor for CredentialProcessor<E> {
    type Item = CredentialEvent;
    type Output = IdentityRecord;

    fn process(&self, event: CredentialEvent) -> Result<IdentityRecord, ProcessError> {
        let now = Utc::now();

        if !self.retry_interval.has_elapsed(event.last_attempted_at, now) {
            return Err(ProcessError::TooEarly(format!(
                "event {} attempted within the retry interval",
                event.id
            )));
        }

        match extract_identity(&event.payload) {
            Ok(identity) => {
                debug!(event_id = %event.id, request_id = %event.request_id, "event processed");
                Ok(IdentityRecord {
                    event_id: event.id,
                    request_id: event.request_id,
                    identity,
                    processed_at: now,
                })
            }
            Err(reason) => {
                // Persist the failure here so the chunk barrier has nothing
                // left to do for this item.
                self.store.record_failure(event.id, now)?;
                Err(ProcessError::Business(format!(
                    "event {}: {reason}",
                    event.id
                )))
            }
        }
    }
}

/// The identity document an event must carry to be storable.
fn extract_identity(payload: &Value) -> Result<Value, String> {
    match payload.get("identity") {
        Some(Value::Object(fields)) if !fields.is_empty() => Ok(Value::Object(fields.clone())),
        Some(Value::Object(_)) => Err("identity document is empty".into()),
        Some(_) => Err("identity field is not an object".into()),
        None => Err("payload has no identity field".into()),
    }
}

/// Commits a chunk of successful outcomes.
///
/// Marking the event `PROCESSED` also resolves the request that spawned it;
/// requests the request store never saw are tolerated.
pub struct CredentialWriter<E, R> {
    events: E,
    requests: R,
}

impl<E, R> CredentialWriter<E, R> {
    pub fn new(events: E, requests: R) -> Self {
        Self { events, requests }
    }
}

impl<E: EventStore, R: RequestStore> OutcomeWriter for CredentialWriter<E, R> {
    type Output = IdentityRecord;

    fn write(&self, outputs: Vec<IdentityRecord>) -> Result<WriteSummary, StoreError> {
        let written = outputs.len();
        for identity in outputs {
            self.events.record_processed(&identity)?;
            self.requests.mark_resolved(identity.request_id)?;
        }
        // Processed events drop out of the pending query entirely.
        Ok(WriteSummary::removed(written))
    }
}

/// Wire the drain job against a pair of stores.
pub fn credential_store_job<E, R>(
    events: E,
    requests: R,
    retry_interval: RetryInterval,
    config: ChunkConfig,
    executor: Arc<BoundedExecutor>,
) -> ChunkedJob<PendingEventSource<E>, CredentialProcessor<E>, CredentialWriter<E, R>>
where
    E: EventStore + Clone + 'static,
    R: RequestStore + 'static,
{
    ChunkedJob::new(
        CREDENTIAL_STORE_JOB,
        config,
        PendingEventSource::new(events.clone()),
        CredentialProcessor::new(events.clone(), retry_interval),
        CredentialWriter::new(events, requests),
        executor,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use credflow_core::{CredentialRequest, CredentialRequestId, EventStatus, RequestStatus};

    use crate::store::{InMemoryEventStore, InMemoryRequestStore};

    fn valid_payload() -> Value {
        json!({ "identity": { "uin": "857291046", "name": "Asha" } })
    }

    fn processor(
        store: Arc<InMemoryEventStore>,
        interval: Duration,
    ) -> CredentialProcessor<Arc<InMemoryEventStore>> {
        CredentialProcessor::new(store, RetryInterval::new(interval))
    }

    #[test]
    fn new_event_is_processed_into_an_identity_record() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = CredentialEvent::new(CredentialRequestId::new(), valid_payload());
        store.append(event.clone()).unwrap();

        let processor = processor(Arc::clone(&store), Duration::from_secs(60));
        let identity = processor.process(event.clone()).unwrap();

        assert_eq!(identity.event_id, event.id);
        assert_eq!(identity.request_id, event.request_id);
        assert_eq!(identity.identity, valid_payload()["identity"]);
    }

    #[test]
    fn recently_attempted_event_is_not_yet_due() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = CredentialEvent::new(CredentialRequestId::new(), valid_payload())
            .with_last_attempted_at(Utc::now());
        store.append(event.clone()).unwrap();

        let processor = processor(Arc::clone(&store), Duration::from_secs(60));
        let outcome = processor.process(event.clone());

        assert!(matches!(outcome, Err(ProcessError::TooEarly(_))));
        let stored = store.get(event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::New);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn stale_attempt_is_due_again() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = CredentialEvent::new(CredentialRequestId::new(), valid_payload())
            .with_last_attempted_at(Utc::now() - chrono::Duration::minutes(5));

        let processor = processor(store, Duration::from_secs(60));
        assert!(processor.process(event).is_ok());
    }

    #[test]
    fn malformed_payload_is_recorded_as_a_failure() {
        let store = Arc::new(InMemoryEventStore::new());
        let event =
            CredentialEvent::new(CredentialRequestId::new(), json!({ "identity": "not-a-doc" }));
        store.append(event.clone()).unwrap();

        let processor = processor(Arc::clone(&store), Duration::from_secs(60));
        let outcome = processor.process(event.clone());

        assert!(matches!(outcome, Err(ProcessError::Business(_))));
        let stored = store.get(event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_attempted_at.is_some());
    }

    #[test]
    fn missing_identity_field_is_a_business_failure() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = CredentialEvent::new(CredentialRequestId::new(), json!({ "other": 1 }));
        store.append(event.clone()).unwrap();

        let processor = processor(store, Duration::from_secs(60));
        assert!(matches!(
            processor.process(event),
            Err(ProcessError::Business(_))
        ));
    }

    #[test]
    fn writer_marks_processed_and_resolves_the_request() {
        let events = Arc::new(InMemoryEventStore::new());
        let requests = Arc::new(InMemoryRequestStore::new());

        let request = CredentialRequest::new(valid_payload());
        requests.record_request(request.clone()).unwrap();
        let event = CredentialEvent::new(request.id, valid_payload());
        events.append(event.clone()).unwrap();

        let identity = IdentityRecord {
            event_id: event.id,
            request_id: request.id,
            identity: valid_payload()["identity"].clone(),
            processed_at: Utc::now(),
        };
        let writer = CredentialWriter::new(Arc::clone(&events), Arc::clone(&requests));
        let summary = writer.write(vec![identity]).unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.removed_from_source, 1);
        assert_eq!(
            events.get(event.id).unwrap().unwrap().status,
            EventStatus::Processed
        );
        assert!(events.get_identity(request.id).unwrap().is_some());
        assert_eq!(
            requests.get(request.id).unwrap().unwrap().status,
            RequestStatus::Resolved
        );
    }

    #[test]
    fn writer_tolerates_requests_it_never_tracked() {
        let events = Arc::new(InMemoryEventStore::new());
        let requests = Arc::new(InMemoryRequestStore::new());

        let event = CredentialEvent::new(CredentialRequestId::new(), valid_payload());
        events.append(event.clone()).unwrap();

        let identity = IdentityRecord {
            event_id: event.id,
            request_id: event.request_id,
            identity: valid_payload()["identity"].clone(),
            processed_at: Utc::now(),
        };
        let writer = CredentialWriter::new(Arc::clone(&events), requests);

        assert!(writer.write(vec![identity]).is_ok());
        assert_eq!(
            events.get(event.id).unwrap().unwrap().status,
            EventStatus::Processed
        );
    }
}
