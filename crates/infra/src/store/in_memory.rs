use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use credflow_core::{
    CredentialEvent, CredentialRequest, CredentialRequestId, EventId, EventStatus, IdentityRecord,
};

use super::r#trait::{EventStore, RequestStore, StoreError};

/// In-memory credential event store.
///
/// Intended for tests and database-less operation. Not optimized for
/// performance; every fetch sorts the full pending set.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<EventId, CredentialEvent>>,
    identities: RwLock<HashMap<CredentialRequestId, IdentityRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch order: status DESC (`NEW` before `FAILED`), retry count ASC,
    /// created ASC, id ASC. The id tiebreak makes the order total.
    fn pending_order(a: &CredentialEvent, b: &CredentialEvent) -> Ordering {
        fn status_rank(status: EventStatus) -> u8 {
            match status {
                EventStatus::New => 0,
                EventStatus::Failed => 1,
                EventStatus::Processed => 2,
            }
        }

        status_rank(a.status)
            .cmp(&status_rank(b.status))
            .then(a.retry_count.cmp(&b.retry_count))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: CredentialEvent) -> Result<(), StoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        events.insert(event.id, event);
        Ok(())
    }

    fn fetch_pending(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialEvent>, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        let mut pending: Vec<CredentialEvent> = events
            .values()
            .filter(|e| e.status.is_pending())
            .cloned()
            .collect();
        pending.sort_by(Self::pending_order);

        Ok(pending.into_iter().skip(offset).take(page_size).collect())
    }

    fn record_processed(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        let event = events
            .get_mut(&identity.event_id)
            .ok_or(StoreError::EventNotFound(identity.event_id))?;
        if event.status == EventStatus::Processed {
            return Ok(());
        }
        // Legal from NEW and FAILED; checked above for PROCESSED.
        event
            .mark_processed(identity.processed_at)
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let mut identities = self
            .identities
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        identities
            .entry(identity.request_id)
            .or_insert_with(|| identity.clone());
        Ok(())
    }

    fn record_failure(&self, id: EventId, attempted_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        let event = events.get_mut(&id).ok_or(StoreError::EventNotFound(id))?;
        if event.status == EventStatus::Processed {
            return Ok(());
        }
        event
            .mark_failed(attempted_at)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(())
    }

    fn get(&self, id: EventId) -> Result<Option<CredentialEvent>, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(events.get(&id).cloned())
    }

    fn get_identity(
        &self,
        request_id: CredentialRequestId,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let identities = self
            .identities
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(identities.get(&request_id).cloned())
    }

    fn pending_count(&self) -> Result<u64, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(events.values().filter(|e| e.status.is_pending()).count() as u64)
    }
}

/// In-memory credential request store.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    requests: RwLock<HashMap<CredentialRequestId, CredentialRequest>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RequestStore for InMemoryRequestStore {
    fn record_request(&self, request: CredentialRequest) -> Result<(), StoreError> {
        let mut requests = self
            .requests
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        requests.insert(request.id, request);
        Ok(())
    }

    fn fetch_unresolved(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialRequest>, StoreError> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        let mut unresolved: Vec<CredentialRequest> = requests
            .values()
            .filter(|r| r.status.is_unresolved())
            .cloned()
            .collect();
        unresolved.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(unresolved.into_iter().skip(offset).take(page_size).collect())
    }

    fn mark_resubmitted(
        &self,
        id: CredentialRequestId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut requests = self
            .requests
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        let request = requests.get_mut(&id).ok_or(StoreError::RequestNotFound(id))?;
        if !request.status.is_unresolved() {
            return Ok(());
        }
        request
            .mark_resubmitted(at)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(())
    }

    fn mark_resolved(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        let mut requests = self
            .requests
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        // Events can arrive for requests this store never tracked.
        if let Some(request) = requests.get_mut(&id) {
            request
                .mark_resolved()
                .map_err(|e| StoreError::Decode(e.to_string()))?;
        }
        Ok(())
    }

    fn mark_abandoned(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        let mut requests = self
            .requests
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        let request = requests.get_mut(&id).ok_or(StoreError::RequestNotFound(id))?;
        if request.status == credflow_core::RequestStatus::Resolved {
            return Ok(());
        }
        request
            .mark_abandoned()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(())
    }

    fn get(&self, id: CredentialRequestId) -> Result<Option<CredentialRequest>, StoreError> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(requests.get(&id).cloned())
    }

    fn unresolved_count(&self) -> Result<u64, StoreError> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(requests.values().filter(|r| r.status.is_unresolved()).count() as u64)
    }
}
