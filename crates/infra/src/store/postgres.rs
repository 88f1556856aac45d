//! Postgres-backed stores for credential events and requests.
//!
//! ## Expected schema
//!
//! Migrations are owned by the platform's schema pipeline, not this crate. The
//! adapters expect these tables:
//!
//! ```sql
//! CREATE TABLE credential_event_store (
//!     id                UUID PRIMARY KEY,
//!     request_id        UUID        NOT NULL,
//!     payload           JSONB       NOT NULL,
//!     status            TEXT        NOT NULL,
//!     retry_count       INTEGER     NOT NULL DEFAULT 0,
//!     created_at        TIMESTAMPTZ NOT NULL,
//!     last_attempted_at TIMESTAMPTZ
//! );
//!
//! CREATE TABLE identity_cache (
//!     request_id   UUID PRIMARY KEY,
//!     event_id     UUID        NOT NULL,
//!     identity     JSONB       NOT NULL,
//!     processed_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE credential_request_status (
//!     id                  UUID PRIMARY KEY,
//!     payload             JSONB       NOT NULL,
//!     status              TEXT        NOT NULL,
//!     resubmit_count      INTEGER     NOT NULL DEFAULT 0,
//!     created_at          TIMESTAMPTZ NOT NULL,
//!     last_resubmitted_at TIMESTAMPTZ
//! );
//! ```
//!
//! ## Error mapping
//!
//! All sqlx transport and database errors map to `StoreError::Unavailable`,
//! which aborts the current job run at the chunk boundary; row decoding
//! problems map to `StoreError::Decode`. There is no per-item swallowing of
//! store failures.
//!
//! ## Sync-over-async bridge
//!
//! The store traits are synchronous because they are called from batch
//! coordinator and worker threads. Each adapter captures a
//! `tokio::runtime::Handle` at construction and bridges the sync trait
//! methods onto its inherent async sqlx methods with `Handle::block_on`; that
//! is legal precisely because those batch threads live outside the async
//! runtime. Do not call the trait methods from a runtime worker thread.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use credflow_core::{
    CredentialEvent, CredentialRequest, CredentialRequestId, EventId, EventStatus, IdentityRecord,
    RequestStatus,
};

use super::r#trait::{EventStore, RequestStore, StoreError};

/// Postgres-backed credential event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresEventStore {
    /// Create a store over the given pool.
    ///
    /// `runtime` is the handle the sync trait methods block on; pass
    /// `tokio::runtime::Handle::current()` from the composition root.
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, request_id = %event.request_id), err)]
    pub async fn append_event(&self, event: CredentialEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credential_event_store (
                id, request_id, payload, status, retry_count, created_at, last_attempted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.request_id.as_uuid())
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.created_at)
        .bind(event.last_attempted_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_event", e))?;

        Ok(())
    }

    /// One page of the pending set.
    ///
    /// `status DESC` yields `NEW` before `FAILED` because of their lexical
    /// order; the original platform's schema relies on the same property.
    #[instrument(skip(self), err)]
    pub async fn fetch_pending_page(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, payload, status, retry_count, created_at, last_attempted_at
            FROM credential_event_store
            WHERE status IN ('NEW', 'FAILED')
            ORDER BY status DESC, retry_count ASC, created_at ASC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(decode_event_row(&row)?);
        }
        Ok(events)
    }

    #[instrument(
        skip(self, identity),
        fields(event_id = %identity.event_id, request_id = %identity.request_id),
        err
    )]
    pub async fn record_processed_outcome(
        &self,
        identity: &IdentityRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let status = fetch_status_for_update(&mut tx, identity.event_id).await?;
        if status == EventStatus::Processed {
            // Replayed write after a crash; the first outcome stands.
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO identity_cache (request_id, event_id, identity, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(identity.request_id.as_uuid())
        .bind(identity.event_id.as_uuid())
        .bind(&identity.identity)
        .bind(identity.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_identity", e))?;

        sqlx::query(
            r#"
            UPDATE credential_event_store
            SET status = 'PROCESSED', last_attempted_at = $2
            WHERE id = $1 AND status <> 'PROCESSED'
            "#,
        )
        .bind(identity.event_id.as_uuid())
        .bind(identity.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn record_failure_outcome(
        &self,
        id: EventId,
        attempted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let status = fetch_status_for_update(&mut tx, id).await?;
        if status == EventStatus::Processed {
            // A processed event never regresses.
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE credential_event_store
            SET status = 'FAILED', retry_count = retry_count + 1, last_attempted_at = $2
            WHERE id = $1 AND status <> 'PROCESSED'
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<CredentialEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, request_id, payload, status, retry_count, created_at, last_attempted_at
            FROM credential_event_store
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event", e))?;

        row.map(|r| decode_event_row(&r)).transpose()
    }

    pub async fn get_identity_record(
        &self,
        request_id: CredentialRequestId,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT request_id, event_id, identity, processed_at
            FROM identity_cache
            WHERE request_id = $1
            "#,
        )
        .bind(request_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_identity", e))?;

        row.map(|r| decode_identity_row(&r)).transpose()
    }

    pub async fn count_pending(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS pending FROM credential_event_store WHERE status IN ('NEW', 'FAILED')",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_count", e))?;

        let pending: i64 = row
            .try_get("pending")
            .map_err(|e| StoreError::Decode(format!("failed to read pending count: {e}")))?;
        Ok(pending.max(0) as u64)
    }
}

impl EventStore for PostgresEventStore {
    fn append(&self, event: CredentialEvent) -> Result<(), StoreError> {
        self.runtime.block_on(self.append_event(event))
    }

    fn fetch_pending(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialEvent>, StoreError> {
        self.runtime
            .block_on(self.fetch_pending_page(page_size, offset))
    }

    fn record_processed(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
        self.runtime.block_on(self.record_processed_outcome(identity))
    }

    fn record_failure(&self, id: EventId, attempted_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.runtime
            .block_on(self.record_failure_outcome(id, attempted_at))
    }

    fn get(&self, id: EventId) -> Result<Option<CredentialEvent>, StoreError> {
        self.runtime.block_on(self.get_event(id))
    }

    fn get_identity(
        &self,
        request_id: CredentialRequestId,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        self.runtime.block_on(self.get_identity_record(request_id))
    }

    fn pending_count(&self) -> Result<u64, StoreError> {
        self.runtime.block_on(self.count_pending())
    }
}

/// Postgres-backed credential request store.
#[derive(Debug, Clone)]
pub struct PostgresRequestStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresRequestStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self, request), fields(request_id = %request.id), err)]
    pub async fn insert_request(&self, request: CredentialRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credential_request_status (
                id, payload, status, resubmit_count, created_at, last_resubmitted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(&request.payload)
        .bind(request.status.as_str())
        .bind(request.resubmit_count as i32)
        .bind(request.created_at)
        .bind(request.last_resubmitted_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_request", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_unresolved_page(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialRequest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, status, resubmit_count, created_at, last_resubmitted_at
            FROM credential_request_status
            WHERE status = 'PENDING'
            ORDER BY created_at ASC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unresolved", e))?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            requests.push(decode_request_row(&row)?);
        }
        Ok(requests)
    }

    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn record_resubmission(
        &self,
        id: CredentialRequestId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE credential_request_status
            SET resubmit_count = resubmit_count + 1, last_resubmitted_at = $2
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_resubmitted", e))?;

        // Zero rows means unknown or no longer pending; only the former is an
        // error.
        if result.rows_affected() == 0 && !self.request_exists(id).await? {
            return Err(StoreError::RequestNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn record_resolution(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        // Tolerates unknown ids: events may reference requests this store
        // never tracked.
        sqlx::query("UPDATE credential_request_status SET status = 'RESOLVED' WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_resolved", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn record_abandonment(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE credential_request_status
            SET status = 'ABANDONED'
            WHERE id = $1 AND status <> 'RESOLVED'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_abandoned", e))?;

        if result.rows_affected() == 0 && !self.request_exists(id).await? {
            return Err(StoreError::RequestNotFound(id));
        }
        Ok(())
    }

    pub async fn get_request(
        &self,
        id: CredentialRequestId,
    ) -> Result<Option<CredentialRequest>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, status, resubmit_count, created_at, last_resubmitted_at
            FROM credential_request_status
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_request", e))?;

        row.map(|r| decode_request_row(&r)).transpose()
    }

    pub async fn count_unresolved(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unresolved FROM credential_request_status WHERE status = 'PENDING'",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unresolved_count", e))?;

        let unresolved: i64 = row
            .try_get("unresolved")
            .map_err(|e| StoreError::Decode(format!("failed to read unresolved count: {e}")))?;
        Ok(unresolved.max(0) as u64)
    }

    async fn request_exists(&self, id: CredentialRequestId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM credential_request_status WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("request_exists", e))?;
        Ok(row.is_some())
    }
}

impl RequestStore for PostgresRequestStore {
    fn record_request(&self, request: CredentialRequest) -> Result<(), StoreError> {
        self.runtime.block_on(self.insert_request(request))
    }

    fn fetch_unresolved(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialRequest>, StoreError> {
        self.runtime
            .block_on(self.fetch_unresolved_page(page_size, offset))
    }

    fn mark_resubmitted(
        &self,
        id: CredentialRequestId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.runtime.block_on(self.record_resubmission(id, at))
    }

    fn mark_resolved(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        self.runtime.block_on(self.record_resolution(id))
    }

    fn mark_abandoned(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        self.runtime.block_on(self.record_abandonment(id))
    }

    fn get(&self, id: CredentialRequestId) -> Result<Option<CredentialRequest>, StoreError> {
        self.runtime.block_on(self.get_request(id))
    }

    fn unresolved_count(&self) -> Result<u64, StoreError> {
        self.runtime.block_on(self.count_unresolved())
    }
}

/// Read an event's status inside a transaction, locking the row.
async fn fetch_status_for_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: EventId,
) -> Result<EventStatus, StoreError> {
    let row = sqlx::query("SELECT status FROM credential_event_store WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_status", e))?;

    let row = row.ok_or(StoreError::EventNotFound(id))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| StoreError::Decode(format!("failed to read status: {e}")))?;
    status
        .parse::<EventStatus>()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

/// Map sqlx errors to `StoreError::Unavailable`; store failures are fatal to
/// the current run and never swallowed per item.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode_event_row(row: &sqlx::postgres::PgRow) -> Result<CredentialEvent, StoreError> {
    let id: uuid::Uuid = try_column(row, "id")?;
    let request_id: uuid::Uuid = try_column(row, "request_id")?;
    let payload: serde_json::Value = try_column(row, "payload")?;
    let status: String = try_column(row, "status")?;
    let retry_count: i32 = try_column(row, "retry_count")?;
    let created_at: DateTime<Utc> = try_column(row, "created_at")?;
    let last_attempted_at: Option<DateTime<Utc>> = try_column(row, "last_attempted_at")?;

    Ok(CredentialEvent {
        id: EventId::from_uuid(id),
        request_id: CredentialRequestId::from_uuid(request_id),
        payload,
        status: status
            .parse::<EventStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        retry_count: retry_count.max(0) as u32,
        created_at,
        last_attempted_at,
    })
}

fn decode_request_row(row: &sqlx::postgres::PgRow) -> Result<CredentialRequest, StoreError> {
    let id: uuid::Uuid = try_column(row, "id")?;
    let payload: serde_json::Value = try_column(row, "payload")?;
    let status: String = try_column(row, "status")?;
    let resubmit_count: i32 = try_column(row, "resubmit_count")?;
    let created_at: DateTime<Utc> = try_column(row, "created_at")?;
    let last_resubmitted_at: Option<DateTime<Utc>> = try_column(row, "last_resubmitted_at")?;

    Ok(CredentialRequest {
        id: CredentialRequestId::from_uuid(id),
        payload,
        status: status
            .parse::<RequestStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        resubmit_count: resubmit_count.max(0) as u32,
        created_at,
        last_resubmitted_at,
    })
}

fn decode_identity_row(row: &sqlx::postgres::PgRow) -> Result<IdentityRecord, StoreError> {
    let request_id: uuid::Uuid = try_column(row, "request_id")?;
    let event_id: uuid::Uuid = try_column(row, "event_id")?;
    let identity: serde_json::Value = try_column(row, "identity")?;
    let processed_at: DateTime<Utc> = try_column(row, "processed_at")?;

    Ok(IdentityRecord {
        event_id: EventId::from_uuid(event_id),
        request_id: CredentialRequestId::from_uuid(request_id),
        identity,
        processed_at,
    })
}

fn try_column<'r, T>(row: &'r sqlx::postgres::PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Decode(format!("failed to read {name}: {e}")))
}
