//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as fixed-width RFC 3339 (microseconds, `Z`) so string comparison in SQL
//! matches chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ClassifierErrorRecord, Database, FlowEvent, FlowStatus, LockRecord, PendingRequest,
    RequestStatus, Watermark, WatchState, request_key, thread_key,
};

/// Singleton id of the processing watermark row.
const WATERMARK_ID: &str = "last_processed";

const REQUEST_COLUMNS: &str = "thread_id, subject, chat_id, insured_inferred, insured_name, \
     holder_inferred, holder_name, holder_addr_1, holder_addr_2, send_to_email, \
     to_emails, cc_emails, last_message_id, actionable, status, created_at, resolved_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn encode_list(list: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(list).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Map a libsql Row to a PendingRequest. Column order matches REQUEST_COLUMNS.
fn row_to_request(row: &libsql::Row) -> Result<PendingRequest, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("row_to_request: {e}"));
    let status: String = row.get(14).map_err(map)?;
    let created_at: String = row.get(15).map_err(map)?;
    let resolved_at: Option<String> = row.get(16).map_err(map)?;
    let to_emails: String = row.get(10).map_err(map)?;
    let cc_emails: String = row.get(11).map_err(map)?;

    Ok(PendingRequest {
        thread_id: row.get(0).map_err(map)?,
        subject: row.get(1).map_err(map)?,
        chat_id: row.get(2).map_err(map)?,
        insured_inferred: row.get::<i64>(3).map_err(map)? != 0,
        insured_name: row.get(4).map_err(map)?,
        holder_inferred: row.get::<i64>(5).map_err(map)? != 0,
        holder_name: row.get(6).map_err(map)?,
        holder_addr_1: row.get(7).map_err(map)?,
        holder_addr_2: row.get(8).map_err(map)?,
        send_to_email: row.get(9).map_err(map)?,
        to_emails: decode_list(&to_emails),
        cc_emails: decode_list(&cc_emails),
        last_message_id: row.get(12).map_err(map)?,
        actionable: row.get::<i64>(13).map_err(map)? != 0,
        status: status.parse()?,
        created_at: parse_datetime(&created_at),
        resolved_at: resolved_at.as_deref().map(parse_datetime),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Locks ───────────────────────────────────────────────────────

    async fn try_create_lock(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        // An empty cutoff never compares greater than a stored timestamp,
        // so without a lease the conflict branch is a no-op.
        let cutoff = stale_before.map(ts).unwrap_or_default();
        let changed = self
            .conn()
            .execute(
                "INSERT INTO thread_locks (id, status, created_at) VALUES (?1, 'processing', ?2)
                 ON CONFLICT (id) DO UPDATE SET created_at = excluded.created_at
                 WHERE thread_locks.created_at < ?3",
                params![key, ts(now), cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_create_lock: {e}")))?;

        debug!(key, acquired = changed == 1, "Lock create attempted");
        Ok(changed == 1)
    }

    async fn delete_lock(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM thread_locks WHERE id = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_lock: {e}")))?;
        Ok(())
    }

    async fn get_lock(&self, key: &str) -> Result<Option<LockRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, status, created_at FROM thread_locks WHERE id = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lock: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let map = |e: libsql::Error| DatabaseError::Query(format!("get_lock: {e}"));
                let created_at: String = row.get(2).map_err(map)?;
                Ok(Some(LockRecord {
                    key: row.get(0).map_err(map)?,
                    status: row.get(1).map_err(map)?,
                    created_at: parse_datetime(&created_at),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lock: {e}"))),
        }
    }

    // ── Watermark ───────────────────────────────────────────────────

    async fn get_watermark(&self) -> Result<Option<Watermark>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_thread_id, updated_at FROM processing_state WHERE id = ?1",
                params![WATERMARK_ID],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_watermark: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let map = |e: libsql::Error| DatabaseError::Query(format!("get_watermark: {e}"));
                let updated_at: String = row.get(1).map_err(map)?;
                Ok(Some(Watermark {
                    last_thread_id: row.get(0).map_err(map)?,
                    updated_at: parse_datetime(&updated_at),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_watermark: {e}"))),
        }
    }

    async fn set_watermark(&self, thread_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO processing_state (id, last_thread_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET
                    last_thread_id = excluded.last_thread_id,
                    updated_at = excluded.updated_at",
                params![WATERMARK_ID, thread_id, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_watermark: {e}")))?;
        debug!(thread_id, "Watermark advanced");
        Ok(())
    }

    // ── Approval records ────────────────────────────────────────────

    async fn upsert_pending_request(
        &self,
        request: &PendingRequest,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO pending_requests (id, {REQUEST_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 'pending', ?16, NULL)
                     ON CONFLICT (id) DO UPDATE SET
                        subject = excluded.subject,
                        chat_id = excluded.chat_id,
                        insured_inferred = excluded.insured_inferred,
                        insured_name = excluded.insured_name,
                        holder_inferred = excluded.holder_inferred,
                        holder_name = excluded.holder_name,
                        holder_addr_1 = excluded.holder_addr_1,
                        holder_addr_2 = excluded.holder_addr_2,
                        send_to_email = excluded.send_to_email,
                        to_emails = excluded.to_emails,
                        cc_emails = excluded.cc_emails,
                        last_message_id = excluded.last_message_id,
                        actionable = excluded.actionable,
                        created_at = excluded.created_at
                     WHERE pending_requests.status = 'pending'"
                ),
                params![
                    request_key(&request.thread_id),
                    request.thread_id.as_str(),
                    request.subject.as_str(),
                    request.chat_id.as_str(),
                    request.insured_inferred as i64,
                    request.insured_name.as_str(),
                    request.holder_inferred as i64,
                    request.holder_name.as_str(),
                    request.holder_addr_1.as_str(),
                    request.holder_addr_2.as_str(),
                    request.send_to_email.as_str(),
                    encode_list(&request.to_emails)?,
                    encode_list(&request.cc_emails)?,
                    request.last_message_id.as_str(),
                    request.actionable as i64,
                    ts(request.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_pending_request: {e}")))?;

        debug!(thread_id = %request.thread_id, stored = changed == 1, "Approval record upsert");
        Ok(changed == 1)
    }

    async fn get_pending_request(
        &self,
        thread_id: &str,
    ) -> Result<Option<PendingRequest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REQUEST_COLUMNS} FROM pending_requests WHERE id = ?1"),
                params![request_key(thread_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_pending_request: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_request(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_pending_request: {e}"))),
        }
    }

    async fn transition_request(
        &self,
        thread_id: &str,
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        if !to.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "transition_request: {to} is not a terminal status"
            )));
        }
        let changed = self
            .conn()
            .execute(
                "UPDATE pending_requests SET status = ?1, resolved_at = ?2
                 WHERE id = ?3 AND status = 'pending' AND actionable = 1",
                params![to.as_str(), ts(at), request_key(thread_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_request: {e}")))?;
        Ok(changed == 1)
    }

    // ── Flow event log ──────────────────────────────────────────────

    async fn append_flow_event(&self, event: &FlowEvent) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let flow_id = thread_key(&event.thread_id);
        let at = ts(event.created_at);

        conn.execute(
            "INSERT INTO flow_threads (id, thread_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (id) DO UPDATE SET updated_at = excluded.updated_at",
            params![flow_id.as_str(), event.thread_id.as_str(), at.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_flow_event (thread): {e}")))?;

        conn.execute(
            "INSERT OR IGNORE INTO flow_thread_services (flow_id, service, first_seen_at)
             VALUES (?1, ?2, ?3)",
            params![flow_id.as_str(), event.service.as_str(), at.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_flow_event (service): {e}")))?;

        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO flow_events (id, flow_id, service, step, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                flow_id.as_str(),
                event.service.as_str(),
                event.step.as_str(),
                event.status.as_str(),
                payload,
                at,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_flow_event: {e}")))?;
        Ok(())
    }

    async fn list_flow_events(&self, thread_id: &str) -> Result<Vec<FlowEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT service, step, status, payload, created_at FROM flow_events
                 WHERE flow_id = ?1 ORDER BY seq",
                params![thread_key(thread_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_flow_events: {e}")))?;

        let map = |e: libsql::Error| DatabaseError::Query(format!("list_flow_events: {e}"));
        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(map)? {
            let status: String = row.get(2).map_err(map)?;
            let payload: String = row.get(3).map_err(map)?;
            let created_at: String = row.get(4).map_err(map)?;
            events.push(FlowEvent {
                thread_id: thread_id.to_string(),
                service: row.get(0).map_err(map)?,
                step: row.get(1).map_err(map)?,
                status: if status == "error" {
                    FlowStatus::Error
                } else {
                    FlowStatus::Ok
                },
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                created_at: parse_datetime(&created_at),
            });
        }
        Ok(events)
    }

    async fn list_flow_services(&self, thread_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT service FROM flow_thread_services WHERE flow_id = ?1 ORDER BY rowid",
                params![thread_key(thread_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_flow_services: {e}")))?;

        let map = |e: libsql::Error| DatabaseError::Query(format!("list_flow_services: {e}"));
        let mut services = Vec::new();
        while let Some(row) = rows.next().await.map_err(map)? {
            services.push(row.get(0).map_err(map)?);
        }
        Ok(services)
    }

    // ── Classifier errors ───────────────────────────────────────────

    async fn record_classifier_error(
        &self,
        record: &ClassifierErrorRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO classifier_errors
                    (id, stage, subject, content, llm_response, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.as_str(),
                    record.stage.as_str(),
                    record.subject.as_str(),
                    record.content.as_str(),
                    record.llm_response.as_str(),
                    ts(record.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_classifier_error: {e}")))?;
        Ok(())
    }

    async fn list_classifier_errors(
        &self,
        limit: usize,
    ) -> Result<Vec<ClassifierErrorRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, stage, subject, content, llm_response, created_at
                 FROM classifier_errors ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_classifier_errors: {e}")))?;

        let map = |e: libsql::Error| DatabaseError::Query(format!("list_classifier_errors: {e}"));
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(map)? {
            let created_at: String = row.get(5).map_err(map)?;
            records.push(ClassifierErrorRecord {
                id: row.get(0).map_err(map)?,
                stage: row.get(1).map_err(map)?,
                subject: row.get(2).map_err(map)?,
                content: row.get(3).map_err(map)?,
                llm_response: row.get(4).map_err(map)?,
                created_at: parse_datetime(&created_at),
            });
        }
        Ok(records)
    }

    // ── Gmail watch ─────────────────────────────────────────────────

    async fn save_watch_state(
        &self,
        user: &str,
        expiration: i64,
        history_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO watch_state (mailbox, expiration, history_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (mailbox) DO UPDATE SET
                    expiration = excluded.expiration,
                    history_id = excluded.history_id,
                    updated_at = excluded.updated_at",
                params![user, expiration, history_id, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_watch_state: {e}")))?;
        Ok(())
    }

    async fn get_watch_state(&self, user: &str) -> Result<Option<WatchState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT mailbox, expiration, history_id, updated_at FROM watch_state
                 WHERE mailbox = ?1",
                params![user],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_watch_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let map = |e: libsql::Error| DatabaseError::Query(format!("get_watch_state: {e}"));
                let updated_at: String = row.get(3).map_err(map)?;
                Ok(Some(WatchState {
                    user: row.get(0).map_err(map)?,
                    expiration: row.get(1).map_err(map)?,
                    history_id: row.get(2).map_err(map)?,
                    updated_at: parse_datetime(&updated_at),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_watch_state: {e}"))),
        }
    }
}
