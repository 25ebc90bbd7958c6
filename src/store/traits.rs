//! Unified `Database` trait: single async interface for all persistence.
//!
//! Covers the four kinds of state the pipeline coordinates through: thread
//! locks, the processing watermark, approval records, and the flow event log
//! (plus classifier error captures and Gmail watch bookkeeping).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Storage key for a thread's lock and flow-log parent record.
pub fn thread_key(thread_id: &str) -> String {
    format!("thread_{thread_id}")
}

/// Storage key for a thread's approval record.
pub fn request_key(thread_id: &str) -> String {
    format!("msg_{thread_id}")
}

/// A held thread processing lock.
#[derive(Debug, Clone)]
pub struct LockRecord {
    pub key: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// The last fully processed thread.
#[derive(Debug, Clone)]
pub struct Watermark {
    pub last_thread_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Sent,
    Skipped,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Sent => "sent",
            RequestStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "sent" => Ok(RequestStatus::Sent),
            "skipped" => Ok(RequestStatus::Skipped),
            other => Err(DatabaseError::Serialization(format!(
                "unknown request status '{other}'"
            ))),
        }
    }
}

/// A persisted approval decision for one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub thread_id: String,
    pub subject: String,
    pub chat_id: String,
    pub insured_inferred: bool,
    pub insured_name: String,
    pub holder_inferred: bool,
    pub holder_name: String,
    pub holder_addr_1: String,
    pub holder_addr_2: String,
    pub send_to_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub last_message_id: String,
    /// False for degraded notifications that were stored for audit only.
    pub actionable: bool,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome flag on a flow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Ok,
    Error,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Ok => "ok",
            FlowStatus::Error => "error",
        }
    }
}

/// One step recorded against a thread.
#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub thread_id: String,
    pub service: String,
    pub step: String,
    pub status: FlowStatus,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A classifier reply that could not be used.
#[derive(Debug, Clone)]
pub struct ClassifierErrorRecord {
    pub id: String,
    pub stage: String,
    pub subject: String,
    pub content: String,
    pub llm_response: String,
    pub created_at: DateTime<Utc>,
}

/// Last successful `users.watch` registration for a mailbox.
#[derive(Debug, Clone)]
pub struct WatchState {
    pub user: String,
    pub expiration: i64,
    pub history_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering pipeline coordination state.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Locks ───────────────────────────────────────────────────────

    /// Atomically create a lock row. Returns `true` only when this call
    /// created it. When `stale_before` is set, an existing lock created
    /// earlier than that instant is taken over in the same statement.
    async fn try_create_lock(
        &self,
        key: &str,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    /// Delete a lock row. Deleting a missing lock is not an error.
    async fn delete_lock(&self, key: &str) -> Result<(), DatabaseError>;

    async fn get_lock(&self, key: &str) -> Result<Option<LockRecord>, DatabaseError>;

    // ── Watermark ───────────────────────────────────────────────────

    async fn get_watermark(&self) -> Result<Option<Watermark>, DatabaseError>;

    async fn set_watermark(&self, thread_id: &str) -> Result<(), DatabaseError>;

    // ── Approval records ────────────────────────────────────────────

    /// Insert a pending record, or refresh one that is still pending.
    /// Returns `false` if a terminal record already exists (left untouched).
    async fn upsert_pending_request(&self, request: &PendingRequest)
    -> Result<bool, DatabaseError>;

    async fn get_pending_request(
        &self,
        thread_id: &str,
    ) -> Result<Option<PendingRequest>, DatabaseError>;

    /// Compare-and-set `pending → to` on an actionable record. Returns
    /// `true` only for the caller whose update changed the row.
    async fn transition_request(
        &self,
        thread_id: &str,
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Flow event log ──────────────────────────────────────────────

    async fn append_flow_event(&self, event: &FlowEvent) -> Result<(), DatabaseError>;

    /// Events for a thread in write order.
    async fn list_flow_events(&self, thread_id: &str) -> Result<Vec<FlowEvent>, DatabaseError>;

    /// Services that have touched a thread, in first-seen order.
    async fn list_flow_services(&self, thread_id: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Classifier errors ───────────────────────────────────────────

    async fn record_classifier_error(
        &self,
        record: &ClassifierErrorRecord,
    ) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn list_classifier_errors(
        &self,
        limit: usize,
    ) -> Result<Vec<ClassifierErrorRecord>, DatabaseError>;

    // ── Gmail watch ─────────────────────────────────────────────────

    async fn save_watch_state(
        &self,
        user: &str,
        expiration: i64,
        history_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_watch_state(&self, user: &str) -> Result<Option<WatchState>, DatabaseError>;
}
