//! Best-effort writer for the per-thread flow event log.

use std::sync::Arc;

use chrono::Utc;

use crate::store::{Database, FlowEvent, FlowStatus};

/// Records pipeline steps against a thread. Write failures are logged and
/// swallowed: the log is for observability and must never fail a handler.
#[derive(Clone)]
pub struct FlowLog {
    db: Arc<dyn Database>,
}

impl FlowLog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn ok(&self, thread_id: &str, service: &str, step: &str, payload: serde_json::Value) {
        self.record(thread_id, service, step, FlowStatus::Ok, payload).await;
    }

    pub async fn error(&self, thread_id: &str, service: &str, step: &str, error: &str) {
        self.record(
            thread_id,
            service,
            step,
            FlowStatus::Error,
            serde_json::json!({ "error": error }),
        )
        .await;
    }

    async fn record(
        &self,
        thread_id: &str,
        service: &str,
        step: &str,
        status: FlowStatus,
        payload: serde_json::Value,
    ) {
        let event = FlowEvent {
            thread_id: thread_id.to_string(),
            service: service.to_string(),
            step: step.to_string(),
            status,
            payload,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.append_flow_event(&event).await {
            tracing::warn!(thread_id, step, error = %e, "Failed to append flow event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn records_ok_and_error_events_in_order() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let flow = FlowLog::new(Arc::clone(&db));

        flow.ok("T1", "ingest", "message_fetched", serde_json::json!({ "subject": "COI" }))
            .await;
        flow.error("T1", "classifier", "classify", "timeout").await;

        let events = db.list_flow_events("T1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, "message_fetched");
        assert_eq!(events[0].status, FlowStatus::Ok);
        assert_eq!(events[1].status, FlowStatus::Error);
        assert_eq!(events[1].payload["error"], "timeout");
        assert_eq!(
            db.list_flow_services("T1").await.unwrap(),
            vec!["ingest", "classifier"]
        );
    }
}
