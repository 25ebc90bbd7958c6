//! Mailbox push-notification handler.
//!
//! Per notification: resolve the newest thread, skip it if it matches the
//! watermark, take the thread lock, read the newest message, run the
//! classifier under a timeout, then advance the watermark. Failures are
//! logged and recorded as flow events, never returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::channels::gmail::decode_base64url;
use crate::channels::{Mailbox, MessageRef, ParsedEmail};
use crate::error::{ChannelError, PipelineError};
use crate::pipeline::flow::FlowLog;
use crate::pipeline::lock::ThreadLocks;
use crate::pipeline::service::CoiService;
use crate::pipeline::types::AnalyzeRequest;
use crate::store::Database;

const SERVICE: &str = "ingest";

/// Pub/Sub push envelope.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
}

/// Decoded mailbox notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MailboxNotification {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(default, rename = "historyId", deserialize_with = "history_id")]
    pub history_id: Option<String>,
}

fn history_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// `Ok(None)` for an envelope without data; `Err` for anything malformed.
pub fn decode_envelope(body: &[u8]) -> Result<Option<MailboxNotification>, ChannelError> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| ChannelError::InvalidMessage(format!("invalid push envelope: {e}")))?;
    let Some(data) = envelope.message.data.filter(|d| !d.trim().is_empty()) else {
        return Ok(None);
    };
    let decoded = STANDARD
        .decode(data.trim())
        .or_else(|_| decode_base64url(&data))?;
    let notification = serde_json::from_slice(&decoded)
        .map_err(|e| ChannelError::InvalidMessage(format!("invalid notification payload: {e}")))?;
    Ok(Some(notification))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    UnknownMailbox,
    NoThreads,
    AlreadyProcessed { thread_id: String },
    Locked { thread_id: String },
    Processed { thread_id: String, is_request: bool },
    Failed { thread_id: Option<String> },
}

pub struct IngestHandler {
    mailbox: Arc<dyn Mailbox>,
    db: Arc<dyn Database>,
    locks: ThreadLocks,
    service: Arc<CoiService>,
    flow: FlowLog,
    user: String,
    scan_window: usize,
    classifier_timeout: Duration,
}

impl IngestHandler {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        db: Arc<dyn Database>,
        service: Arc<CoiService>,
        user: impl Into<String>,
        scan_window: usize,
        classifier_timeout: Duration,
        lock_lease: Option<Duration>,
    ) -> Self {
        Self {
            locks: ThreadLocks::new(Arc::clone(&db), lock_lease),
            flow: FlowLog::new(Arc::clone(&db)),
            mailbox,
            db,
            service,
            user: user.into(),
            scan_window: scan_window.max(1),
            classifier_timeout,
        }
    }

    pub async fn handle(&self, notification: &MailboxNotification) -> IngestOutcome {
        if !notification.email_address.eq_ignore_ascii_case(&self.user) {
            warn!(mailbox = %notification.email_address, "Notification for an unwatched mailbox");
            return IngestOutcome::UnknownMailbox;
        }

        let thread_id = match self.latest_thread().await {
            Ok(Some(thread_id)) => thread_id,
            Ok(None) => {
                info!("Inbox has no threads");
                return IngestOutcome::NoThreads;
            }
            Err(e) => {
                error!(error = %e, "Failed to resolve latest thread");
                return IngestOutcome::Failed { thread_id: None };
            }
        };

        match self.db.get_watermark().await {
            Ok(Some(mark)) if mark.last_thread_id == thread_id => {
                info!(thread_id = %thread_id, "Thread already processed");
                return IngestOutcome::AlreadyProcessed { thread_id };
            }
            Ok(_) => {}
            Err(e) => {
                error!(thread_id = %thread_id, error = %e, "Failed to read watermark");
                return IngestOutcome::Failed {
                    thread_id: Some(thread_id),
                };
            }
        }

        match self.locks.with_lock(&thread_id, self.process(&thread_id)).await {
            Ok(Some(is_request)) => IngestOutcome::Processed {
                thread_id,
                is_request,
            },
            Ok(None) => {
                warn!(thread_id = %thread_id, "Thread is locked by another handler");
                IngestOutcome::Locked { thread_id }
            }
            Err(e) => {
                error!(thread_id = %thread_id, error = %e, "Ingest failed");
                self.flow.error(&thread_id, SERVICE, "process", &e.to_string()).await;
                IngestOutcome::Failed {
                    thread_id: Some(thread_id),
                }
            }
        }
    }

    /// Thread whose newest message is newest across the scan window. Ties
    /// go to the thread listed first.
    async fn latest_thread(&self) -> Result<Option<String>, PipelineError> {
        let threads = self
            .mailbox
            .list_recent_threads(self.scan_window)
            .await
            .map_err(|e| PipelineError::MailboxFetch(e.to_string()))?;

        let mut best: Option<(i64, String)> = None;
        for thread_id in threads {
            let messages = self
                .mailbox
                .thread_messages(&thread_id)
                .await
                .map_err(|e| PipelineError::MailboxFetch(e.to_string()))?;
            let Some(newest) = messages.iter().map(|m| m.internal_date).max() else {
                continue;
            };
            if best.as_ref().is_none_or(|(date, _)| newest > *date) {
                best = Some((newest, thread_id));
            }
        }
        Ok(best.map(|(_, thread_id)| thread_id))
    }

    async fn process(&self, thread_id: &str) -> Result<bool, PipelineError> {
        let messages = self
            .mailbox
            .thread_messages(thread_id)
            .await
            .map_err(|e| PipelineError::MailboxFetch(e.to_string()))?;
        let newest = newest_message(&messages)
            .ok_or_else(|| PipelineError::MailboxFetch(format!("thread {thread_id} has no messages")))?;

        let raw = self
            .mailbox
            .fetch_raw_message(&newest.id)
            .await
            .map_err(|e| PipelineError::MailboxFetch(e.to_string()))?;
        let email = ParsedEmail::from_raw(&raw)?;
        self.flow
            .ok(
                thread_id,
                SERVICE,
                "message_fetched",
                serde_json::json!({
                    "message_id": email.message_id,
                    "subject": email.subject,
                    "from": email.from,
                }),
            )
            .await;

        let request = AnalyzeRequest {
            thread_id: thread_id.to_string(),
            subject: email.subject,
            body_text: email.body_text,
            to_emails: email.to,
            cc_emails: email.cc,
            from_email: email.from,
            last_message_id: email.message_id,
        };

        let analysis = tokio::time::timeout(self.classifier_timeout, self.service.analyze(&request))
            .await
            .map_err(|_| PipelineError::Timeout {
                step: "classifier".into(),
                timeout: self.classifier_timeout,
            })??;

        self.db.set_watermark(thread_id).await?;
        self.flow
            .ok(
                thread_id,
                SERVICE,
                "completed",
                serde_json::json!({ "is_request": analysis.is_request() }),
            )
            .await;
        info!(thread_id, is_request = analysis.is_request(), "Thread processed");
        Ok(analysis.is_request())
    }
}

/// Latest by internal date; ties go to the later entry in thread order.
fn newest_message(messages: &[MessageRef]) -> Option<&MessageRef> {
    messages.iter().max_by_key(|m| m.internal_date)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::channels::{Mailbox, MessageRef, RawMessage, WatchRegistration};
    use crate::error::ChannelError;

    /// In-memory mailbox. Threads are listed in insertion order.
    #[derive(Default)]
    pub struct FakeMailbox {
        pub threads: Mutex<Vec<(String, Vec<MessageRef>)>>,
        pub raw: Mutex<HashMap<String, RawMessage>>,
        pub watch_calls: Mutex<Vec<String>>,
        pub fail_listing: bool,
    }

    impl FakeMailbox {
        pub fn add_message(&self, thread_id: &str, id: &str, internal_date: i64, rfc822: &str) {
            let mut threads = self.threads.lock().unwrap();
            let message = MessageRef {
                id: id.to_string(),
                thread_id: thread_id.to_string(),
                internal_date,
            };
            match threads.iter_mut().find(|(t, _)| t == thread_id) {
                Some((_, messages)) => messages.push(message),
                None => threads.push((thread_id.to_string(), vec![message])),
            }
            self.raw.lock().unwrap().insert(
                id.to_string(),
                RawMessage {
                    id: id.to_string(),
                    thread_id: thread_id.to_string(),
                    raw: rfc822.replace('\n', "\r\n").into_bytes(),
                    snippet: String::new(),
                },
            );
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn list_recent_threads(&self, max: usize) -> Result<Vec<String>, ChannelError> {
            if self.fail_listing {
                return Err(ChannelError::RequestFailed {
                    name: "fake".into(),
                    reason: "503".into(),
                });
            }
            Ok(self
                .threads
                .lock()
                .unwrap()
                .iter()
                .take(max)
                .map(|(t, _)| t.clone())
                .collect())
        }

        async fn thread_messages(&self, thread_id: &str) -> Result<Vec<MessageRef>, ChannelError> {
            Ok(self
                .threads
                .lock()
                .unwrap()
                .iter()
                .find(|(t, _)| t == thread_id)
                .map(|(_, m)| m.clone())
                .unwrap_or_default())
        }

        async fn fetch_raw_message(&self, message_id: &str) -> Result<RawMessage, ChannelError> {
            self.raw
                .lock()
                .unwrap()
                .get(message_id)
                .cloned()
                .ok_or_else(|| ChannelError::RequestFailed {
                    name: "fake".into(),
                    reason: format!("no message {message_id}"),
                })
        }

        async fn watch(&self, topic: &str) -> Result<WatchRegistration, ChannelError> {
            self.watch_calls.lock().unwrap().push(topic.to_string());
            Ok(WatchRegistration {
                history_id: "9001".into(),
                expiration: 1_900_000_000_000,
            })
        }
    }
}
