//! Human approval gate.
//!
//! Each positive classification stores a `pending` record under
//! `msg_<thread_id>` and prompts a human with Send / Don't send buttons.
//! A button press resolves the record to `sent` or `skipped` through a
//! conditional update, so only one press ever triggers fulfillment.
//! Records with an uninferred insured or holder are stored for audit with
//! no buttons; they cannot be resolved.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::channels::telegram::CallbackQuery;
use crate::channels::{ApprovalNotifier, InlineButton};
use crate::error::PipelineError;
use crate::pipeline::flow::FlowLog;
use crate::pipeline::types::{ApprovalRequest, GenerateRequest};
use crate::store::{Database, PendingRequest, RequestStatus};

const SERVICE: &str = "approval";
pub const ALREADY_PROCESSED: &str = "Request is already processed";

/// Runs generation and delivery for an approved request.
#[async_trait]
pub trait CoiFulfillment: Send + Sync {
    async fn fulfill(&self, request: GenerateRequest) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Send,
    NoSend,
}

impl Decision {
    /// Parse `send:<thread_id>` / `nosend:<thread_id>`.
    pub fn parse_callback(data: &str) -> Option<(Decision, &str)> {
        let (action, thread_id) = data.split_once(':')?;
        let decision = match action {
            "send" => Decision::Send,
            "nosend" => Decision::NoSend,
            _ => return None,
        };
        let thread_id = thread_id.trim();
        (!thread_id.is_empty()).then_some((decision, thread_id))
    }

    pub fn callback_data(&self, thread_id: &str) -> String {
        match self {
            Decision::Send => format!("send:{thread_id}"),
            Decision::NoSend => format!("nosend:{thread_id}"),
        }
    }

    fn target(&self) -> RequestStatus {
        match self {
            Decision::Send => RequestStatus::Sent,
            Decision::NoSend => RequestStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Actionable prompt with buttons sent.
    Prompted,
    /// Manual-handling notice sent; the record cannot be resolved.
    Degraded,
    /// The thread was already resolved; nothing stored or sent.
    AlreadyResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Sent,
    Skipped,
    AlreadyResolved,
    NotFound,
    NotActionable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Resolved(ResolveOutcome),
    Unauthorized,
    Unrecognized,
}

pub struct ApprovalGate {
    db: Arc<dyn Database>,
    notifier: Arc<dyn ApprovalNotifier>,
    fulfillment: Arc<dyn CoiFulfillment>,
    flow: FlowLog,
    default_chat_id: String,
    notify_timeout: Duration,
}

impl ApprovalGate {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: Arc<dyn ApprovalNotifier>,
        fulfillment: Arc<dyn CoiFulfillment>,
        default_chat_id: impl Into<String>,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            flow: FlowLog::new(Arc::clone(&db)),
            db,
            notifier,
            fulfillment,
            default_chat_id: default_chat_id.into(),
            notify_timeout,
        }
    }

    pub fn default_chat_id(&self) -> &str {
        &self.default_chat_id
    }

    /// Store the pending record and notify the approver.
    pub async fn open(&self, request: ApprovalRequest) -> Result<OpenOutcome, PipelineError> {
        let thread_id = request.thread_id.clone();
        let chat_id = if request.chat_id.trim().is_empty() {
            self.default_chat_id.clone()
        } else {
            request.chat_id.clone()
        };
        let actionable = request.fields.is_complete();

        let record = PendingRequest {
            thread_id: thread_id.clone(),
            subject: request.subject.clone(),
            chat_id: chat_id.clone(),
            insured_inferred: request.fields.insured_inferred,
            insured_name: request.fields.insured_name.clone(),
            holder_inferred: request.fields.holder_inferred,
            holder_name: request.fields.holder_name.clone(),
            holder_addr_1: request.fields.holder_addr_1.clone(),
            holder_addr_2: request.fields.holder_addr_2.clone(),
            send_to_email: request.fields.send_to_email.clone(),
            to_emails: request.to_emails.clone(),
            cc_emails: request.cc_emails.clone(),
            last_message_id: request.last_message_id.clone(),
            actionable,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };

        if !self.db.upsert_pending_request(&record).await? {
            info!(thread_id = %thread_id, "Approval already resolved, not prompting again");
            return Ok(OpenOutcome::AlreadyResolved);
        }
        self.flow
            .ok(
                &thread_id,
                SERVICE,
                "record_stored",
                serde_json::json!({ "actionable": actionable, "insured_name": record.insured_name }),
            )
            .await;

        let text = prompt_text(&request);
        let sent = if actionable {
            let buttons = [
                InlineButton {
                    text: "✅ Send".into(),
                    callback_data: Decision::Send.callback_data(&thread_id),
                },
                InlineButton {
                    text: "🚫 Don't send".into(),
                    callback_data: Decision::NoSend.callback_data(&thread_id),
                },
            ];
            self.bounded("notify", self.notifier.send_with_buttons(&chat_id, &text, &buttons))
                .await
        } else {
            self.bounded("notify", self.notifier.send_text(&chat_id, &text)).await
        };

        if let Err(e) = sent {
            self.flow.error(&thread_id, SERVICE, "notify", &e.to_string()).await;
            return Err(e);
        }

        let outcome = if actionable {
            OpenOutcome::Prompted
        } else {
            OpenOutcome::Degraded
        };
        info!(thread_id = %thread_id, outcome = ?outcome, "Approval prompt sent");
        self.flow
            .ok(&thread_id, SERVICE, "notify", serde_json::json!({ "outcome": format!("{outcome:?}") }))
            .await;
        Ok(outcome)
    }

    /// Apply a decision. Only the caller whose update moves the record out
    /// of `pending` runs fulfillment; every other caller is a no-op.
    /// Confirmations go to `reply_chat_id`.
    pub async fn resolve(
        &self,
        thread_id: &str,
        decision: Decision,
        reply_chat_id: &str,
    ) -> Result<ResolveOutcome, PipelineError> {
        let Some(record) = self.db.get_pending_request(thread_id).await? else {
            warn!(thread_id, "Decision for unknown thread");
            self.confirm(reply_chat_id, ALREADY_PROCESSED).await;
            return Ok(ResolveOutcome::NotFound);
        };
        if record.status.is_terminal() {
            info!(thread_id, status = %record.status, "Decision for already resolved thread");
            self.confirm(reply_chat_id, ALREADY_PROCESSED).await;
            return Ok(ResolveOutcome::AlreadyResolved);
        }
        if !record.actionable {
            warn!(thread_id, "Decision for a record that needs manual handling");
            self.confirm(reply_chat_id, ALREADY_PROCESSED).await;
            return Ok(ResolveOutcome::NotActionable);
        }

        if !self
            .db
            .transition_request(thread_id, decision.target(), Utc::now())
            .await?
        {
            info!(thread_id, "Lost the race to resolve, another decision won");
            self.confirm(reply_chat_id, ALREADY_PROCESSED).await;
            return Ok(ResolveOutcome::AlreadyResolved);
        }

        let label = if record.subject.trim().is_empty() {
            thread_id
        } else {
            record.subject.as_str()
        };
        self.flow
            .ok(
                thread_id,
                SERVICE,
                "resolved",
                serde_json::json!({ "status": decision.target().as_str() }),
            )
            .await;

        match decision {
            Decision::NoSend => {
                info!(thread_id, "COI skipped by approver");
                self.confirm(reply_chat_id, &format!("🚫 Skipped COI for:\n*{label}*"))
                    .await;
                Ok(ResolveOutcome::Skipped)
            }
            Decision::Send => {
                info!(thread_id, "COI approved, fulfilling");
                self.confirm(reply_chat_id, &format!("✅ Sending COI for:\n*{label}*"))
                    .await;
                // Approval stands even if fulfillment fails.
                if let Err(e) = self.fulfillment.fulfill(generate_request(&record)).await {
                    error!(thread_id, error = %e, "Fulfillment failed after approval");
                    self.flow.error(thread_id, SERVICE, "fulfill", &e.to_string()).await;
                }
                Ok(ResolveOutcome::Sent)
            }
        }
    }

    /// Handle an inline button press end to end.
    pub async fn handle_callback(
        &self,
        callback: &CallbackQuery,
    ) -> Result<CallbackOutcome, PipelineError> {
        if let Err(e) = self
            .bounded("answer_callback", self.notifier.answer_callback(&callback.id))
            .await
        {
            warn!(callback_id = %callback.id, error = %e, "Failed to answer callback query");
        }

        let identities = callback.from.identities();
        let identities: Vec<&str> = identities.iter().map(String::as_str).collect();
        if !self.notifier.is_any_user_allowed(&identities) {
            warn!(user_id = callback.from.id, "Approval from user not on the allowlist");
            return Ok(CallbackOutcome::Unauthorized);
        }

        let Some((decision, thread_id)) = callback.data.as_deref().and_then(Decision::parse_callback)
        else {
            warn!(data = ?callback.data, "Unrecognized callback data");
            return Ok(CallbackOutcome::Unrecognized);
        };

        let reply_chat_id = callback.from.id.to_string();
        let outcome = self.resolve(thread_id, decision, &reply_chat_id).await?;
        Ok(CallbackOutcome::Resolved(outcome))
    }

    async fn confirm(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.bounded("confirm", self.notifier.send_text(chat_id, text)).await {
            warn!(chat_id, error = %e, "Failed to send confirmation");
        }
    }

    async fn bounded<F>(&self, step: &str, call: F) -> Result<(), PipelineError>
    where
        F: Future<Output = Result<(), crate::error::ChannelError>>,
    {
        match tokio::time::timeout(self.notify_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PipelineError::Notification(e.to_string())),
            Err(_) => Err(PipelineError::Timeout {
                step: step.to_string(),
                timeout: self.notify_timeout,
            }),
        }
    }
}

fn prompt_text(request: &ApprovalRequest) -> String {
    let mut text = format!("Email likely a COI request:\n*{}*", request.subject);
    if !request.fields.insured_inferred {
        text.push_str("\n\n🚨 Could not infer insured name, please check manually");
    } else if !request.fields.holder_inferred {
        text.push_str("\n\n🚨 Could not infer holder name, please check manually");
    }
    text
}

fn generate_request(record: &PendingRequest) -> GenerateRequest {
    GenerateRequest {
        insured_name: record.insured_name.clone(),
        holder_name: record.holder_name.clone(),
        holder_addr_1: record.holder_addr_1.clone(),
        holder_addr_2: record.holder_addr_2.clone(),
        send_to_email: record.send_to_email.clone(),
        to_emails: record.to_emails.clone(),
        cc_emails: record.cc_emails.clone(),
        last_message_id: record.last_message_id.clone(),
        thread_id: record.thread_id.clone(),
        subject_text: record.subject.clone(),
        body_text: String::new(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingFulfillment, RecordingNotifier};
    use super::*;
    use crate::channels::telegram::TelegramUser;
    use crate::pipeline::types::ExtractedFields;
    use crate::store::LibSqlBackend;

    struct Harness {
        gate: Arc<ApprovalGate>,
        db: Arc<dyn Database>,
        notifier: Arc<RecordingNotifier>,
        fulfillment: Arc<RecordingFulfillment>,
    }

    async fn harness_with(notifier: RecordingNotifier, fulfillment: RecordingFulfillment) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let notifier = Arc::new(notifier);
        let fulfillment = Arc::new(fulfillment);
        let gate = Arc::new(ApprovalGate::new(
            Arc::clone(&db),
            notifier.clone(),
            fulfillment.clone(),
            "42",
            Duration::from_secs(5),
        ));
        Harness {
            gate,
            db,
            notifier,
            fulfillment,
        }
    }

    async fn harness() -> Harness {
        harness_with(RecordingNotifier::default(), RecordingFulfillment::default()).await
    }

    fn request(insured: bool, holder: bool) -> ApprovalRequest {
        ApprovalRequest {
            thread_id: "T1".into(),
            subject: "URGENT need COI".into(),
            chat_id: String::new(),
            fields: ExtractedFields {
                insured_inferred: insured,
                insured_name: if insured { "RAPID TRUCKING INC".into() } else { String::new() },
                holder_inferred: holder,
                holder_name: if holder { "Acme Logistics".into() } else { String::new() },
                holder_addr_1: "123 Main St".into(),
                holder_addr_2: "Springfield, IL 60001".into(),
                send_to_email: "certs@acme.example".into(),
            },
            to_emails: vec!["agent@broker.example".into()],
            cc_emails: vec![],
            last_message_id: "<m1@acme.example>".into(),
        }
    }

    fn press(data: &str) -> CallbackQuery {
        CallbackQuery {
            id: "cb-1".into(),
            from: TelegramUser {
                id: 7,
                username: Some("approver".into()),
            },
            data: Some(data.into()),
        }
    }

    #[test]
    fn callback_data_round_trip() {
        assert_eq!(Decision::parse_callback("send:T1"), Some((Decision::Send, "T1")));
        assert_eq!(Decision::parse_callback("nosend:T1"), Some((Decision::NoSend, "T1")));
        assert_eq!(Decision::parse_callback("maybe:T1"), None);
        assert_eq!(Decision::parse_callback("send:"), None);
        assert_eq!(Decision::parse_callback("send"), None);
        assert_eq!(Decision::Send.callback_data("T9"), "send:T9");
    }

    #[tokio::test]
    async fn complete_fields_prompt_with_buttons() {
        let h = harness().await;
        assert_eq!(h.gate.open(request(true, true)).await.unwrap(), OpenOutcome::Prompted);

        let notices = h.notifier.notices.lock().unwrap().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].chat_id, "42");
        assert_eq!(notices[0].text, "Email likely a COI request:\n*URGENT need COI*");
        assert_eq!(notices[0].buttons[0].callback_data, "send:T1");
        assert_eq!(notices[0].buttons[1].callback_data, "nosend:T1");

        let record = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert!(record.actionable);
    }

    #[tokio::test]
    async fn missing_names_send_degraded_notice() {
        let h = harness().await;
        assert_eq!(h.gate.open(request(false, true)).await.unwrap(), OpenOutcome::Degraded);
        let h2 = harness().await;
        assert_eq!(h2.gate.open(request(true, false)).await.unwrap(), OpenOutcome::Degraded);

        let notice = h.notifier.notices.lock().unwrap()[0].clone();
        assert!(notice.buttons.is_empty());
        assert!(notice.text.ends_with("Could not infer insured name, please check manually"));
        assert!(h2.notifier.texts()[0].ends_with("Could not infer holder name, please check manually"));

        let record = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert!(!record.actionable);
        assert_eq!(
            h.gate.resolve("T1", Decision::Send, "7").await.unwrap(),
            ResolveOutcome::NotActionable
        );
        assert!(h.fulfillment.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accept_fulfills_once() {
        let h = harness().await;
        h.gate.open(request(true, true)).await.unwrap();

        let first = h.gate.handle_callback(&press("send:T1")).await.unwrap();
        let second = h.gate.handle_callback(&press("send:T1")).await.unwrap();
        assert_eq!(first, CallbackOutcome::Resolved(ResolveOutcome::Sent));
        assert_eq!(second, CallbackOutcome::Resolved(ResolveOutcome::AlreadyResolved));

        let requests = h.fulfillment.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].insured_name, "RAPID TRUCKING INC");
        assert_eq!(requests[0].subject_text, "URGENT need COI");
        assert_eq!(requests[0].last_message_id, "<m1@acme.example>");

        let texts = h.notifier.texts();
        assert!(texts.contains(&"✅ Sending COI for:\n*URGENT need COI*".to_string()));
        assert_eq!(texts.last().unwrap(), ALREADY_PROCESSED);
        assert_eq!(h.notifier.answered.lock().unwrap().len(), 2);

        let record = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Sent);
    }

    #[tokio::test]
    async fn reject_then_accept_is_noop() {
        let h = harness().await;
        h.gate.open(request(true, true)).await.unwrap();

        assert_eq!(
            h.gate.resolve("T1", Decision::NoSend, "7").await.unwrap(),
            ResolveOutcome::Skipped
        );
        let after_one = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(
            h.gate.resolve("T1", Decision::Send, "7").await.unwrap(),
            ResolveOutcome::AlreadyResolved
        );
        let after_two = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(after_one, after_two);
        assert_eq!(after_two.status, RequestStatus::Skipped);
        assert!(h.fulfillment.requests.lock().unwrap().is_empty());
        assert!(h.notifier.texts().contains(&"🚫 Skipped COI for:\n*URGENT need COI*".to_string()));
    }

    #[tokio::test]
    async fn concurrent_accepts_fulfill_once() {
        let h = harness().await;
        h.gate.open(request(true, true)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate = Arc::clone(&h.gate);
            handles.push(tokio::spawn(async move {
                gate.resolve("T1", Decision::Send, "7").await.unwrap()
            }));
        }
        let mut sent = 0;
        for handle in handles {
            if handle.await.unwrap() == ResolveOutcome::Sent {
                sent += 1;
            }
        }
        assert_eq!(sent, 1);
        assert_eq!(h.fulfillment.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reopening_resolved_thread_does_not_prompt() {
        let h = harness().await;
        h.gate.open(request(true, true)).await.unwrap();
        h.gate.resolve("T1", Decision::Send, "7").await.unwrap();

        let before = h.notifier.notices.lock().unwrap().len();
        assert_eq!(
            h.gate.open(request(true, true)).await.unwrap(),
            OpenOutcome::AlreadyResolved
        );
        assert_eq!(h.notifier.notices.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn unknown_thread_reports_processed() {
        let h = harness().await;
        assert_eq!(
            h.gate.resolve("nope", Decision::Send, "7").await.unwrap(),
            ResolveOutcome::NotFound
        );
        assert_eq!(h.notifier.texts(), vec![ALREADY_PROCESSED]);
    }

    #[tokio::test]
    async fn fulfillment_failure_keeps_sent() {
        let h = harness_with(
            RecordingNotifier::default(),
            RecordingFulfillment {
                fail: true,
                ..Default::default()
            },
        )
        .await;
        h.gate.open(request(true, true)).await.unwrap();
        assert_eq!(
            h.gate.resolve("T1", Decision::Send, "7").await.unwrap(),
            ResolveOutcome::Sent
        );
        let record = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Sent);
    }

    #[tokio::test]
    async fn disallowed_user_cannot_resolve() {
        let h = harness_with(
            RecordingNotifier {
                allowed: vec!["someone_else".into()],
                ..Default::default()
            },
            RecordingFulfillment::default(),
        )
        .await;
        h.gate.open(request(true, true)).await.unwrap();
        assert_eq!(
            h.gate.handle_callback(&press("send:T1")).await.unwrap(),
            CallbackOutcome::Unauthorized
        );
        let record = h.db.get_pending_request("T1").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(h.notifier.answered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notification_failure_is_reported() {
        let h = harness_with(
            RecordingNotifier {
                fail: true,
                ..Default::default()
            },
            RecordingFulfillment::default(),
        )
        .await;
        assert!(matches!(
            h.gate.open(request(true, true)).await,
            Err(PipelineError::Notification(_))
        ));
        // The record survives so a later replay can prompt again.
        assert!(h.db.get_pending_request("T1").await.unwrap().is_some());
    }
}
