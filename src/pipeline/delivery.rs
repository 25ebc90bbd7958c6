//! Certificate delivery: resolve recipients, attach generated files, send
//! or draft the reply in the originating thread.

use std::sync::Arc;

use tracing::{info, warn};

use crate::channels::email::content_type_for;
use crate::channels::{MailAttachment, MailSender, OutgoingMail};
use crate::config::DeliveryMode;
use crate::documents::ObjectStore;
use crate::error::{DocumentError, PipelineError};
use crate::pipeline::recipients::{resolve_recipients, without_address};

pub const REPLY_BODY: &str = "Please find attached the Certificate of Insurance.";
const FALLBACK_SUBJECT: &str = "Certificate Request";

/// `Re: <subject>`, never `Re: Re: ...`.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.is_empty() {
        return format!("Re: {FALLBACK_SUBJECT}");
    }
    let already_reply = subject
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
    if already_reply {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// One approved reply.
#[derive(Debug, Clone, Default)]
pub struct DeliveryJob {
    pub thread_id: String,
    pub subject: String,
    pub send_to_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub last_message_id: String,
    /// Storage keys of the files to attach.
    pub attachment_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub id: String,
    pub mode: DeliveryMode,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub attached: Vec<String>,
}

pub struct CoiMailer {
    sender: Arc<dyn MailSender>,
    store: Arc<dyn ObjectStore>,
    from: String,
    mode: DeliveryMode,
}

impl CoiMailer {
    pub fn new(
        sender: Arc<dyn MailSender>,
        store: Arc<dyn ObjectStore>,
        from: impl Into<String>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            sender,
            store,
            from: from.into(),
            mode,
        }
    }

    /// Attachments missing from storage are skipped with a warning. Fails
    /// when nobody is left to address or nothing at all could be attached.
    pub async fn deliver(&self, job: &DeliveryJob) -> Result<DeliveryReceipt, PipelineError> {
        let recipients = without_address(
            resolve_recipients(&job.send_to_email, &job.to_emails, &job.cc_emails),
            &self.from,
        );
        let (to, cc) = match (recipients.to.is_empty(), recipients.cc.split_first()) {
            (false, _) => (recipients.to, recipients.cc),
            // Only cc left: the first one is promoted to `to`.
            (true, Some((first, rest))) => (vec![first.clone()], rest.to_vec()),
            (true, None) => {
                return Err(PipelineError::Delivery(
                    "no recipients left after resolution".into(),
                ));
            }
        };

        let attachments = self.load_attachments(job).await;
        if attachments.is_empty() {
            return Err(PipelineError::Delivery(format!(
                "none of {} certificate file(s) available",
                job.attachment_keys.len()
            )));
        }
        let attached: Vec<String> = attachments.iter().map(|a| a.filename.clone()).collect();

        let mail = OutgoingMail {
            from: self.from.clone(),
            to: to.clone(),
            cc: cc.clone(),
            subject: reply_subject(&job.subject),
            body: REPLY_BODY.to_string(),
            attachments,
            in_reply_to: Some(job.last_message_id.trim().to_string()).filter(|id| !id.is_empty()),
            thread_id: Some(job.thread_id.clone()).filter(|id| !id.is_empty()),
        };

        let id = match self.mode {
            DeliveryMode::Send => self.sender.send(&mail).await?,
            DeliveryMode::Draft => self.sender.draft(&mail).await?,
        };

        info!(
            thread_id = %job.thread_id,
            transport = self.sender.name(),
            mode = ?self.mode,
            id = %id,
            to = ?to,
            cc = ?cc,
            attachments = attached.len(),
            "Certificate reply delivered"
        );

        Ok(DeliveryReceipt {
            id,
            mode: self.mode,
            to,
            cc,
            attached,
        })
    }

    async fn load_attachments(&self, job: &DeliveryJob) -> Vec<MailAttachment> {
        let mut attachments = Vec::new();
        for key in &job.attachment_keys {
            match self.store.get(key).await {
                Ok(bytes) => {
                    let filename = key.rsplit('/').next().unwrap_or(key).to_string();
                    attachments.push(MailAttachment {
                        content_type: content_type_for(&filename).to_string(),
                        filename,
                        bytes,
                    });
                }
                Err(DocumentError::NotFound(_)) => {
                    warn!(thread_id = %job.thread_id, key = %key, "Attachment missing from storage, skipping");
                }
                Err(e) => {
                    warn!(thread_id = %job.thread_id, key = %key, error = %e, "Failed to read attachment, skipping");
                }
            }
        }
        attachments
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;
    use crate::documents::MemoryObjectStore;

    async fn store_with(keys: &[&str]) -> Arc<dyn ObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        for key in keys {
            store.put(key, b"%PDF-1.5 flattened".to_vec()).await.unwrap();
        }
        store
    }

    fn job(keys: &[&str]) -> DeliveryJob {
        DeliveryJob {
            thread_id: "T1".into(),
            subject: "URGENT need COI".into(),
            send_to_email: "certs@holder.example".into(),
            to_emails: vec!["Agency <certs@agency.example>".into()],
            cc_emails: vec!["ops@broker.example".into()],
            last_message_id: "<m1@broker.example>".into(),
            attachment_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn reply_subject_prefixing() {
        assert_eq!(reply_subject("COI needed"), "Re: COI needed");
        assert_eq!(reply_subject("RE: COI needed"), "RE: COI needed");
        assert_eq!(reply_subject("re:COI"), "re:COI");
        assert_eq!(reply_subject("   "), "Re: Certificate Request");
        assert_eq!(reply_subject("Ré"), "Re: Ré");
    }

    #[tokio::test]
    async fn sends_reply_with_attachments_in_thread() {
        let sender = Arc::new(RecordingSender::default());
        let store = store_with(&["certificates/RAPID TRUCKING INC COI.pdf"]).await;
        let mailer = CoiMailer::new(sender.clone(), store, "certs@agency.example", DeliveryMode::Send);

        let receipt = mailer
            .deliver(&job(&["certificates/RAPID TRUCKING INC COI.pdf"]))
            .await
            .unwrap();
        assert_eq!(receipt.id, "sent-1");
        assert_eq!(receipt.to, vec!["certs@holder.example"]);
        assert_eq!(receipt.cc, vec!["ops@broker.example"]);

        let sent = sender.sent.lock().unwrap();
        let mail = &sent[0];
        assert_eq!(mail.subject, "Re: URGENT need COI");
        assert_eq!(mail.body, REPLY_BODY);
        assert_eq!(mail.in_reply_to.as_deref(), Some("<m1@broker.example>"));
        assert_eq!(mail.thread_id.as_deref(), Some("T1"));
        assert_eq!(mail.attachments[0].filename, "RAPID TRUCKING INC COI.pdf");
        assert_eq!(mail.attachments[0].content_type, "application/pdf");
    }

    #[tokio::test]
    async fn missing_attachment_is_skipped() {
        let sender = Arc::new(RecordingSender::default());
        let store = store_with(&["certificates/main.pdf"]).await;
        let mailer = CoiMailer::new(sender.clone(), store, "certs@agency.example", DeliveryMode::Send);

        let receipt = mailer
            .deliver(&job(&["certificates/main.pdf", "certificates/additional.pdf"]))
            .await
            .unwrap();
        assert_eq!(receipt.attached, vec!["main.pdf"]);
        assert_eq!(sender.sent_count(), 1);
    }

    #[tokio::test]
    async fn nothing_to_attach_is_not_sent() {
        let sender = Arc::new(RecordingSender::default());
        let mailer = CoiMailer::new(
            sender.clone(),
            store_with(&[]).await,
            "certs@agency.example",
            DeliveryMode::Send,
        );
        assert!(matches!(
            mailer.deliver(&job(&["certificates/main.pdf"])).await,
            Err(PipelineError::Delivery(_))
        ));
        assert_eq!(sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn draft_mode_creates_draft() {
        let sender = Arc::new(RecordingSender::default());
        let store = store_with(&["certificates/main.pdf"]).await;
        let mailer = CoiMailer::new(sender.clone(), store, "certs@agency.example", DeliveryMode::Draft);

        let receipt = mailer.deliver(&job(&["certificates/main.pdf"])).await.unwrap();
        assert_eq!(receipt.id, "draft-1");
        assert_eq!(sender.sent_count(), 0);
        assert_eq!(sender.drafts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_cc_left_promotes_first_to_to() {
        let sender = Arc::new(RecordingSender::default());
        let store = store_with(&["certificates/main.pdf"]).await;
        let mailer = CoiMailer::new(sender.clone(), store, "certs@agency.example", DeliveryMode::Send);

        let mut job = job(&["certificates/main.pdf"]);
        job.send_to_email.clear();
        let receipt = mailer.deliver(&job).await.unwrap();
        assert_eq!(receipt.to, vec!["ops@broker.example"]);
        assert!(receipt.cc.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_returned() {
        let sender = Arc::new(RecordingSender::failing());
        let store = store_with(&["certificates/main.pdf"]).await;
        let mailer = CoiMailer::new(sender, store, "certs@agency.example", DeliveryMode::Send);
        assert!(matches!(
            mailer.deliver(&job(&["certificates/main.pdf"])).await,
            Err(PipelineError::Channel(_))
        ));
    }
}
