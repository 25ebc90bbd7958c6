//! External messaging channels.
//!
//! Three seams, each with one production implementation:
//! - [`Mailbox`]: read side of the watched inbox (Gmail REST)
//! - [`MailSender`]: outbound certificate mail (Gmail send/draft, or SMTP)
//! - [`ApprovalNotifier`]: human approval prompts (Telegram Bot API)

pub mod email;
pub mod email_types;
pub mod gmail;
pub mod telegram;

pub use email::{SmtpSender, compose_message};
pub use email_types::ParsedEmail;
pub use gmail::GmailClient;
pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Lightweight reference to a message inside a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
    /// Mailbox-assigned receive time, epoch milliseconds.
    pub internal_date: i64,
}

/// A full RFC 822 message as stored by the mailbox.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    pub raw: Vec<u8>,
    pub snippet: String,
}

/// Result of a push-notification watch registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRegistration {
    pub history_id: String,
    /// Epoch milliseconds at which the watch lapses.
    pub expiration: i64,
}

/// A file attached to an outgoing message.
#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A fully resolved outbound message.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MailAttachment>,
    /// RFC 822 Message-ID this mail replies to.
    pub in_reply_to: Option<String>,
    /// Mailbox conversation to file the mail under.
    pub thread_id: Option<String>,
}

/// One inline button under a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Read access to the watched mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Ids of the most recent inbox threads, newest first.
    async fn list_recent_threads(&self, max: usize) -> Result<Vec<String>, ChannelError>;

    /// Message references for a thread.
    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<MessageRef>, ChannelError>;

    /// Full raw message by id.
    async fn fetch_raw_message(&self, message_id: &str) -> Result<RawMessage, ChannelError>;

    /// (Re-)register inbox push notifications to `topic`.
    async fn watch(&self, topic: &str) -> Result<WatchRegistration, ChannelError>;
}

/// Outbound mail transport.
#[async_trait]
pub trait MailSender: Send + Sync {
    fn name(&self) -> &str;

    /// Send immediately. Returns the transport's message id.
    async fn send(&self, mail: &OutgoingMail) -> Result<String, ChannelError>;

    /// Save as a draft for manual review. Returns the draft id.
    async fn draft(&self, mail: &OutgoingMail) -> Result<String, ChannelError>;
}

/// Channel that carries approval prompts to a human.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Send a prompt with a single row of inline buttons.
    async fn send_with_buttons(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), ChannelError>;

    /// Acknowledge a button press so the client stops its spinner.
    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChannelError>;

    /// Whether any of the given identities may resolve approvals.
    fn is_any_user_allowed(&self, identities: &[&str]) -> bool;
}
