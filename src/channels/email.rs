//! Outbound mail composition (lettre) and the SMTP relay sender.
//!
//! [`compose_message`] builds the RFC 822 message for both transports: the
//! Gmail client base64url-encodes it, [`SmtpSender`] hands it to a relay.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::channels::{MailSender, OutgoingMail};
use crate::config::SmtpConfig;
use crate::error::ChannelError;

fn invalid(what: &str, value: &str, e: impl std::fmt::Display) -> ChannelError {
    ChannelError::InvalidMessage(format!("invalid {what} '{value}': {e}"))
}

fn parse_mailbox(what: &str, value: &str) -> Result<lettre::message::Mailbox, ChannelError> {
    value.parse().map_err(|e| invalid(what, value, e))
}

/// MIME type for an attachment, by extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Build the MIME message: a plain-text body followed by each attachment.
///
/// When `in_reply_to` is set the message carries matching `In-Reply-To`
/// and `References` headers so clients thread it under the request.
pub fn compose_message(mail: &OutgoingMail) -> Result<Message, ChannelError> {
    if mail.to.is_empty() {
        return Err(ChannelError::InvalidMessage(
            "outgoing mail has no recipients".into(),
        ));
    }

    let mut builder = Message::builder()
        .from(parse_mailbox("from address", &mail.from)?)
        .subject(mail.subject.clone())
        .message_id(Some(format!("<{}@coi-assist>", Uuid::new_v4())));
    for to in &mail.to {
        builder = builder.to(parse_mailbox("to address", to)?);
    }
    for cc in &mail.cc {
        builder = builder.cc(parse_mailbox("cc address", cc)?);
    }
    if let Some(reply_to) = mail.in_reply_to.as_deref().filter(|id| !id.is_empty()) {
        builder = builder
            .in_reply_to(reply_to.to_string())
            .references(reply_to.to_string());
    }

    let mut body = MultiPart::mixed().singlepart(SinglePart::plain(mail.body.clone()));
    for attachment in &mail.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .map_err(|e| invalid("content type", &attachment.content_type, e))?;
        body = body.singlepart(
            Attachment::new(attachment.filename.clone())
                .body(attachment.bytes.clone(), content_type),
        );
    }

    builder
        .multipart(body)
        .map_err(|e| ChannelError::InvalidMessage(format!("failed to build message: {e}")))
}

/// Sends through an SMTP relay. Drafts have no SMTP equivalent.
pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<SmtpTransport, ChannelError> {
        let mut builder = SmtpTransport::relay(&self.config.host)
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.port);
        if !self.config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.expose_secret().to_string(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<String, ChannelError> {
        let message = compose_message(mail)?;
        let message_id = message
            .headers()
            .get_raw("Message-ID")
            .unwrap_or_default()
            .to_string();
        let transport = self.transport()?;

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: e.to_string(),
            })?;

        tracing::info!(%message_id, to = ?mail.to, "SMTP message sent");
        Ok(message_id)
    }

    async fn draft(&self, _mail: &OutgoingMail) -> Result<String, ChannelError> {
        Err(ChannelError::Unsupported {
            name: "smtp".into(),
            operation: "draft".into(),
        })
    }
}
