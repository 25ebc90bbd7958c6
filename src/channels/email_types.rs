//! Email-specific types: parsed inbound message, text extraction, address extraction.

use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

use crate::channels::RawMessage;
use crate::error::ChannelError;

/// The newest message of a thread, reduced to what the classifier needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEmail {
    /// Mailbox message id.
    pub id: String,
    pub thread_id: String,
    /// RFC 822 Message-ID header in angle-bracket form; empty if absent.
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub subject: String,
    pub body_text: String,
}

impl ParsedEmail {
    /// Parse a raw RFC 822 message. Falls back to the mailbox snippet when
    /// the message has no readable body.
    pub fn from_raw(raw: &RawMessage) -> Result<Self, ChannelError> {
        let parsed = MessageParser::default().parse(raw.raw.as_slice()).ok_or_else(|| {
            ChannelError::InvalidMessage(format!("message {} is not valid RFC 822", raw.id))
        })?;

        let body_text = extract_text(&parsed).unwrap_or_else(|| raw.snippet.clone());

        Ok(Self {
            id: raw.id.clone(),
            thread_id: raw.thread_id.clone(),
            message_id: parsed.message_id().map(bracketed).unwrap_or_default(),
            from: extract_addresses(parsed.from()).into_iter().next().unwrap_or_default(),
            to: extract_addresses(parsed.to()),
            cc: extract_addresses(parsed.cc()),
            subject: parsed.subject().unwrap_or("(No Subject)").to_string(),
            body_text,
        })
    }
}

fn bracketed(id: &str) -> String {
    let id = id.trim();
    if id.starts_with('<') && id.ends_with('>') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

/// Extract readable text from a parsed email: plain part first, then HTML
/// with tags stripped, then any inline text attachment.
fn extract_text(parsed: &mail_parser::Message) -> Option<String> {
    if let Some(text) = parsed.body_text(0)
        && !text.trim().is_empty()
    {
        return Some(text.to_string());
    }
    if let Some(html) = parsed.body_html(0) {
        let text = strip_html(html.as_ref());
        if !text.is_empty() {
            return Some(text);
        }
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return Some(text.to_string());
        }
    }
    None
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}
