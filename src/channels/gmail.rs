//! Gmail REST client: inbox reads, send/draft, and push-notification watch.
//!
//! Talks to `users/me` with a bearer token. Messages are exchanged in
//! `format=raw` (base64url RFC 822) so parsing and composition stay local.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::channels::{
    Mailbox, MailSender, MessageRef, OutgoingMail, RawMessage, WatchRegistration, compose_message,
};
use crate::error::ChannelError;

const CHANNEL: &str = "gmail";

/// Gmail API client for a single delegated mailbox.
pub struct GmailClient {
    api_base: String,
    token: SecretString,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadSummary>,
}

#[derive(Debug, Deserialize)]
struct ThreadSummary {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ThreadDetail {
    id: String,
    #[serde(default)]
    messages: Vec<MessageMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageMeta {
    id: String,
    #[serde(default)]
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageResponse {
    id: String,
    thread_id: String,
    raw: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    history_id: serde_json::Value,
    expiration: serde_json::Value,
}

impl GmailClient {
    pub fn new(api_base: impl Into<String>, token: SecretString) -> Self {
        Self {
            api_base: api_base.into(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/gmail/v1/users/me/{path}",
            self.api_base.trim_end_matches('/')
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ChannelError> {
        let resp = self
            .client
            .get(self.api_url(path))
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| request_failed(path, e))?;
        read_json(path, resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(path))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| request_failed(path, e))?;
        read_json(path, resp).await
    }
}

fn request_failed(path: &str, e: reqwest::Error) -> ChannelError {
    ChannelError::RequestFailed {
        name: CHANNEL.into(),
        reason: format!("{path}: {e}"),
    }
}

async fn read_json<T: DeserializeOwned>(
    path: &str,
    resp: reqwest::Response,
) -> Result<T, ChannelError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ChannelError::RequestFailed {
            name: CHANNEL.into(),
            reason: format!("{path}: HTTP {status}: {body}"),
        });
    }
    resp.json::<T>()
        .await
        .map_err(|e| ChannelError::InvalidMessage(format!("{path}: {e}")))
}

/// Decode Gmail's base64url payloads, which may or may not be padded.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, ChannelError> {
    let trimmed = data.trim();
    URL_SAFE
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .map_err(|e| ChannelError::InvalidMessage(format!("invalid base64url payload: {e}")))
}

/// Gmail encodes int64 fields as JSON strings.
fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn json_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    async fn list_recent_threads(&self, max: usize) -> Result<Vec<String>, ChannelError> {
        let list: ThreadList = self
            .get_json(
                "threads",
                &[
                    ("labelIds", "INBOX".to_string()),
                    ("maxResults", max.to_string()),
                ],
            )
            .await?;
        Ok(list.threads.into_iter().map(|t| t.id).collect())
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<MessageRef>, ChannelError> {
        let detail: ThreadDetail = self
            .get_json(
                &format!("threads/{thread_id}"),
                &[("format", "minimal".to_string())],
            )
            .await?;
        Ok(detail
            .messages
            .into_iter()
            .map(|m| MessageRef {
                internal_date: m
                    .internal_date
                    .as_deref()
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(0),
                id: m.id,
                thread_id: detail.id.clone(),
            })
            .collect())
    }

    async fn fetch_raw_message(&self, message_id: &str) -> Result<RawMessage, ChannelError> {
        let msg: RawMessageResponse = self
            .get_json(
                &format!("messages/{message_id}"),
                &[("format", "raw".to_string())],
            )
            .await?;
        Ok(RawMessage {
            raw: decode_base64url(&msg.raw)?,
            id: msg.id,
            thread_id: msg.thread_id,
            snippet: msg.snippet,
        })
    }

    async fn watch(&self, topic: &str) -> Result<WatchRegistration, ChannelError> {
        let resp: WatchResponse = self
            .post_json(
                "watch",
                &serde_json::json!({
                    "topicName": topic,
                    "labelIds": ["INBOX"],
                    "labelFilterAction": "include",
                    "historyTypes": ["messageAdded"],
                }),
            )
            .await?;
        let expiration = json_i64(&resp.expiration).ok_or_else(|| {
            ChannelError::InvalidMessage(format!("watch: bad expiration {}", resp.expiration))
        })?;
        Ok(WatchRegistration {
            history_id: json_string(&resp.history_id),
            expiration,
        })
    }
}

#[async_trait]
impl MailSender for GmailClient {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<String, ChannelError> {
        let raw = URL_SAFE.encode(compose_message(mail)?.formatted());
        let mut body = serde_json::json!({ "raw": raw });
        if let Some(thread_id) = &mail.thread_id {
            body["threadId"] = serde_json::Value::String(thread_id.clone());
        }
        let sent: IdResponse = self.post_json("messages/send", &body).await?;
        tracing::info!(message_id = %sent.id, to = ?mail.to, "Gmail message sent");
        Ok(sent.id)
    }

    async fn draft(&self, mail: &OutgoingMail) -> Result<String, ChannelError> {
        let raw = URL_SAFE.encode(compose_message(mail)?.formatted());
        let mut message = serde_json::json!({ "raw": raw });
        if let Some(thread_id) = &mail.thread_id {
            message["threadId"] = serde_json::Value::String(thread_id.clone());
        }
        let draft: IdResponse = self
            .post_json("drafts", &serde_json::json!({ "message": message }))
            .await?;
        tracing::info!(draft_id = %draft.id, to = ?mail.to, "Gmail draft created");
        Ok(draft.id)
    }
}
