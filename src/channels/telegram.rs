//! Telegram Bot API notifier for approval prompts.
//!
//! Outbound only: updates arrive on the `/telegram` webhook and are
//! deserialized into [`TelegramUpdate`] by the router.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{ApprovalNotifier, InlineButton};
use crate::error::ChannelError;

/// Telegram rejects sendMessage text longer than this.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Approval notifier backed by a Telegram bot.
pub struct TelegramNotifier {
    bot_token: SecretString,
    api_base: String,
    allowed_users: Vec<String>,
    client: reqwest::Client,
}

/// Incoming webhook update. Only the fields the approval flow reads.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

/// A press of an inline button.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramUser {
    /// Identities checked against the allowlist: username and numeric id.
    pub fn identities(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(2);
        if let Some(username) = &self.username {
            ids.push(username.clone());
        }
        ids.push(self.id.to_string());
        ids
    }
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, api_base: impl Into<String>, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            api_base: api_base.into(),
            allowed_users,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose_secret()
        )
    }

    async fn post(&self, method: &str, body: &serde_json::Value) -> Result<reqwest::Response, ChannelError> {
        self.client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })
    }

    /// sendMessage with Markdown, retried as plain text if Telegram rejects
    /// the markup (unbalanced `*` in a subject line, for instance).
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        let text = truncate_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);

        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(markup) = &reply_markup {
            body["reply_markup"] = markup.clone();
        }

        let markdown_resp = self.post("sendMessage", &body).await?;
        if markdown_resp.status().is_success() {
            return Ok(());
        }
        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        if let Some(map) = body.as_object_mut() {
            map.remove("parse_mode");
        }
        let plain_resp = self.post("sendMessage", &body).await?;
        if !plain_resp.status().is_success() {
            let plain_status = plain_resp.status();
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_status} {plain_err})"
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ApprovalNotifier for TelegramNotifier {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.send_message(chat_id, text, None).await
    }

    async fn send_with_buttons(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), ChannelError> {
        let markup = serde_json::json!({ "inline_keyboard": [buttons] });
        self.send_message(chat_id, text, Some(markup)).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChannelError> {
        let resp = self
            .post(
                "answerCallbackQuery",
                &serde_json::json!({ "callback_query_id": callback_id }),
            )
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::RequestFailed {
                name: "telegram".into(),
                reason: format!("answerCallbackQuery: HTTP {status}: {body}"),
            });
        }
        Ok(())
    }

    fn is_any_user_allowed(&self, identities: &[&str]) -> bool {
        check_user_allowed(&self.allowed_users, identities.iter().copied())
    }
}

/// `*` admits everyone; otherwise exact match on any identity.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

fn truncate_message(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
