//! Telegram Bot API channel
//!
//! Outbound: `sendMessage` with optional inline keyboards, used by every
//! service through `MessagingChannel`. Inbound: a `getUpdates` long-poll loop
//! that turns private-chat messages and button presses into `Inbound` values
//! for the command router and sends the replies back.
//!
//! ```text
//!   getUpdates ──► parse_update ──► CommandRouter::handle ──► sendMessage
//!                      │ callback                │ delete_input
//!                      ▼                         ▼
//!               answerCallbackQuery         deleteMessage
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::backoff::BackoffPolicy;
use crate::commands::{CommandRouter, Inbound, Input};
use crate::error::DeliveryError;
use crate::notify::{Action, MessagingChannel};
use crate::types::UserId;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects longer messages
const MAX_MESSAGE_CHARS: usize = 4096;
/// Upper bound on honouring a 429 `retry_after`
const MAX_RETRY_AFTER_SECS: u64 = 30;

pub struct TelegramChannel {
    http: Client,
    /// `{api_root}/bot{token}`; never logged
    api_base: String,
}

impl fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("api_base", &"<redacted>")
            .finish()
    }
}

/// One update the router should see
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    pub message_id: Option<i64>,
    pub callback_id: Option<String>,
    pub inbound: Inbound,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, api_root: &str) -> Result<Self, DeliveryError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            api_base: format!("{}/bot{}", api_root.trim_end_matches('/'), bot_token.trim()),
        })
    }

    async fn call(&self, method: &str, body: &Value, timeout: Option<Duration>) -> Result<Value, DeliveryError> {
        let mut req = self.http.post(format!("{}/{}", self.api_base, method)).json(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await?;
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(classify_api_error(status, &body))
    }

    pub async fn send_message(&self, chat_id: &str, text: &str, actions: &[Vec<Action>]) -> Result<(), DeliveryError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": truncate_message(text),
            "disable_web_page_preview": true,
        });
        if let Some(markup) = reply_markup(actions) {
            body["reply_markup"] = markup;
        }

        match self.call("sendMessage", &body, None).await {
            Err(DeliveryError::RateLimited { retry_after_secs }) => {
                let wait = retry_after_secs.min(MAX_RETRY_AFTER_SECS);
                tracing::warn!(chat = %chat_id, wait_secs = wait, "[TELEGRAM] Rate limited, retrying once");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                self.call("sendMessage", &body, None).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    pub async fn answer_callback(&self, callback_id: &str) -> Result<(), DeliveryError> {
        self.call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }), None)
            .await
            .map(|_| ())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError> {
        self.call(
            "deleteMessage",
            &json!({ "chat_id": chat_id, "message_id": message_id }),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>, DeliveryError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        // the HTTP timeout has to outlive the long poll
        let result = self
            .call("getUpdates", &body, Some(Duration::from_secs(timeout_secs + 10)))
            .await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    /// Long-poll loop; returns when `shutdown` flips to true
    pub async fn run_updates(
        self: Arc<Self>,
        router: Arc<CommandRouter>,
        timeout_secs: u64,
        backoff: BackoffPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("[TELEGRAM] Listening for updates");
        let mut offset = 0i64;
        let mut failures = 0u32;
        loop {
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                res = self.get_updates(offset, timeout_secs) => res,
            };
            match batch {
                Ok(updates) => {
                    failures = 0;
                    for raw in &updates {
                        if let Some(id) = raw.get("update_id").and_then(Value::as_i64) {
                            offset = offset.max(id + 1);
                        }
                        if let Some(update) = parse_update(raw) {
                            self.dispatch(&router, update).await;
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "[TELEGRAM] getUpdates failed: {}",
                        e
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("[TELEGRAM] Update loop stopped");
    }

    async fn dispatch(&self, router: &CommandRouter, update: Update) {
        if let Some(callback_id) = &update.callback_id {
            if let Err(e) = self.answer_callback(callback_id).await {
                tracing::debug!("[TELEGRAM] answerCallbackQuery failed: {}", e);
            }
        }

        let reply = router.handle(&update.inbound).await;

        if reply.delete_input {
            if let Some(message_id) = update.message_id {
                if let Err(e) = self.delete_message(update.chat_id, message_id).await {
                    tracing::warn!(chat = update.chat_id, "[TELEGRAM] Could not delete message: {}", e);
                }
            }
        }
        if reply.text.is_empty() {
            return;
        }
        if let Err(e) = self
            .send_message(&update.chat_id.to_string(), &reply.text, &reply.actions)
            .await
        {
            tracing::warn!(chat = update.chat_id, "[TELEGRAM] Reply failed: {}", e);
        }
    }
}

#[async_trait]
impl MessagingChannel for TelegramChannel {
    async fn send_to_user(&self, user: &UserId, text: &str) -> Result<(), DeliveryError> {
        self.send_message(user.as_str(), text, &[]).await
    }

    async fn send_with_actions(&self, user: &UserId, text: &str, actions: &[Vec<Action>]) -> Result<(), DeliveryError> {
        self.send_message(user.as_str(), text, actions).await
    }
}

/// Map a failed Bot API response onto the delivery taxonomy
pub fn classify_api_error(status: u16, body: &Value) -> DeliveryError {
    let code = body
        .get("error_code")
        .and_then(Value::as_u64)
        .map(|c| c as u16)
        .unwrap_or(status);
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    if code == 429 {
        let retry_after_secs = body
            .pointer("/parameters/retry_after")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        return DeliveryError::RateLimited { retry_after_secs };
    }
    let lower = description.to_ascii_lowercase();
    if code == 403
        || (code == 400 && (lower.contains("chat not found") || lower.contains("user is deactivated")))
    {
        return DeliveryError::Unreachable(description);
    }
    DeliveryError::Api { code, description }
}

/// Inline keyboard, one row per inner vec
pub fn reply_markup(actions: &[Vec<Action>]) -> Option<Value> {
    let rows: Vec<Value> = actions
        .iter()
        .filter(|row| !row.is_empty())
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|a| json!({ "text": a.label, "callback_data": a.payload }))
                    .collect(),
            )
        })
        .collect();
    if rows.is_empty() {
        None
    } else {
        Some(json!({ "inline_keyboard": rows }))
    }
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    out.push('…');
    out
}

/// Extract a routable update. Only private chats are handled; group
/// messages, edits and media without text are ignored.
pub fn parse_update(raw: &Value) -> Option<Update> {
    let update_id = raw.get("update_id")?.as_i64()?;

    if let Some(cb) = raw.get("callback_query") {
        let from = cb.get("from")?;
        let message = cb.get("message")?;
        let chat = message.get("chat")?;
        if chat.get("type").and_then(Value::as_str) != Some("private") {
            return None;
        }
        return Some(Update {
            update_id,
            chat_id: chat.get("id")?.as_i64()?,
            message_id: message.get("message_id").and_then(Value::as_i64),
            callback_id: cb.get("id").and_then(Value::as_str).map(str::to_string),
            inbound: Inbound {
                user_id: UserId::from(from.get("id")?.as_i64()?),
                username: username_of(from),
                input: Input::Action(cb.get("data")?.as_str()?.to_string()),
            },
        });
    }

    let message = raw.get("message")?;
    let chat = message.get("chat")?;
    if chat.get("type").and_then(Value::as_str) != Some("private") {
        return None;
    }
    let from = message.get("from")?;
    let text = message.get("text")?.as_str()?;
    Some(Update {
        update_id,
        chat_id: chat.get("id")?.as_i64()?,
        message_id: message.get("message_id").and_then(Value::as_i64),
        callback_id: None,
        inbound: Inbound {
            user_id: UserId::from(from.get("id")?.as_i64()?),
            username: username_of(from),
            input: Input::parse(text),
        },
    })
}

/// `@username`, falling back to the first name
fn username_of(from: &Value) -> Option<String> {
    from.get("username")
        .or_else(|| from.get("first_name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
