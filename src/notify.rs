//! Messaging channel capability
//!
//! Core services only ever *send*; inbound commands are routed by the
//! channel implementation into `commands`. Delivery is best-effort: an
//! unreachable recipient is logged and never fails the caller's operation.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::types::UserId;

/// Interactive button attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub label: String,
    pub payload: String,
}

impl Action {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait MessagingChannel: Send + Sync {
    async fn send_to_user(&self, user: &UserId, text: &str) -> Result<(), DeliveryError>;

    /// Send with interactive buttons; channels without buttons list the payloads
    async fn send_with_actions(
        &self,
        user: &UserId,
        text: &str,
        actions: &[Vec<Action>],
    ) -> Result<(), DeliveryError> {
        if actions.is_empty() {
            return self.send_to_user(user, text).await;
        }
        let mut body = text.to_string();
        for action in actions.iter().flatten() {
            body.push_str(&format!("\n• {} → {}", action.label, action.payload));
        }
        self.send_to_user(user, &body).await
    }
}

/// Send and swallow failures after logging them
pub async fn deliver(channel: &dyn MessagingChannel, user: &UserId, text: &str) -> bool {
    report(user, channel.send_to_user(user, text).await)
}

pub async fn deliver_with_actions(
    channel: &dyn MessagingChannel,
    user: &UserId,
    text: &str,
    actions: &[Vec<Action>],
) -> bool {
    report(user, channel.send_with_actions(user, text, actions).await)
}

fn report(user: &UserId, result: Result<(), DeliveryError>) -> bool {
    match result {
        Ok(()) => true,
        Err(DeliveryError::Unreachable(reason)) => {
            tracing::info!(user = %user, "[NOTIFY] Recipient unreachable: {}", reason);
            false
        }
        Err(e) => {
            tracing::warn!(user = %user, "[NOTIFY] Delivery failed: {}", e);
            false
        }
    }
}

/// Channel used when no bot token is configured: messages go to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyChannel;

#[async_trait]
impl MessagingChannel for LogOnlyChannel {
    async fn send_to_user(&self, user: &UserId, text: &str) -> Result<(), DeliveryError> {
        tracing::info!(user = %user, "[NOTIFY] (log-only) {}", text.replace('\n', " | "));
        Ok(())
    }
}
