//! Operator notifications.
//!
//! Delivery is best effort: [`deliver`] logs the message and any failure and
//! never returns an error to the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::NotifySettings;

/// A channel that takes plain text.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Send `text`, logging instead of failing.
pub async fn deliver(notifier: &dyn Notifier, text: &str) {
    match notifier.send(text).await {
        Ok(()) => tracing::info!("Notification sent: {}", text.replace('\n', " | ")),
        Err(e) => tracing::warn!("Failed to send notification: {e}"),
    }
}

/// Slack mention markup for a user ID.
#[must_use]
pub fn mention(user_id: &str) -> String {
    format!("<@{user_id}>")
}

/// Posts to a Slack channel through `chat.postMessage`.
pub struct SlackNotifier {
    /// HTTP client carrying the request timeout.
    client: reqwest::Client,
    /// Web API root, without a trailing slash.
    api_base: String,
    /// Bot token sent as a bearer credential.
    token: String,
    /// Channel ID messages are posted to.
    channel: String,
}

#[derive(Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        channel: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.token)
            .json(&PostMessage {
                channel: &self.channel,
                text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status(status.as_u16(), body));
        }

        let body: SlackResponse = response.json().await?;
        if body.ok {
            Ok(())
        } else {
            Err(NotifyError::Api(
                body.error.unwrap_or_else(|| "unknown error".into()),
            ))
        }
    }
}

/// Writes notifications to the log only. Used when no Slack token is set.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        tracing::info!(target: "gpu_watchdog::operator", "{}", text.replace('\n', " | "));
        Ok(())
    }
}

/// Build the configured notifier: Slack when both token and channel are set,
/// otherwise the log.
pub fn from_settings(settings: &NotifySettings) -> Result<Box<dyn Notifier>, NotifyError> {
    match (&settings.token, &settings.channel) {
        (Some(token), Some(channel)) => Ok(Box::new(SlackNotifier::new(
            settings.api_base.clone(),
            token.clone(),
            channel.clone(),
            settings.timeout(),
        )?)),
        (Some(_), None) => {
            tracing::warn!(
                "SLACK_API_TOKEN is set but no channel is configured; logging notifications only"
            );
            Ok(Box::new(LogNotifier))
        }
        _ => Ok(Box::new(LogNotifier)),
    }
}

/// Errors that can occur when sending a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification endpoint returned {0}: {1}")]
    Status(u16, String),
    #[error("notification rejected: {0}")]
    Api(String),
}
