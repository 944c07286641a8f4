//! The alert capability: somewhere to shout when things go wrong.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use maestro_catalog::model::SlackConf;

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Failures are logged, never propagated: an
    /// unreachable alert channel must not fail a run.
    async fn alert(&self, msg: &str);
}

/// Discards alerts. Used when no webhook is configured and in tests
/// that do not care.
#[derive(Debug, Default)]
pub struct NullAlerts;

#[async_trait]
impl AlertSink for NullAlerts {
    async fn alert(&self, msg: &str) {
        warn!("alert (no sink configured): {}", msg);
    }
}

#[derive(Serialize)]
struct WebhookPayload {
    #[serde(skip_serializing_if = "String::is_empty")]
    text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    channel: String,
    #[serde(rename = "icon_emoji", skip_serializing_if = "String::is_empty")]
    icon_emoji: String,
}

/// Slack-webhook-shaped alert sink. Alert text may contain the
/// `{URL_PREFIX}` placeholder which is replaced with the deployment's
/// base URL so alerts carry clickable links.
pub struct SlackAlerts {
    conf: SlackConf,
    client: reqwest::Client,
}

impl SlackAlerts {
    pub fn new(conf: SlackConf) -> Self {
        Self {
            conf,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for SlackAlerts {
    async fn alert(&self, msg: &str) {
        if self.conf.url.is_empty() {
            warn!("alert (Slack not configured): {}", msg);
            return;
        }
        let payload = WebhookPayload {
            text: msg.replace("{URL_PREFIX}", &self.conf.url_prefix),
            username: self.conf.username.clone(),
            channel: self.conf.channel.clone(),
            icon_emoji: self.conf.icon_emoji.clone(),
        };
        match self.client.post(&self.conf.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_client_error() || resp.status().is_server_error() => {
                warn!("Error sending alert. Status: {}", resp.status());
            }
            Ok(_) => {}
            Err(err) => warn!("Error sending alert: {}", err),
        }
    }
}
