//! Slack delivery client.
//!
//! Two outbound paths, tried in order: the bot-token Web API (preferred,
//! returns the message `ts` needed for threading, acknowledgment, and later
//! edits) and the incoming-webhook fallback (fire-and-forget). Every network
//! or API failure degrades to a `(false, None)` outcome; nothing retries and
//! nothing propagates to the alert-action exit path except the final bool.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::SlackConfig;
use crate::error::BridgeError;
use crate::slack::message;

const SLACK_API_BASE: &str = "https://slack.com/api";
const BOT_USERNAME: &str = "FortiGate Security Alert";

pub struct SlackClient {
    config: SlackConfig,
    http_client: Client,
    api_base: String,
}

impl SlackClient {
    pub fn new(config: SlackConfig) -> Self {
        let mut builder = Client::builder().timeout(Duration::from_secs(10));
        if let Some(proxy_url) = &config.proxy_url {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => error!("Ignoring invalid proxy {}: {}", proxy_url, e),
            }
        }
        let http_client = builder.build().expect("Failed to create HTTP client");

        Self {
            config,
            http_client,
            api_base: SLACK_API_BASE.to_string(),
        }
    }

    /// Point the Web API at a different base URL. Used by tests to target a
    /// local mock server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    /// Send a Block Kit alert. Returns `(delivered, message_ts)`:
    /// `(true, Some(ts))` from the bot-token path, `(true, None)` from the
    /// webhook path, `(false, None)` on any failure.
    pub async fn send_to_slack(
        &self,
        blocks: &[Value],
        thread_ts: Option<&str>,
    ) -> (bool, Option<String>) {
        let mut payload = json!({
            "channel": self.config.channel,
            "username": BOT_USERNAME,
            "icon_emoji": ":rotating_light:",
            "blocks": blocks,
        });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = json!(ts);
        }
        self.post_payload(payload).await
    }

    /// Send an arbitrary message payload (notifications from the auto-block
    /// path use attachment formatting instead of Block Kit). The channel and
    /// bot identity are filled in here.
    pub async fn post_payload(&self, mut payload: Value) -> (bool, Option<String>) {
        if payload.get("channel").is_none() {
            payload["channel"] = json!(self.config.channel);
        }
        if payload.get("username").is_none() {
            payload["username"] = json!(BOT_USERNAME);
        }

        if let Some(token) = self
            .config
            .bot_token
            .as_deref()
            .filter(|t| t.starts_with("xoxb-"))
        {
            return self.post_via_bot_token(token, &payload).await;
        }

        if let Some(webhook_url) = self.config.webhook_url.as_deref() {
            return self.post_via_webhook(webhook_url, &payload).await;
        }

        error!("No valid Slack credentials (need bot_token or webhook_url)");
        (false, None)
    }

    async fn post_via_bot_token(&self, token: &str, payload: &Value) -> (bool, Option<String>) {
        let url = format!("{}/chat.postMessage", self.api_base);
        let response = match self
            .http_client
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Error sending to Slack: {}", e);
                return (false, None);
            }
        };

        if !response.status().is_success() {
            error!("Slack API returned HTTP {}", response.status());
            return (false, None);
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                error!("Error parsing Slack response: {}", e);
                return (false, None);
            }
        };

        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            info!("Alert sent to Slack (bot token)");
            let ts = body.get("ts").and_then(Value::as_str).map(str::to_string);
            (true, ts)
        } else {
            let api_error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            error!("Slack API error: {}", api_error);
            (false, None)
        }
    }

    async fn post_via_webhook(&self, webhook_url: &str, payload: &Value) -> (bool, Option<String>) {
        let response = match self.http_client.post(webhook_url).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Error sending to Slack webhook: {}", e);
                return (false, None);
            }
        };

        if !response.status().is_success() {
            error!("Slack webhook returned HTTP {}", response.status());
            return (false, None);
        }

        match response.text().await {
            Ok(text) if text == "ok" => {
                info!("Alert sent to Slack (webhook)");
                (true, None)
            }
            Ok(text) => {
                error!("Slack webhook response: {}", text);
                (false, None)
            }
            Err(e) => {
                error!("Error reading Slack webhook response: {}", e);
                (false, None)
            }
        }
    }

    /// Edit a delivered message after an acknowledge/snooze: the actions
    /// block is replaced by a status context line when the original blocks
    /// are available, else the message text is rewritten.
    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        status_text: &str,
        original_blocks: Option<&[Value]>,
    ) -> Result<(), BridgeError> {
        let token = self
            .config
            .bot_token
            .as_deref()
            .ok_or_else(|| BridgeError::SlackApiError("chat.update requires a bot token".into()))?;

        let payload = match original_blocks {
            Some(blocks) => json!({
                "channel": channel,
                "ts": ts,
                "blocks": message::resolve_actions(blocks, status_text),
            }),
            None => json!({ "channel": channel, "ts": ts, "text": status_text }),
        };

        let url = format!("{}/chat.update", self.api_base);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        let body: Value = response.json().await?;
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            let api_error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Err(BridgeError::SlackApiError(format!(
                "chat.update failed: {}",
                api_error
            )))
        }
    }
}
