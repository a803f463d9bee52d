//! Inbound Slack interaction callbacks.
//!
//! Slack posts a signed, form-encoded `payload=` document whenever someone
//! clicks an alert button. The handler verifies the signature against the raw
//! body, flips the matching alert-state row, and edits the original message
//! so the channel sees who acknowledged what.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::alert_state::{AlertStateStore, AlertStatus};
use crate::error::BridgeError;
use crate::slack::client::SlackClient;
use crate::slack::signature::verify_slack_signature;

pub struct CallbackState {
    pub signing_secret: Option<String>,
    pub store: AlertStateStore,
    pub slack: SlackClient,
}

pub fn create_router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/slack/callback", post(handle_callback))
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<CallbackState>,
) -> std::io::Result<()> {
    info!("Callback server listening on {:?}", listener.local_addr());
    axum::serve(listener, create_router(state)).await
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "fortigate-alert-bridge",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, BridgeError> {
    if let Some(secret) = &state.signing_secret {
        let timestamp = header_str(&headers, "X-Slack-Request-Timestamp")
            .ok_or(BridgeError::InvalidSignature)?;
        let signature =
            header_str(&headers, "X-Slack-Signature").ok_or(BridgeError::InvalidSignature)?;
        if !verify_slack_signature(secret, timestamp, &body, signature, Utc::now()) {
            return Err(BridgeError::InvalidSignature);
        }
    }

    let payload_str = extract_payload(&body)?;
    let payload: Value = serde_json::from_str(&payload_str)
        .map_err(|e| BridgeError::PayloadError(format!("invalid interaction payload: {}", e)))?;

    let action_type = payload.get("type").and_then(Value::as_str);
    if action_type != Some("block_actions") {
        return Ok(Json(json!({
            "status": "ignored",
            "message": format!("Unknown action type: {}", action_type.unwrap_or("none")),
        })));
    }

    let user = payload.get("user").cloned().unwrap_or_default();
    let user_name = user
        .get("name")
        .or_else(|| user.get("username"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();

    let original_blocks = payload
        .get("message")
        .and_then(|m| m.get("blocks"))
        .and_then(Value::as_array)
        .cloned();

    let actions = payload
        .get("actions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut result_text = None;
    let now = Utc::now();

    for action in &actions {
        let action_id = action.get("action_id").and_then(Value::as_str).unwrap_or("");
        let alert_ref = action
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::PayloadError("action without a value".into()))?;

        let (status, text) = if action_id == "ack_alert" {
            (
                AlertStatus::Acknowledged,
                format!(
                    "\u{2705} *Acknowledged* by @{} at {}",
                    user_name,
                    now.format("%H:%M:%S")
                ),
            )
        } else if let Some(duration) = action_id.strip_prefix("snooze_alert_") {
            (
                AlertStatus::Snoozed(duration.to_string()),
                format!("\u{1f507} *Snoozed* for {} by @{}", duration, user_name),
            )
        } else {
            warn!("Ignoring unknown action_id: {}", action_id);
            continue;
        };

        let row = state.store.update_status(alert_ref, &status, &user_name, now)?;
        info!(
            alert_id = %row.alert_id,
            status = %row.status,
            acked_by = %user_name,
            "Alert state updated"
        );

        // Message editing is best-effort: the state row is already updated.
        if !row.message_ts.is_empty() {
            if let Err(e) = state
                .slack
                .update_message(&row.channel, &row.message_ts, &text, original_blocks.as_deref())
                .await
            {
                warn!("Could not update Slack message {}: {}", row.message_ts, e);
            }
        }

        result_text = Some(text);
    }

    match result_text {
        Some(text) => Ok(Json(json!({
            "status": "ok",
            "response_action": "update",
            "text": text,
        }))),
        None => Ok(Json(json!({ "status": "ignored", "message": "No actionable buttons" }))),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Slack wraps the JSON document in `application/x-www-form-urlencoded` as a
/// `payload` field; a bare JSON body is accepted too.
fn extract_payload(body: &str) -> Result<String, BridgeError> {
    if body.trim_start().starts_with('{') {
        return Ok(body.to_string());
    }
    let form: HashMap<String, String> = serde_urlencoded::from_str(body)
        .map_err(|e| BridgeError::PayloadError(format!("invalid form body: {}", e)))?;
    form.get("payload")
        .cloned()
        .ok_or_else(|| BridgeError::PayloadError("no payload received".into()))
}
