//! Alert dispatch orchestration.
//!
//! Glues the pieces of one alert firing together: thread lookup, Block Kit
//! construction, Slack delivery, and alert-state bookkeeping. A delivery
//! failure is reported in the outcome, never raised — by the time we are
//! here any tracker update has already been persisted and must stand.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use crate::alert_state::AlertStateStore;
use crate::config::AppConfig;
use crate::slack::client::SlackClient;
use crate::slack::message::build_block_kit_message;
use crate::splunk::AlertPayload;
use crate::tracker::Transition;

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub delivered: bool,
    pub message_ts: Option<String>,
    pub alert_id: String,
}

/// Send one alert firing to Slack and record it for the acknowledgment flow.
///
/// Repeated firings of the same search inside the thread window land as
/// replies to the still-open alert instead of new channel messages.
pub async fn dispatch_alert(
    config: &AppConfig,
    slack: &SlackClient,
    payload: &AlertPayload,
    results: &[HashMap<String, String>],
    now: DateTime<Utc>,
) -> DispatchOutcome {
    let alert_id = format!("{}_{}", payload.search_name, now.timestamp_millis());
    let blocks = build_block_kit_message(
        &payload.alert_name(),
        &payload.search_name,
        results,
        payload.results_link.as_deref().unwrap_or(""),
        &alert_id,
        now,
    );

    let store = AlertStateStore::new(&config.lookups.alert_state);
    let thread_ts = store.recent_open_thread_ts(
        &payload.search_name,
        slack.channel(),
        Duration::minutes(config.thread_window_minutes),
        now,
    );

    let (delivered, message_ts) = slack.send_to_slack(&blocks, thread_ts.as_deref()).await;

    if delivered {
        info!(
            search = %payload.search_name,
            threaded = thread_ts.is_some(),
            "Alert dispatched to Slack"
        );
        // Only the bot-token path returns a ts; webhook deliveries have no
        // message identity to acknowledge against.
        if let Some(ts) = &message_ts {
            if let Err(e) =
                store.record_open(&alert_id, &payload.search_name, ts, slack.channel(), now)
            {
                error!("Alert sent but state row not recorded: {}", e);
            }
        }
    }

    DispatchOutcome {
        delivered,
        message_ts,
        alert_id,
    }
}

/// Render detected transitions as result rows for the Block Kit builder,
/// using the search's own field names for device/key/state.
pub fn transition_rows(
    transitions: &[Transition],
    key_field: &str,
    state_field: &str,
) -> Vec<HashMap<String, String>> {
    transitions
        .iter()
        .map(|t| {
            let mut row = HashMap::new();
            row.insert("device".to_string(), t.device.clone());
            row.insert(key_field.to_string(), t.entity_key.clone());
            row.insert(state_field.to_string(), t.current.clone());
            row.insert(
                "previous_state".to_string(),
                t.previous.clone().unwrap_or_else(|| "none".to_string()),
            );
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rows_use_search_field_names() {
        let transitions = vec![Transition {
            device: "FGT-01".to_string(),
            entity_key: "tunnel-hq".to_string(),
            previous: Some("up".to_string()),
            current: "down".to_string(),
        }];

        let rows = transition_rows(&transitions, "vpn_name", "status");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["device"], "FGT-01");
        assert_eq!(rows[0]["vpn_name"], "tunnel-hq");
        assert_eq!(rows[0]["status"], "down");
        assert_eq!(rows[0]["previous_state"], "up");
    }

    #[test]
    fn first_observation_previous_renders_none() {
        let transitions = vec![Transition {
            device: "FGT-01".to_string(),
            entity_key: "wan1".to_string(),
            previous: None,
            current: "up".to_string(),
        }];
        let rows = transition_rows(&transitions, "interface", "status");
        assert_eq!(rows[0]["previous_state"], "none");
    }
}
