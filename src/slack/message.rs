//! Block Kit message construction.
//!
//! Pure formatting: given the alert name, result rows, and a results link,
//! produce the block array the dispatcher posts. Deterministic for a given
//! input (the caller supplies the timestamp), so every layout rule here is
//! directly testable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Events displayed in full before the overflow context block takes over.
pub const MAX_DISPLAYED_EVENTS: usize = 5;
/// Fields displayed per event.
pub const MAX_FIELDS_PER_EVENT: usize = 10;
/// Field values longer than this are truncated with an ellipsis.
pub const MAX_FIELD_VALUE_LEN: usize = 100;

const IMPORTANT_FIELDS: &[&str] = &[
    "device",
    "user",
    "source_ip",
    "srcip",
    "vpn_name",
    "interface",
    "component",
    "criticality",
    "severity",
    "logdesc",
    "msg",
    "details",
];

const EXCLUDED_FIELDS: &[&str] = &["_time", "_raw", "count"];

/// Severity emoji keyed off the alert name, highest priority keyword first.
pub fn severity_emoji(alert_name: &str) -> &'static str {
    const SEVERITY_MAP: &[(&str, &str)] = &[
        ("Hardware", "\u{1f534}"),
        ("VPN", "\u{1f534}"),
        ("HA", "\u{1f7e0}"),
        ("Interface", "\u{1f7e0}"),
        ("Config", "\u{1f7e1}"),
        ("CPU", "\u{1f7e1}"),
    ];
    for (keyword, emoji) in SEVERITY_MAP {
        if alert_name.contains(keyword) {
            return emoji;
        }
    }
    "\u{1f535}"
}

/// `vpn_name` → `🔐 *Vpn Name:* tunnel-hq`, values truncated at
/// [`MAX_FIELD_VALUE_LEN`] characters.
pub fn format_field_value(key: &str, value: &str) -> String {
    let value = if value.chars().count() > MAX_FIELD_VALUE_LEN {
        let truncated: String = value.chars().take(MAX_FIELD_VALUE_LEN - 3).collect();
        format!("{}...", truncated)
    } else {
        value.to_string()
    };

    let emoji = match key {
        "device" => "\u{1f5a5}\u{fe0f}",
        "user" => "\u{1f464}",
        "source_ip" | "srcip" => "\u{1f310}",
        "dstip" => "\u{1f3af}",
        "vpn_name" => "\u{1f510}",
        "interface" => "\u{1f50c}",
        "component" => "\u{2699}\u{fe0f}",
        "criticality" => "\u{26a1}",
        "severity" => "\u{1f4ca}",
        _ => "",
    };

    let label = key
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if emoji.is_empty() {
        format!("*{}:* {}", label, value)
    } else {
        format!("{} *{}:* {}", emoji, label, value)
    }
}

fn event_fields(result: &HashMap<String, String>) -> Vec<Value> {
    let mut fields = Vec::new();

    for key in IMPORTANT_FIELDS {
        if let Some(value) = result.get(*key).filter(|v| !v.is_empty()) {
            fields.push(json!({ "type": "mrkdwn", "text": format_field_value(key, value) }));
        }
    }

    // Remaining fields in sorted order for a stable layout.
    let mut rest: Vec<(&String, &String)> = result
        .iter()
        .filter(|(key, value)| {
            !IMPORTANT_FIELDS.contains(&key.as_str())
                && !EXCLUDED_FIELDS.contains(&key.as_str())
                && !value.is_empty()
        })
        .collect();
    rest.sort_by_key(|(key, _)| key.as_str());
    for (key, value) in rest {
        fields.push(json!({ "type": "mrkdwn", "text": format_field_value(key, value) }));
    }

    fields.truncate(MAX_FIELDS_PER_EVENT);
    fields
}

/// Build the full block array for an alert firing.
///
/// `alert_id` rides inside the Acknowledge/Snooze button values so the
/// interaction callback can find the state row without any other context.
pub fn build_block_kit_message(
    alert_name: &str,
    search_name: &str,
    results: &[HashMap<String, String>],
    view_link: &str,
    alert_id: &str,
    now: DateTime<Utc>,
) -> Vec<Value> {
    let emoji = severity_emoji(alert_name);
    let result_count = results.len();

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("{} FortiGate Alert: {}", emoji, alert_name),
                "emoji": true
            }
        }),
        json!({
            "type": "section",
            "fields": [
                { "type": "mrkdwn", "text": format!("*Alert:* {}", search_name) },
                { "type": "mrkdwn", "text": format!("*Count:* {} events", result_count) },
                { "type": "mrkdwn", "text": format!("*Time:* {}", now.format("%Y-%m-%d %H:%M:%S UTC")) },
                { "type": "mrkdwn", "text": "*Source:* FortiGate Alert Bridge" }
            ]
        }),
        json!({ "type": "divider" }),
    ];

    for (i, result) in results.iter().take(MAX_DISPLAYED_EVENTS).enumerate() {
        if i > 0 {
            blocks.push(json!({ "type": "divider" }));
        }
        let fields = event_fields(result);
        if !fields.is_empty() {
            blocks.push(json!({ "type": "section", "fields": fields }));
        }
    }

    if result_count > MAX_DISPLAYED_EVENTS {
        blocks.push(json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!(
                    "\u{1f4cc} Showing {} of {} events. Check Splunk for full details.",
                    MAX_DISPLAYED_EVENTS, result_count
                )
            }]
        }));
    }

    let mut action_elements = Vec::new();
    if !view_link.is_empty() {
        action_elements.push(json!({
            "type": "button",
            "text": { "type": "plain_text", "text": "View in Splunk", "emoji": true },
            "url": view_link,
            "style": "primary"
        }));
    }
    action_elements.push(json!({
        "type": "button",
        "text": { "type": "plain_text", "text": "\u{2705} Acknowledge", "emoji": true },
        "action_id": "ack_alert",
        "value": alert_id
    }));
    action_elements.push(json!({
        "type": "button",
        "text": { "type": "plain_text", "text": "\u{1f507} Snooze 1h", "emoji": true },
        "action_id": "snooze_alert_1h",
        "value": alert_id
    }));
    blocks.push(json!({ "type": "actions", "elements": action_elements }));

    blocks
}

/// Replace the actions block with a status context line, for `chat.update`
/// after an acknowledge or snooze.
pub fn resolve_actions(blocks: &[Value], status_text: &str) -> Vec<Value> {
    let mut updated: Vec<Value> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) != Some("actions"))
        .cloned()
        .collect();
    updated.push(json!({
        "type": "context",
        "elements": [{ "type": "mrkdwn", "text": status_text }]
    }));
    updated
}
