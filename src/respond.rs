//! Alert-keyed automated responses.
//!
//! Some searches warrant more than a notification: repeated SSL-VPN failures
//! get the source blocked, traffic spikes get rate-limited, and a hammered
//! admin account gets disabled. The mapping is keyed on the search name; any
//! unmapped alert falls through to notification-only.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::autoblock::AutoBlockEngine;
use crate::fortigate::FortiGateClient;
use crate::slack::client::SlackClient;

const BRUTE_FORCE_THRESHOLD: u64 = 10;
const SPIKE_MULTIPLIER_THRESHOLD: f64 = 5.0;
const ADMIN_FAIL_THRESHOLD: u64 = 5;
const SPIKE_LIMIT_MBPS: u32 = 10;

/// What the responder did for one alert.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Blocked { ip: String },
    RateLimited { ip: String, limit_mbps: u32 },
    AccountDisabled { user: String },
    /// Below the handler's threshold; watched but untouched.
    Monitoring,
    NotificationOnly,
    Failed { message: String },
}

impl ResponseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseOutcome::Blocked { .. } => "blocked",
            ResponseOutcome::RateLimited { .. } => "rate_limited",
            ResponseOutcome::AccountDisabled { .. } => "account_disabled",
            ResponseOutcome::Monitoring => "monitoring",
            ResponseOutcome::NotificationOnly => "notification_only",
            ResponseOutcome::Failed { .. } => "error",
        }
    }
}

fn field<'a>(data: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| data.get(*key).map(String::as_str))
        .filter(|v| !v.is_empty())
}

fn count_field(data: &HashMap<String, String>, key: &str) -> u64 {
    data.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

pub struct AutoResponseEngine<'a> {
    fortigate: &'a FortiGateClient,
    slack: &'a SlackClient,
    audit: &'a AuditLog,
    blocker: &'a AutoBlockEngine<'a>,
}

impl<'a> AutoResponseEngine<'a> {
    pub fn new(
        fortigate: &'a FortiGateClient,
        slack: &'a SlackClient,
        audit: &'a AuditLog,
        blocker: &'a AutoBlockEngine<'a>,
    ) -> Self {
        Self {
            fortigate,
            slack,
            audit,
            blocker,
        }
    }

    /// Dispatch one alert to its handler, notify Slack, and audit the result.
    pub async fn execute(
        &self,
        search_name: &str,
        data: &HashMap<String, String>,
    ) -> ResponseOutcome {
        info!(search = %search_name, "Processing automated response");

        let outcome = if search_name.contains("SSL_VPN_Brute_Force") {
            self.handle_brute_force(data).await
        } else if search_name.contains("Abnormal_Traffic_Spike") {
            self.handle_traffic_spike(data).await
        } else if search_name.contains("Admin_Login_Failed") {
            self.handle_admin_login_failed(data).await
        } else {
            ResponseOutcome::NotificationOnly
        };

        let ip = field(data, &["src_ip", "srcip", "source_ip", "ip"]).unwrap_or("-");
        self.audit.record(
            "auto_response",
            ip,
            outcome.label(),
            &format!("search={}", search_name),
        );
        self.notify(search_name, &outcome).await;
        outcome
    }

    async fn handle_brute_force(&self, data: &HashMap<String, String>) -> ResponseOutcome {
        let Some(ip) = field(data, &["src_ip", "srcip", "source_ip"]) else {
            return ResponseOutcome::Failed {
                message: "no source IP in brute-force alert".to_string(),
            };
        };
        let fail_count = count_field(data, "fail_count");
        if fail_count < BRUTE_FORCE_THRESHOLD {
            return ResponseOutcome::Monitoring;
        }

        match self
            .blocker
            .block_manual(ip, &format!("Brute force attack: {} failed attempts", fail_count))
            .await
        {
            Ok(()) => ResponseOutcome::Blocked { ip: ip.to_string() },
            Err(e) => ResponseOutcome::Failed {
                message: e.to_string(),
            },
        }
    }

    async fn handle_traffic_spike(&self, data: &HashMap<String, String>) -> ResponseOutcome {
        let Some(ip) = field(data, &["src_ip", "srcip", "source_ip"]) else {
            return ResponseOutcome::Failed {
                message: "no source IP in traffic-spike alert".to_string(),
            };
        };
        let multiplier: f64 = data
            .get("spike_multiplier")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0);
        if multiplier < SPIKE_MULTIPLIER_THRESHOLD {
            return ResponseOutcome::Monitoring;
        }

        match self.fortigate.apply_bandwidth_limit(ip, SPIKE_LIMIT_MBPS).await {
            Ok(()) => ResponseOutcome::RateLimited {
                ip: ip.to_string(),
                limit_mbps: SPIKE_LIMIT_MBPS,
            },
            Err(e) => ResponseOutcome::Failed {
                message: e.to_string(),
            },
        }
    }

    async fn handle_admin_login_failed(&self, data: &HashMap<String, String>) -> ResponseOutcome {
        let Some(user) = field(data, &["user", "admin", "username"]) else {
            return ResponseOutcome::Failed {
                message: "no user in admin-login alert".to_string(),
            };
        };
        let fail_count = count_field(data, "fail_count");
        if fail_count < ADMIN_FAIL_THRESHOLD {
            return ResponseOutcome::Monitoring;
        }

        match self.fortigate.disable_admin_account(user).await {
            Ok(()) => ResponseOutcome::AccountDisabled {
                user: user.to_string(),
            },
            Err(e) => ResponseOutcome::Failed {
                message: e.to_string(),
            },
        }
    }

    async fn notify(&self, search_name: &str, outcome: &ResponseOutcome) {
        let details = match outcome {
            ResponseOutcome::Blocked { ip } => format!("Blocked {}", ip),
            ResponseOutcome::RateLimited { ip, limit_mbps } => {
                format!("Limited {} to {} Mbps", ip, limit_mbps)
            }
            ResponseOutcome::AccountDisabled { user } => format!("Disabled account {}", user),
            ResponseOutcome::Monitoring => "Below action threshold - monitoring".to_string(),
            ResponseOutcome::NotificationOnly => "No automated action mapped".to_string(),
            ResponseOutcome::Failed { message } => format!("Action failed: {}", message),
        };

        let payload = json!({
            "text": "\u{1f916} *Automated Response Executed*",
            "attachments": [{
                "color": "warning",
                "fields": [
                    { "title": "Alert", "value": search_name, "short": true },
                    { "title": "Action", "value": outcome.label(), "short": true },
                    { "title": "Details", "value": details, "short": false },
                    { "title": "Timestamp", "value": Utc::now().to_rfc3339(), "short": true },
                ]
            }]
        });

        let (delivered, _) = self.slack.post_payload(payload).await;
        if !delivered {
            warn!(search = %search_name, "Response notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(
            ResponseOutcome::Blocked { ip: "1.2.3.4".into() }.label(),
            "blocked"
        );
        assert_eq!(ResponseOutcome::Monitoring.label(), "monitoring");
        assert_eq!(
            ResponseOutcome::Failed { message: "x".into() }.label(),
            "error"
        );
    }

    #[test]
    fn field_lookup_prefers_first_present_key() {
        let mut data = HashMap::new();
        data.insert("source_ip".to_string(), "10.0.0.9".to_string());
        data.insert("srcip".to_string(), "10.0.0.1".to_string());

        assert_eq!(
            field(&data, &["src_ip", "srcip", "source_ip"]),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn count_field_defaults_to_zero() {
        let mut data = HashMap::new();
        data.insert("fail_count".to_string(), "many".to_string());
        assert_eq!(count_field(&data, "fail_count"), 0);
        assert_eq!(count_field(&data, "missing"), 0);
    }
}
