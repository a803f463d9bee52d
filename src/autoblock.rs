//! Automated IP blocking from correlation results.
//!
//! Guarded pipeline per result row: whitelist, duplicate-block, and
//! score-threshold checks gate the FortiGate calls; every outcome is recorded
//! to the blocked-IPs table and the audit log and announced on Slack. Rows
//! are independent — one failure never stops the rest of the batch.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::config::{AppConfig, AUTO_BLOCK_THRESHOLD, REVIEW_THRESHOLD};
use crate::error::BridgeError;
use crate::fortigate::FortiGateClient;
use crate::lookup;
use crate::slack::client::SlackClient;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockedIpRow {
    pub ip: String,
    pub blocked_at: String,
    pub unblock_at: String,
    pub reason: String,
    pub policy_id: String,
    pub blocked_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WhitelistRow {
    pub ip: String,
    #[serde(default)]
    pub comment: String,
}

/// One correlation detection as delivered by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub src_ip: String,
    pub score: f64,
    pub rule: String,
    pub recommendation: String,
}

impl CorrelationResult {
    /// Field extraction with the originals' defaults: a missing or
    /// non-numeric score is 0 (monitor only), a missing recommendation is
    /// `MONITOR`.
    pub fn from_row(row: &HashMap<String, String>) -> Self {
        Self {
            src_ip: row.get("src_ip").cloned().unwrap_or_default(),
            score: row
                .get("correlation_score")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            rule: row
                .get("correlation_rule")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            recommendation: row
                .get("action_recommendation")
                .cloned()
                .unwrap_or_else(|| "MONITOR".to_string()),
        }
    }
}

/// What the guard chain decided for one result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDecision {
    MissingIp,
    Whitelisted,
    AlreadyBlocked,
    /// Below both thresholds, or no blockable recommendation.
    Monitor,
    /// Review band: notify a human, touch nothing.
    ReviewRequired,
    AutoBlock,
}

/// Pure guard chain, in precedence order. Whitelist beats everything, a
/// duplicate block beats the thresholds.
pub fn decide(
    result: &CorrelationResult,
    whitelist: &HashSet<String>,
    already_blocked: &HashSet<String>,
) -> BlockDecision {
    if result.src_ip.is_empty() {
        return BlockDecision::MissingIp;
    }
    if whitelist.contains(&result.src_ip) {
        return BlockDecision::Whitelisted;
    }
    if already_blocked.contains(&result.src_ip) {
        return BlockDecision::AlreadyBlocked;
    }
    if result.recommendation == "AUTO_BLOCK" && result.score >= AUTO_BLOCK_THRESHOLD {
        return BlockDecision::AutoBlock;
    }
    if result.recommendation == "REVIEW_AND_BLOCK" && result.score >= REVIEW_THRESHOLD {
        return BlockDecision::ReviewRequired;
    }
    BlockDecision::Monitor
}

#[derive(Debug, Default, PartialEq)]
pub struct ProcessSummary {
    pub blocked: Vec<String>,
    pub review_requested: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: usize,
}

pub struct AutoBlockEngine<'a> {
    config: &'a AppConfig,
    fortigate: &'a FortiGateClient,
    slack: &'a SlackClient,
    audit: &'a AuditLog,
}

impl<'a> AutoBlockEngine<'a> {
    pub fn new(
        config: &'a AppConfig,
        fortigate: &'a FortiGateClient,
        slack: &'a SlackClient,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            config,
            fortigate,
            slack,
            audit,
        }
    }

    fn load_whitelist(&self) -> HashSet<String> {
        match lookup::read_rows::<WhitelistRow>(&self.config.lookups.whitelist) {
            Ok(rows) => {
                info!("Loaded {} whitelisted IPs", rows.len());
                rows.into_iter().map(|row| row.ip).collect()
            }
            Err(e) => {
                warn!("Whitelist unavailable, continuing without it: {}", e);
                HashSet::new()
            }
        }
    }

    fn load_blocked(&self) -> Result<Vec<BlockedIpRow>, BridgeError> {
        lookup::read_rows(&self.config.lookups.blocked_ips)
    }

    /// Run the guarded pipeline over correlation result rows.
    pub async fn process_results(
        &self,
        rows: &[HashMap<String, String>],
    ) -> Result<ProcessSummary, BridgeError> {
        let mut summary = ProcessSummary::default();

        if self.config.fortigate.api_key.is_empty() {
            error!("FORTIGATE_API_KEY not configured - auto-blocking disabled");
            summary.skipped = rows.len();
            return Ok(summary);
        }

        let whitelist = self.load_whitelist();
        let mut already_blocked: HashSet<String> = self
            .load_blocked()?
            .into_iter()
            .map(|row| row.ip)
            .collect();

        for row in rows {
            let result = CorrelationResult::from_row(row);
            match decide(&result, &whitelist, &already_blocked) {
                BlockDecision::MissingIp => {
                    warn!(rule = %result.rule, "Missing src_ip field - skipping");
                    summary.skipped += 1;
                }
                BlockDecision::Whitelisted => {
                    info!(ip = %result.src_ip, "IP is whitelisted - skipping auto-block");
                    self.audit
                        .record("check_whitelist", &result.src_ip, "skipped", "whitelisted");
                    summary.skipped += 1;
                }
                BlockDecision::AlreadyBlocked => {
                    info!(ip = %result.src_ip, "IP already blocked - skipping duplicate");
                    summary.skipped += 1;
                }
                BlockDecision::Monitor => {
                    info!(
                        ip = %result.src_ip,
                        score = result.score,
                        "Below auto-block threshold - monitoring only"
                    );
                    summary.skipped += 1;
                }
                BlockDecision::ReviewRequired => {
                    info!(ip = %result.src_ip, score = result.score, "Manual review requested");
                    self.notify_outcome(&result, "review_required", None).await;
                    summary.review_requested.push(result.src_ip.clone());
                }
                BlockDecision::AutoBlock => {
                    if self.block_one(&result).await {
                        already_blocked.insert(result.src_ip.clone());
                        summary.blocked.push(result.src_ip.clone());
                    } else {
                        summary.failed.push(result.src_ip.clone());
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Block an IP directly, bypassing the score threshold but keeping the
    /// whitelist and duplicate guards. Used by the manual CLI path.
    pub async fn block_manual(&self, ip: &str, reason: &str) -> Result<(), BridgeError> {
        let whitelist = self.load_whitelist();
        let already_blocked: HashSet<String> =
            self.load_blocked()?.into_iter().map(|row| row.ip).collect();

        let result = CorrelationResult {
            src_ip: ip.to_string(),
            score: 100.0,
            rule: reason.to_string(),
            recommendation: "AUTO_BLOCK".to_string(),
        };

        match decide(&result, &whitelist, &already_blocked) {
            BlockDecision::AutoBlock => {
                if self.block_one(&result).await {
                    Ok(())
                } else {
                    Err(BridgeError::FortiGateApiError(format!(
                        "block of {} failed",
                        ip
                    )))
                }
            }
            decision => {
                warn!(ip = %ip, ?decision, "Manual block refused by guard chain");
                Err(BridgeError::FortiGateApiError(format!(
                    "block of {} refused: {:?}",
                    ip, decision
                )))
            }
        }
    }

    async fn block_one(&self, result: &CorrelationResult) -> bool {
        info!(
            ip = %result.src_ip,
            score = result.score,
            rule = %result.rule,
            "Starting auto-block"
        );

        match self.fortigate.block_ip(&result.src_ip, &result.rule).await {
            Ok(outcome) => {
                let now = Utc::now();
                let row = BlockedIpRow {
                    ip: result.src_ip.clone(),
                    blocked_at: now.to_rfc3339(),
                    unblock_at: (now + Duration::hours(self.config.block_duration_hours))
                        .to_rfc3339(),
                    reason: result.rule.clone(),
                    policy_id: outcome.policy_id.clone(),
                    blocked_by: "auto".to_string(),
                };
                if let Err(e) = lookup::with_exclusive_lock(&self.config.lookups.blocked_ips, || {
                    lookup::append_row(&self.config.lookups.blocked_ips, &row)
                }) {
                    error!(ip = %result.src_ip, "Block succeeded but tracking write failed: {}", e);
                }

                self.audit.record(
                    "auto_block",
                    &result.src_ip,
                    "blocked",
                    &format!("score={} rule={} policy={}", result.score, result.rule, outcome.policy_id),
                );
                self.notify_outcome(result, "blocked", None).await;
                true
            }
            Err(e) => {
                error!(ip = %result.src_ip, "Auto-block failed: {}", e);
                self.audit
                    .record("auto_block", &result.src_ip, "error", &e.to_string());
                self.notify_outcome(result, "failed", Some(&e.to_string())).await;
                false
            }
        }
    }

    /// Release every block whose `unblock_at` has passed. Rows whose API
    /// deletes fail stay in the table for the next sweep.
    pub async fn unblock_sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, BridgeError> {
        let rows = self.load_blocked()?;
        let mut kept = Vec::new();
        let mut released = Vec::new();

        for row in rows {
            let due = DateTime::parse_from_rfc3339(&row.unblock_at)
                .map(|at| at.with_timezone(&Utc) <= now)
                .unwrap_or_else(|e| {
                    warn!(ip = %row.ip, "Unparseable unblock_at, releasing: {}", e);
                    true
                });

            if !due {
                kept.push(row);
                continue;
            }

            match self.fortigate.unblock_ip(&row.ip, &row.policy_id).await {
                Ok(()) => {
                    info!(ip = %row.ip, "Released expired block");
                    self.audit
                        .record("unblock_sweep", &row.ip, "released", "block expired");
                    released.push(row.ip.clone());
                }
                Err(e) => {
                    error!(ip = %row.ip, "Unblock failed, keeping row for next sweep: {}", e);
                    self.audit
                        .record("unblock_sweep", &row.ip, "error", &e.to_string());
                    kept.push(row);
                }
            }
        }

        lookup::with_exclusive_lock(&self.config.lookups.blocked_ips, || {
            lookup::write_rows(&self.config.lookups.blocked_ips, &kept)
        })?;

        if !released.is_empty() {
            let payload = json!({
                "text": format!(
                    "\u{1f513} Auto-unblocked {} expired IP(s): {}",
                    released.len(),
                    released.join(", ")
                ),
            });
            let (delivered, _) = self.slack.post_payload(payload).await;
            if !delivered {
                warn!("Unblock notification not delivered");
            }
        }

        Ok(released)
    }

    /// Unblock a single IP immediately, regardless of its schedule.
    pub async fn unblock_manual(&self, ip: &str) -> Result<(), BridgeError> {
        let rows = self.load_blocked()?;
        let row = rows
            .iter()
            .find(|row| row.ip == ip)
            .cloned()
            .ok_or_else(|| BridgeError::FortiGateApiError(format!("{} is not blocked", ip)))?;

        self.fortigate.unblock_ip(&row.ip, &row.policy_id).await?;
        let kept: Vec<BlockedIpRow> = rows.into_iter().filter(|r| r.ip != ip).collect();
        lookup::with_exclusive_lock(&self.config.lookups.blocked_ips, || {
            lookup::write_rows(&self.config.lookups.blocked_ips, &kept)
        })?;
        self.audit
            .record("manual_unblock", ip, "released", "operator request");
        Ok(())
    }

    async fn notify_outcome(
        &self,
        result: &CorrelationResult,
        action_result: &str,
        error_message: Option<&str>,
    ) {
        let (color, title) = match action_result {
            "blocked" => ("#d93f3c", format!("\u{1f6ab} Auto-Block: {}", result.src_ip)),
            "review_required" => (
                "#f58f39",
                format!("\u{26a0}\u{fe0f} Review Requested: {}", result.src_ip),
            ),
            _ => ("#f58f39", format!("\u{26a0}\u{fe0f} Block Failed: {}", result.src_ip)),
        };

        let mut fields = vec![
            json!({ "title": "IP Address", "value": result.src_ip, "short": true }),
            json!({ "title": "Correlation Score", "value": format!("{}/100", result.score), "short": true }),
            json!({ "title": "Correlation Rule", "value": result.rule, "short": true }),
            json!({ "title": "Action", "value": action_result, "short": true }),
        ];
        if let Some(message) = error_message {
            fields.push(json!({ "title": "Error", "value": message, "short": false }));
        }

        let payload = json!({
            "attachments": [{
                "color": color,
                "title": title,
                "fields": fields,
                "footer": "FortiGate Alert Bridge",
                "ts": Utc::now().timestamp(),
            }]
        });

        let (delivered, _) = self.slack.post_payload(payload).await;
        if !delivered {
            warn!(ip = %result.src_ip, "Outcome notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ip: &str, score: f64, recommendation: &str) -> CorrelationResult {
        CorrelationResult {
            src_ip: ip.to_string(),
            score,
            rule: "multi_stage_attack".to_string(),
            recommendation: recommendation.to_string(),
        }
    }

    #[test]
    fn guard_precedence() {
        let whitelist: HashSet<String> = ["10.0.0.1".to_string()].into_iter().collect();
        let blocked: HashSet<String> = ["203.0.113.9".to_string()].into_iter().collect();

        assert_eq!(
            decide(&result("", 99.0, "AUTO_BLOCK"), &whitelist, &blocked),
            BlockDecision::MissingIp
        );
        assert_eq!(
            decide(&result("10.0.0.1", 99.0, "AUTO_BLOCK"), &whitelist, &blocked),
            BlockDecision::Whitelisted
        );
        assert_eq!(
            decide(&result("203.0.113.9", 99.0, "AUTO_BLOCK"), &whitelist, &blocked),
            BlockDecision::AlreadyBlocked
        );
    }

    #[test]
    fn threshold_bands() {
        let none = HashSet::new();

        assert_eq!(
            decide(&result("203.0.113.7", 95.0, "AUTO_BLOCK"), &none, &none),
            BlockDecision::AutoBlock
        );
        assert_eq!(
            decide(&result("203.0.113.7", 90.0, "AUTO_BLOCK"), &none, &none),
            BlockDecision::AutoBlock
        );
        // Review band requires the REVIEW_AND_BLOCK recommendation; an
        // AUTO_BLOCK below its threshold is monitor-only.
        assert_eq!(
            decide(&result("203.0.113.7", 85.0, "REVIEW_AND_BLOCK"), &none, &none),
            BlockDecision::ReviewRequired
        );
        assert_eq!(
            decide(&result("203.0.113.7", 85.0, "AUTO_BLOCK"), &none, &none),
            BlockDecision::Monitor
        );
        assert_eq!(
            decide(&result("203.0.113.7", 50.0, "REVIEW_AND_BLOCK"), &none, &none),
            BlockDecision::Monitor
        );
        assert_eq!(
            decide(&result("203.0.113.7", 99.0, "MONITOR"), &none, &none),
            BlockDecision::Monitor
        );
    }

    #[test]
    fn score_parsing_defaults_to_zero() {
        let mut row = HashMap::new();
        row.insert("src_ip".to_string(), "203.0.113.7".to_string());
        row.insert("correlation_score".to_string(), "not-a-number".to_string());

        let parsed = CorrelationResult::from_row(&row);
        assert_eq!(parsed.score, 0.0);
        assert_eq!(parsed.rule, "unknown");
        assert_eq!(parsed.recommendation, "MONITOR");
    }
}
