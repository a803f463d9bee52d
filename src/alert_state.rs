//! Alert-state bookkeeping for the Slack acknowledgment workflow.
//!
//! Every alert delivered through the bot-token path gets a row mapping its
//! opaque `alert_id` and Slack `message_ts` to a lifecycle status. The
//! callback handler flips `open` rows to `acknowledged` or
//! `snoozed_<duration>`; nothing in this system reopens a snoozed alert.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BridgeError;
use crate::lookup;

/// The file is capped to this many most-recent rows on every rewrite.
pub const ALERT_STATE_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertStateRow {
    pub alert_id: String,
    pub search_name: String,
    pub message_ts: String,
    pub channel: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub acked_by: String,
}

/// Lifecycle states an alert row can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertStatus {
    Open,
    Acknowledged,
    /// Duration label as it arrived from the Slack button, e.g. `1h`.
    Snoozed(String),
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Open => write!(f, "open"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Snoozed(duration) => write!(f, "snoozed_{}", duration),
        }
    }
}

impl AlertStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => AlertStatus::Open,
            "acknowledged" => AlertStatus::Acknowledged,
            other => match other.strip_prefix("snoozed_") {
                Some(duration) => AlertStatus::Snoozed(duration.to_string()),
                None => AlertStatus::Open,
            },
        }
    }
}

pub struct AlertStateStore {
    path: PathBuf,
}

impl AlertStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record a freshly sent alert as `open`, creating the file with its
    /// header if missing and capping it to the newest [`ALERT_STATE_CAP`]
    /// rows.
    pub fn record_open(
        &self,
        alert_id: &str,
        search_name: &str,
        message_ts: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        let timestamp = now.to_rfc3339();
        let row = AlertStateRow {
            alert_id: alert_id.to_string(),
            search_name: search_name.to_string(),
            message_ts: message_ts.to_string(),
            channel: channel.to_string(),
            status: AlertStatus::Open.to_string(),
            created_at: timestamp.clone(),
            updated_at: timestamp,
            acked_by: String::new(),
        };

        lookup::with_exclusive_lock(&self.path, || {
            let mut rows: Vec<AlertStateRow> = lookup::read_rows(&self.path)?;
            rows.push(row);
            if rows.len() > ALERT_STATE_CAP {
                let drop = rows.len() - ALERT_STATE_CAP;
                rows.drain(..drop);
            }
            lookup::write_rows(&self.path, &rows)
        })
    }

    /// Transition the row matching `alert_ref` (exact `alert_id` or
    /// `message_ts`) to `status`. The whole file is rewritten under the
    /// exclusive lock. Returns the updated row.
    pub fn update_status(
        &self,
        alert_ref: &str,
        status: &AlertStatus,
        acked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<AlertStateRow, BridgeError> {
        lookup::with_exclusive_lock(&self.path, || {
            let mut rows: Vec<AlertStateRow> = lookup::read_rows(&self.path)?;
            let mut updated: Option<AlertStateRow> = None;

            for row in rows.iter_mut() {
                if row.alert_id == alert_ref || row.message_ts == alert_ref {
                    row.status = status.to_string();
                    row.updated_at = now.to_rfc3339();
                    row.acked_by = acked_by.to_string();
                    updated = Some(row.clone());
                }
            }

            match updated {
                Some(row) => {
                    lookup::write_rows(&self.path, &rows)?;
                    Ok(row)
                }
                None => Err(BridgeError::AlertNotFound(alert_ref.to_string())),
            }
        })
    }

    /// The `message_ts` of the most recent still-open alert for the same
    /// search and channel inside `window`, used to thread repeats. Read
    /// problems degrade to `None`: threading is best-effort.
    pub fn recent_open_thread_ts(
        &self,
        search_name: &str,
        channel: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let rows: Vec<AlertStateRow> = match lookup::read_rows(&self.path) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not read alert state for threading: {}", e);
                return None;
            }
        };

        rows.iter()
            .rev()
            .filter(|row| {
                row.search_name == search_name
                    && row.channel == channel
                    && row.status == AlertStatus::Open.to_string()
                    && !row.message_ts.is_empty()
            })
            .find(|row| {
                DateTime::parse_from_rfc3339(&row.created_at)
                    .map(|created| now.signed_duration_since(created.with_timezone(&Utc)) <= window)
                    .unwrap_or(false)
            })
            .map(|row| row.message_ts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> AlertStateStore {
        AlertStateStore::new(dir.path().join("alert_state.csv"))
    }

    #[test]
    fn record_creates_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.record_open("a1", "test_search", "12345.6789", "#alerts", Utc::now())
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("alert_state.csv")).unwrap();
        assert!(content.starts_with(
            "alert_id,search_name,message_ts,channel,status,created_at,updated_at,acked_by"
        ));
        assert!(content.contains("12345.6789"));
    }

    #[test]
    fn update_by_alert_id_and_by_ts() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let now = Utc::now();
        s.record_open("a1", "search_a", "111.222", "#alerts", now)
            .unwrap();
        s.record_open("a2", "search_b", "333.444", "#alerts", now)
            .unwrap();

        let row = s
            .update_status("a1", &AlertStatus::Acknowledged, "alice", now)
            .unwrap();
        assert_eq!(row.status, "acknowledged");
        assert_eq!(row.acked_by, "alice");

        let row = s
            .update_status(
                "333.444",
                &AlertStatus::Snoozed("1h".to_string()),
                "bob",
                now,
            )
            .unwrap();
        assert_eq!(row.status, "snoozed_1h");
    }

    #[test]
    fn update_unknown_ref_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.record_open("a1", "search_a", "111.222", "#alerts", Utc::now())
            .unwrap();

        let err = s
            .update_status("missing", &AlertStatus::Acknowledged, "alice", Utc::now())
            .unwrap_err();
        assert!(matches!(err, BridgeError::AlertNotFound(_)));
    }

    #[test]
    fn file_capped_to_newest_rows() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let now = Utc::now();

        for i in 0..(ALERT_STATE_CAP + 5) {
            s.record_open(&format!("a{}", i), "search", &format!("{}.0", i), "#c", now)
                .unwrap();
        }

        let rows: Vec<AlertStateRow> =
            lookup::read_rows(&dir.path().join("alert_state.csv")).unwrap();
        assert_eq!(rows.len(), ALERT_STATE_CAP);
        assert_eq!(rows[0].alert_id, "a5");
        assert_eq!(rows.last().unwrap().alert_id, format!("a{}", ALERT_STATE_CAP + 4));
    }

    #[test]
    fn threading_matches_only_open_rows_in_window() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let now = Utc::now();

        s.record_open("old", "search", "1.0", "#c", now - Duration::hours(3))
            .unwrap();
        s.record_open("recent", "search", "2.0", "#c", now - Duration::minutes(10))
            .unwrap();
        s.record_open("other_channel", "search", "3.0", "#d", now)
            .unwrap();

        let ts = s.recent_open_thread_ts("search", "#c", Duration::hours(1), now);
        assert_eq!(ts.as_deref(), Some("2.0"));

        // Acknowledged rows stop threading.
        s.update_status("recent", &AlertStatus::Acknowledged, "alice", now)
            .unwrap();
        assert!(s
            .recent_open_thread_ts("search", "#c", Duration::hours(1), now)
            .is_none());
    }

    #[test]
    fn status_round_trip() {
        assert_eq!(AlertStatus::parse("open"), AlertStatus::Open);
        assert_eq!(AlertStatus::parse("acknowledged"), AlertStatus::Acknowledged);
        assert_eq!(
            AlertStatus::parse("snoozed_1h"),
            AlertStatus::Snoozed("1h".to_string())
        );
        assert_eq!(AlertStatus::Snoozed("30m".to_string()).to_string(), "snoozed_30m");
    }
}
