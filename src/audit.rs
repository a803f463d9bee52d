//! Append-only audit trail of response actions.
//!
//! Every block, unblock, and auto-response decision lands here as one
//! `key=value` line so the history survives process restarts and can be
//! ingested back into Splunk. Write failures are logged and swallowed: the
//! audit trail never blocks the action it describes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use tracing::error;

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, action: &str, ip: &str, status: &str, message: &str) {
        let line = format!(
            "{} action={} ip={} status={} message=\"{}\"",
            Utc::now().to_rfc3339(),
            action,
            ip,
            status,
            message.replace('"', "'"),
        );

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create audit log directory: {}", e);
                    return;
                }
            }
        }

        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    error!("Failed to write to {}: {}", self.path.display(), e);
                }
            }
            Err(e) => {
                error!(
                    "Failed to open {} for appending: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));

        log.record("auto_block", "203.0.113.7", "blocked", "score 95");
        log.record("unblock_sweep", "203.0.113.7", "released", "expired");

        let content = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("action=auto_block"));
        assert!(lines[0].contains("ip=203.0.113.7"));
        assert!(lines[1].contains("status=released"));
    }

    #[test]
    fn quotes_in_messages_are_defanged() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        log.record("auto_block", "-", "error", "policy \"DENY\" rejected");

        let content = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(content.contains("message=\"policy 'DENY' rejected\""));
    }
}
