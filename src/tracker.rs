//! State-transition detection over a CSV tracker table.
//!
//! Each scheduled search observes the current state of some entity class
//! (VPN tunnels, interfaces, HA members, hardware components) and the tracker
//! answers one question per `(device, entity_key)` pair: did the state change
//! since the last run? Only changed rows flow on to the alert dispatcher; the
//! full merged snapshot is written back in one overwrite, so rows accumulate
//! and are never deleted.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::lookup;

/// One persisted row of a state-tracker table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerRow {
    pub device: String,
    pub entity_key: String,
    pub state: String,
    pub last_change: String,
}

/// A freshly observed entity state, before comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedState {
    pub device: String,
    pub entity_key: String,
    pub state: String,
}

/// An edge detected between the persisted and observed state.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub device: String,
    pub entity_key: String,
    pub previous: Option<String>,
    pub current: String,
}

/// True iff the entity was never seen before or its state differs.
pub fn state_changed(previous: Option<&str>, current: &str) -> bool {
    match previous {
        None => true,
        Some(prev) => prev != current,
    }
}

/// Extract observed states from Splunk result rows using configurable field
/// names. Rows missing any of the three fields are skipped with a warning.
pub fn observed_from_results(
    rows: &[HashMap<String, String>],
    device_field: &str,
    key_field: &str,
    state_field: &str,
) -> Vec<ObservedState> {
    let mut observed = Vec::with_capacity(rows.len());
    for row in rows {
        let device = row.get(device_field).filter(|v| !v.is_empty());
        let key = row.get(key_field).filter(|v| !v.is_empty());
        let state = row.get(state_field).filter(|v| !v.is_empty());
        match (device, key, state) {
            (Some(device), Some(key), Some(state)) => observed.push(ObservedState {
                device: device.clone(),
                entity_key: key.clone(),
                state: state.clone(),
            }),
            _ => warn!(
                "Skipping result row missing {}/{}/{}",
                device_field, key_field, state_field
            ),
        }
    }
    observed
}

/// The CSV-backed tracker for one entity class.
pub struct StateTracker {
    path: PathBuf,
}

impl StateTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Compare `observed` against the persisted snapshot, rewrite the merged
    /// snapshot, and return only the rows whose state changed.
    ///
    /// Duplicate `(device, entity_key)` pairs are not a constraint the table
    /// enforces: loading resolves them last-write-wins, the same way a full
    /// rewrite would. Entities present in the snapshot but absent from this
    /// observation carry forward unchanged. The read-diff-rewrite cycle runs
    /// under the table's exclusive lock.
    pub fn evaluate(
        &self,
        observed: &[ObservedState],
        now: DateTime<Utc>,
    ) -> Result<Vec<Transition>, BridgeError> {
        lookup::with_exclusive_lock(&self.path, || {
            let previous_rows: Vec<TrackerRow> = lookup::read_rows(&self.path)?;

            // Last write wins on duplicate keys, preserving first-seen order.
            let mut order: Vec<(String, String)> = Vec::new();
            let mut snapshot: HashMap<(String, String), TrackerRow> = HashMap::new();
            for row in previous_rows {
                let key = (row.device.clone(), row.entity_key.clone());
                if !snapshot.contains_key(&key) {
                    order.push(key.clone());
                }
                snapshot.insert(key, row);
            }

            let mut transitions = Vec::new();
            for obs in observed {
                let key = (obs.device.clone(), obs.entity_key.clone());
                let previous = snapshot.get(&key).map(|row| row.state.clone());

                if state_changed(previous.as_deref(), &obs.state) {
                    transitions.push(Transition {
                        device: obs.device.clone(),
                        entity_key: obs.entity_key.clone(),
                        previous: previous.clone(),
                        current: obs.state.clone(),
                    });
                    if !snapshot.contains_key(&key) {
                        order.push(key.clone());
                    }
                    snapshot.insert(
                        key,
                        TrackerRow {
                            device: obs.device.clone(),
                            entity_key: obs.entity_key.clone(),
                            state: obs.state.clone(),
                            last_change: now.to_rfc3339(),
                        },
                    );
                } else {
                    debug!(
                        device = %obs.device,
                        entity_key = %obs.entity_key,
                        state = %obs.state,
                        "State unchanged"
                    );
                }
            }

            let rows: Vec<&TrackerRow> = order
                .iter()
                .filter_map(|key| snapshot.get(key))
                .collect();
            lookup::write_rows(&self.path, &rows)?;

            Ok(transitions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(device: &str, key: &str, state: &str) -> ObservedState {
        ObservedState {
            device: device.to_string(),
            entity_key: key.to_string(),
            state: state.to_string(),
        }
    }

    #[test]
    fn state_changed_truth_table() {
        assert!(state_changed(None, "up"));
        assert!(!state_changed(Some("up"), "up"));
        assert!(state_changed(Some("up"), "down"));
    }

    #[test]
    fn first_observation_is_a_transition() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("vpn_state_tracker.csv"));

        let transitions = tracker
            .evaluate(&[obs("FGT-01", "tunnel-hq", "up")], Utc::now())
            .unwrap();

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].previous, None);
        assert_eq!(transitions[0].current, "up");
    }

    #[test]
    fn unchanged_state_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("vpn_state_tracker.csv"));
        let now = Utc::now();

        tracker.evaluate(&[obs("FGT-01", "tunnel-hq", "up")], now).unwrap();
        let transitions = tracker
            .evaluate(&[obs("FGT-01", "tunnel-hq", "up")], now)
            .unwrap();

        assert!(transitions.is_empty());
    }

    #[test]
    fn unobserved_entities_carry_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn_state_tracker.csv");
        let tracker = StateTracker::new(&path);
        let now = Utc::now();

        tracker
            .evaluate(
                &[obs("FGT-01", "tunnel-hq", "up"), obs("FGT-02", "tunnel-dr", "up")],
                now,
            )
            .unwrap();
        // Next run only observes FGT-01.
        tracker.evaluate(&[obs("FGT-01", "tunnel-hq", "down")], now).unwrap();

        let rows: Vec<TrackerRow> = lookup::read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        let dr = rows
            .iter()
            .find(|r| r.device == "FGT-02")
            .expect("FGT-02 row retained");
        assert_eq!(dr.state, "up");
    }

    #[test]
    fn duplicate_keys_resolve_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn_state_tracker.csv");

        // Seed a file with two rows for the same key; nothing enforces
        // uniqueness at the storage level.
        let seeded = vec![
            TrackerRow {
                device: "FGT-01".to_string(),
                entity_key: "tunnel-hq".to_string(),
                state: "up".to_string(),
                last_change: Utc::now().to_rfc3339(),
            },
            TrackerRow {
                device: "FGT-01".to_string(),
                entity_key: "tunnel-hq".to_string(),
                state: "down".to_string(),
                last_change: Utc::now().to_rfc3339(),
            },
        ];
        lookup::write_rows(&path, &seeded).unwrap();

        let tracker = StateTracker::new(&path);
        // The later seeded row ("down") is authoritative, so observing "down"
        // is not a transition.
        let transitions = tracker
            .evaluate(&[obs("FGT-01", "tunnel-hq", "down")], Utc::now())
            .unwrap();
        assert!(transitions.is_empty());

        // And the rewrite collapses the duplicates.
        let rows: Vec<TrackerRow> = lookup::read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "down");
    }

    #[test]
    fn observed_rows_missing_fields_are_skipped() {
        let mut complete = HashMap::new();
        complete.insert("device".to_string(), "FGT-01".to_string());
        complete.insert("vpn_name".to_string(), "tunnel-hq".to_string());
        complete.insert("status".to_string(), "up".to_string());

        let mut incomplete = HashMap::new();
        incomplete.insert("device".to_string(), "FGT-02".to_string());
        incomplete.insert("status".to_string(), "down".to_string());

        let observed =
            observed_from_results(&[complete, incomplete], "device", "vpn_name", "status");
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].device, "FGT-01");
    }
}
