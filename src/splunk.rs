//! Splunk alert-action protocol.
//!
//! When a scheduled search fires, Splunk execs the action with a JSON document
//! on stdin describing the firing (search name, configuration map, a link back
//! to the results, and the path of a gzipped CSV file holding the result
//! rows). Stdout belongs to Splunk; everything diagnostic goes to stderr.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::BridgeError;

/// The JSON document Splunk writes to an alert action's stdin.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertPayload {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub results_file: Option<String>,
    #[serde(default = "default_search_name")]
    pub search_name: String,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
    #[serde(default)]
    pub results_link: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
}

fn default_search_name() -> String {
    "Unknown Alert".to_string()
}

impl AlertPayload {
    /// Parse the stdin document. Malformed JSON is rejected early; the caller
    /// exits non-zero rather than limping on with a half-read payload.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, BridgeError> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(|e| BridgeError::PayloadError(format!("failed to read stdin: {}", e)))?;
        if raw.trim().is_empty() {
            return Err(BridgeError::PayloadError("empty stdin".to_string()));
        }
        serde_json::from_str(&raw)
            .map_err(|e| BridgeError::PayloadError(format!("invalid JSON on stdin: {}", e)))
    }

    /// Alert display name: the search name with underscores spaced out and
    /// each word title-cased, e.g. `012_VPN_Tunnel_Status` → `012 Vpn Tunnel Status`.
    pub fn alert_name(&self) -> String {
        self.search_name
            .split('_')
            .filter(|part| !part.is_empty())
            .map(title_case)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Flatten the inline `result` object into a string row, the same shape the
/// results file yields. Non-string scalars keep their JSON rendering.
pub fn result_to_row(value: &Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(key, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), rendered)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a gzipped-CSV results file into one map per row.
///
/// Mirrors the delivery contract of the alert pipeline: any I/O or format
/// problem is logged and yields an empty result set, never an error. A
/// missing or truncated results file must not take the whole action down.
pub fn parse_results_file(path: &Path) -> Vec<HashMap<String, String>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            error!("Error reading results file {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let decoder = GzDecoder::new(file);
    let mut reader = csv::Reader::from_reader(decoder);

    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(e) => {
            error!("Error parsing results header in {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        match record {
            Ok(record) => {
                let row: HashMap<String, String> = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                rows.push(row);
            }
            Err(e) => {
                warn!("Skipping malformed results row in {}: {}", path.display(), e);
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gzip_csv(path: &Path, content: &str) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn parses_gzipped_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv.gz");
        write_gzip_csv(&path, "device,logid,msg\nFG100,001,test\nFG200,002,test2\n");

        let rows = parse_results_file(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["device"], "FG100");
        assert_eq!(rows[1]["logid"], "002");
    }

    #[test]
    fn missing_file_yields_empty() {
        assert!(parse_results_file(Path::new("/nonexistent/results.csv.gz")).is_empty());
    }

    #[test]
    fn invalid_gzip_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv.gz");
        std::fs::write(&path, "not gzip data").unwrap();
        assert!(parse_results_file(&path).is_empty());
    }

    #[test]
    fn header_only_csv_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv.gz");
        write_gzip_csv(&path, "device\n");
        assert!(parse_results_file(&path).is_empty());
    }

    #[test]
    fn payload_defaults_and_overrides() {
        let payload = AlertPayload::from_reader(
            r#"{
                "search_name": "012_VPN_Tunnel_Status",
                "results_link": "https://splunk.local/app/search?sid=1",
                "configuration": {"webhook_url": "https://hooks.slack.com/services/T/B/x"}
            }"#
            .as_bytes(),
        )
        .unwrap();

        assert_eq!(payload.search_name, "012_VPN_Tunnel_Status");
        assert_eq!(payload.alert_name(), "012 Vpn Tunnel Status");
        assert_eq!(
            payload.configuration.get("webhook_url").map(String::as_str),
            Some("https://hooks.slack.com/services/T/B/x")
        );
    }

    #[test]
    fn inline_result_flattens_to_strings() {
        let value = serde_json::json!({
            "srcip": "203.0.113.7",
            "fail_count": 12,
            "reason": "High-risk IP"
        });
        let row = result_to_row(&value);
        assert_eq!(row["srcip"], "203.0.113.7");
        assert_eq!(row["fail_count"], "12");
        assert!(result_to_row(&serde_json::json!("scalar")).is_empty());
    }

    #[test]
    fn malformed_stdin_is_rejected() {
        let err = AlertPayload::from_reader("{not json".as_bytes()).unwrap_err();
        assert!(matches!(err, BridgeError::PayloadError(_)));
    }

    #[test]
    fn empty_stdin_is_rejected() {
        assert!(AlertPayload::from_reader("".as_bytes()).is_err());
    }
}
