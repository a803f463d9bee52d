//! Mock Slack and FortiGate API servers for testing
//!
//! Configurable httpmock servers simulating the two outbound integrations.
//! Scenario constructors cover the success, API-error, and HTTP-error paths;
//! tests that need per-call assertions register their own mocks on a bare
//! `MockServer` instead.

use httpmock::prelude::*;
use serde_json::json;

pub struct MockSlackServer {
    server: MockServer,
}

impl MockSlackServer {
    /// Bot-token API accepting everything: `chat.postMessage` returns a ts,
    /// `chat.update` acknowledges.
    pub fn new() -> Self {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "ok": true, "ts": "1700000000.123456" }));
        });

        server.mock(|when, then| {
            when.method(POST).path("/chat.update");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "ok": true }));
        });

        Self { server }
    }

    /// API responds but refuses the message (`{"ok": false}`).
    pub fn with_api_error() -> Self {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "ok": false, "error": "invalid_auth" }));
        });

        Self { server }
    }

    /// Transport-level failure (HTTP 500).
    pub fn with_http_error() -> Self {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(500);
        });

        Self { server }
    }

    /// Incoming-webhook endpoint answering the literal `ok` body.
    pub fn with_webhook() -> Self {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(POST).path("/webhook");
            then.status(200).body("ok");
        });

        Self { server }
    }

    pub fn url(&self) -> String {
        self.server.url("")
    }

    pub fn webhook_url(&self) -> String {
        self.server.url("/webhook")
    }
}

impl Default for MockSlackServer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockFortiGateServer {
    server: MockServer,
}

impl MockFortiGateServer {
    /// Appliance accepting every configuration change.
    pub fn new() -> Self {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(POST).path("/cmdb/firewall/address");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "status": "success" }));
        });

        server.mock(|when, then| {
            when.method(POST).path("/cmdb/firewall/policy");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "status": "success", "mkey": 42 }));
        });

        server.mock(|when, then| {
            when.method(DELETE)
                .path_matches(Regex::new(r"/cmdb/firewall/(address|policy)/.+").unwrap());
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "status": "success" }));
        });

        Self { server }
    }

    /// Address objects succeed but policy creation fails, which must trigger
    /// the address-object rollback.
    pub fn with_policy_failure() -> Self {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(POST).path("/cmdb/firewall/address");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "status": "success" }));
        });

        server.mock(|when, then| {
            when.method(POST).path("/cmdb/firewall/policy");
            then.status(500)
                .header("content-type", "application/json")
                .json_body(json!({ "error": "policy table full" }));
        });

        server.mock(|when, then| {
            when.method(DELETE)
                .path_matches(Regex::new(r"/cmdb/firewall/address/.+").unwrap());
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "status": "success" }));
        });

        Self { server }
    }

    pub fn url(&self) -> String {
        self.server.url("")
    }
}

impl Default for MockFortiGateServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slack_mock_returns_ts() {
        let mock = MockSlackServer::new();
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/chat.postMessage", mock.url()))
            .json(&json!({ "channel": "#alerts", "blocks": [] }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["ok"], true);
        assert!(body["ts"].is_string());
    }

    #[tokio::test]
    async fn fortigate_mock_accepts_address_objects() {
        let mock = MockFortiGateServer::new();
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/cmdb/firewall/address", mock.url()))
            .json(&json!({ "name": "blocked_203_0_113_7" }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
    }
}
