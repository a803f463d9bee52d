//! FortiGate REST v2 client.
//!
//! Covers the configuration objects the response actions touch: firewall
//! address objects, deny policies, traffic-shaping policies, and admin
//! accounts. Appliances in the field run self-signed certificates, so TLS
//! verification is configurable and off by default.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::FortiGateConfig;
use crate::error::BridgeError;

/// Names created for a successful block, recorded for the unblock sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutcome {
    pub address_name: String,
    pub policy_id: String,
}

pub struct FortiGateClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    vdom: String,
}

impl FortiGateClient {
    pub fn new(config: &FortiGateConfig) -> Self {
        let http_client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url: format!("https://{}:{}/api/v2", config.host, config.port),
            api_key: config.api_key.clone(),
            vdom: config.vdom.clone(),
        }
    }

    /// Replace the API base. Used by tests to target a local mock server.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into();
        self
    }

    pub fn address_name(ip: &str) -> String {
        format!("blocked_{}", ip.replace(['.', ':'], "_"))
    }

    pub fn policy_name(ip: &str) -> String {
        format!("DENY_blocked_{}", ip.replace(['.', ':'], "_"))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut request_builder = self
            .http_client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .query(&[("vdom", self.vdom.as_str())]);

        if let Some(json_body) = &body {
            request_builder = request_builder.json(json_body);
        }

        let response = request_builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BridgeError::FortiGateApiError(format!(
                "{} failed with status {}: {}",
                endpoint, status, error_text
            )));
        }

        Ok(response.json().await.unwrap_or(Value::Null))
    }

    /// Create the `ipmask` address object for a blocked IP. Returns its name.
    pub async fn create_address_object(&self, ip: &str, reason: &str) -> Result<String, BridgeError> {
        let address_name = Self::address_name(ip);
        let payload = json!({
            "name": address_name,
            "type": "ipmask",
            "subnet": format!("{} 255.255.255.255", ip),
            "comment": format!(
                "Auto-blocked on {}: {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S"),
                reason
            ),
        });

        self.request(reqwest::Method::POST, "cmdb/firewall/address", Some(payload))
            .await?;
        info!(ip = %ip, address = %address_name, "Created address object");
        Ok(address_name)
    }

    /// Create the deny-all policy referencing an address object. Returns the
    /// policy identifier (the appliance `mkey` when reported, else the name).
    pub async fn create_deny_policy(
        &self,
        address_name: &str,
        ip: &str,
    ) -> Result<String, BridgeError> {
        let policy_name = Self::policy_name(ip);
        let payload = json!({
            "name": policy_name,
            "srcintf": [{ "name": "any" }],
            "dstintf": [{ "name": "any" }],
            "srcaddr": [{ "name": address_name }],
            "dstaddr": [{ "name": "all" }],
            "action": "deny",
            "schedule": "always",
            "service": [{ "name": "ALL" }],
            "logtraffic": "all",
            "comments": format!("Auto-created {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
        });

        let response = self
            .request(reqwest::Method::POST, "cmdb/firewall/policy", Some(payload))
            .await?;
        let policy_id = response
            .get("mkey")
            .map(|mkey| match mkey {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or(policy_name);
        info!(ip = %ip, policy = %policy_id, "Created deny policy");
        Ok(policy_id)
    }

    pub async fn delete_address_object(&self, address_name: &str) -> Result<(), BridgeError> {
        self.request(
            reqwest::Method::DELETE,
            &format!("cmdb/firewall/address/{}", address_name),
            None,
        )
        .await?;
        info!(address = %address_name, "Deleted address object");
        Ok(())
    }

    pub async fn delete_policy(&self, policy_id: &str) -> Result<(), BridgeError> {
        self.request(
            reqwest::Method::DELETE,
            &format!("cmdb/firewall/policy/{}", policy_id),
            None,
        )
        .await?;
        info!(policy = %policy_id, "Deleted deny policy");
        Ok(())
    }

    /// Full block workflow: address object first, then the policy. If the
    /// policy fails the half-created address object is deleted again so a
    /// retry starts clean.
    pub async fn block_ip(&self, ip: &str, reason: &str) -> Result<BlockOutcome, BridgeError> {
        let address_name = self.create_address_object(ip, reason).await?;

        match self.create_deny_policy(&address_name, ip).await {
            Ok(policy_id) => Ok(BlockOutcome {
                address_name,
                policy_id,
            }),
            Err(policy_err) => {
                warn!(ip = %ip, "Policy creation failed, rolling back address object");
                if let Err(rollback_err) = self.delete_address_object(&address_name).await {
                    error!(
                        address = %address_name,
                        "Rollback failed, orphaned address object remains: {}",
                        rollback_err
                    );
                }
                Err(policy_err)
            }
        }
    }

    /// Reverse a block: policy first (it references the address), then the
    /// address object.
    pub async fn unblock_ip(&self, ip: &str, policy_id: &str) -> Result<(), BridgeError> {
        self.delete_policy(policy_id).await?;
        self.delete_address_object(&Self::address_name(ip)).await
    }

    /// Apply a traffic-shaping policy limiting a source to `limit_mbps`.
    pub async fn apply_bandwidth_limit(
        &self,
        source_ip: &str,
        limit_mbps: u32,
    ) -> Result<(), BridgeError> {
        let payload = json!({
            "srcaddr": source_ip,
            "traffic-shaper": format!("limit_{}mbps", limit_mbps),
            "comment": format!("Auto-applied bandwidth limit: {} Mbps", limit_mbps),
        });
        self.request(
            reqwest::Method::POST,
            "cmdb/firewall/shaping-policy",
            Some(payload),
        )
        .await?;
        info!(ip = %source_ip, limit_mbps, "Applied bandwidth limit");
        Ok(())
    }

    /// Strip an admin account down to a no-access profile.
    pub async fn disable_admin_account(&self, username: &str) -> Result<(), BridgeError> {
        let payload = json!({
            "accprofile-override": "enable",
            "accprofile": "no-access",
        });
        self.request(
            reqwest::Method::PUT,
            &format!("cmdb/system/admin/{}", username),
            Some(payload),
        )
        .await?;
        warn!(user = %username, "Disabled admin account");
        Ok(())
    }
}
