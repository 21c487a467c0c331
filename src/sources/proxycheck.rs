//! proxycheck.io source.

use super::VpnSource;
use crate::config::ProxyCheckConfig;
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;
use tracing::debug;

pub const NAME: &str = "proxycheck";

const ENDPOINT: &str = "https://proxycheck.io/v2";

/// proxycheck.io source. Works without a key at a lower rate limit.
pub struct ProxyCheckSource {
    config: ProxyCheckConfig,
    client: Client,
}

impl ProxyCheckSource {
    pub fn new(config: ProxyCheckConfig, client: Client) -> Self {
        Self { config, client }
    }
}

/// Extract the answer for `ip` from a proxycheck.io body.
///
/// The body is keyed by the queried IP:
/// `{"status": "ok", "1.2.3.4": {"proxy": "yes"}}`.
fn parse_body(body: &serde_json::Value, ip: &str) -> Result<bool, ApiError> {
    let status = body
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or_default();

    if status.eq_ignore_ascii_case("denied") {
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("access denied");
        // Quota exhaustion is also "denied" and clears on its own
        let lower = message.to_ascii_lowercase();
        if lower.contains("invalid") && lower.contains("key") {
            return Err(ApiError::hard(format!("{}: {}", NAME, message)));
        }
        return Err(ApiError::soft(format!("{}: {}", NAME, message)));
    }

    // "warning" still carries a result
    if !status.eq_ignore_ascii_case("ok") && !status.eq_ignore_ascii_case("warning") {
        return Err(ApiError::soft(format!(
            "Could not get result from {} (status {:?})",
            NAME, status
        )));
    }

    body.get(ip)
        .and_then(|r| r.get("proxy"))
        .and_then(|p| p.as_str())
        .map(|p| p.eq_ignore_ascii_case("yes"))
        .ok_or_else(|| ApiError::soft(format!("{} response has no result for {}", NAME, ip)))
}

#[async_trait]
impl VpnSource for ProxyCheckSource {
    fn name(&self) -> &str {
        NAME
    }

    fn requires_key(&self) -> bool {
        false
    }

    async fn get_result(&self, ip: &IpAddr) -> Result<bool, ApiError> {
        debug!(ip = %ip, "Querying proxycheck.io");

        let mut request = self
            .client
            .get(format!("{}/{}", ENDPOINT, ip))
            .query(&[("vpn", "1")]);

        let key = self.config.key.trim();
        if !key.is_empty() {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ApiError::soft(format!(
                "{} returned HTTP {}",
                NAME,
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::soft(format!("Failed to parse {} response: {}", NAME, e)))?;

        let is_vpn = parse_body(&body, &ip.to_string())?;
        debug!(ip = %ip, is_vpn = is_vpn, "proxycheck.io lookup complete");

        Ok(is_vpn)
    }
}
