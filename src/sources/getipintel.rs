//! GetIPIntel source.

use super::VpnSource;
use crate::config::{GetIpIntelConfig, PLACEHOLDER_CONTACT};
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::debug;

pub const NAME: &str = "getipintel";

const ENDPOINT: &str = "https://check.getipintel.net/check.php";

/// GetIPIntel API response. `result` arrives as a string.
#[derive(Debug, Deserialize)]
struct GetIpIntelResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// GetIPIntel source.
pub struct GetIpIntelSource {
    config: GetIpIntelConfig,
    client: Client,
}

impl GetIpIntelSource {
    pub fn new(config: GetIpIntelConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// The service bans callers that send a fake contact address.
    fn contact(&self) -> Result<&str, ApiError> {
        let contact = self.config.contact.trim();
        if contact.is_empty() || contact.eq_ignore_ascii_case(PLACEHOLDER_CONTACT) {
            return Err(ApiError::hard(format!(
                "Contact is not defined for {} (WARNING: USING AN INVALID E-MAIL FOR THE CONTACT WILL GET YOUR IP BANNED FROM THE SERVICE)",
                NAME
            )));
        }
        Ok(contact)
    }

    fn score_is_vpn(&self, score: f64) -> bool {
        score >= self.config.threshold
    }
}

/// Parse the `result` field, which the service sends as a string.
fn parse_score(value: Option<&serde_json::Value>) -> Result<f64, ApiError> {
    let score = match value {
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    };

    match score {
        Some(s) if s >= 0.0 => Ok(s),
        Some(s) => Err(ApiError::soft(format!(
            "Could not get result from {} (error code {})",
            NAME, s
        ))),
        None => Err(ApiError::soft(format!(
            "Could not get result from {} (is your IP banned due to an improper contact e-mail?)",
            NAME
        ))),
    }
}

#[async_trait]
impl VpnSource for GetIpIntelSource {
    fn name(&self) -> &str {
        NAME
    }

    fn requires_key(&self) -> bool {
        false
    }

    async fn get_result(&self, ip: &IpAddr) -> Result<bool, ApiError> {
        let contact = self.contact()?;

        debug!(ip = %ip, "Querying GetIPIntel");

        let response = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("ip", ip.to_string().as_str()),
                ("contact", contact),
                ("format", "json"),
                ("flags", "b"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::soft(format!(
                "{} returned HTTP {}",
                NAME,
                response.status()
            )));
        }

        let body: GetIpIntelResponse = response
            .json()
            .await
            .map_err(|e| ApiError::soft(format!("Failed to parse {} response: {}", NAME, e)))?;

        let score = parse_score(body.result.as_ref())?;
        debug!(ip = %ip, score = score, "GetIPIntel lookup complete");

        Ok(self.score_is_vpn(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(contact: &str) -> GetIpIntelSource {
        GetIpIntelSource::new(
            GetIpIntelConfig {
                enabled: true,
                contact: contact.to_string(),
                threshold: 0.99,
            },
            Client::new(),
        )
    }

    #[tokio::test]
    async fn test_placeholder_contact_is_hard_error() {
        let source = source("admin@yoursite.com");
        let err = source
            .get_result(&"1.2.3.4".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_hard());
    }

    #[test]
    fn test_empty_contact_is_hard_error() {
        assert!(source("  ").contact().unwrap_err().is_hard());
        assert_eq!(source("ops@example.net").contact().unwrap(), "ops@example.net");
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score(Some(&json!("0.995"))).unwrap(), 0.995);
        assert_eq!(parse_score(Some(&json!(0.5))).unwrap(), 0.5);
        assert!(!parse_score(Some(&json!("-3"))).unwrap_err().is_hard());
        assert!(!parse_score(None).unwrap_err().is_hard());
        assert!(parse_score(Some(&json!("garbage"))).is_err());
    }

    #[test]
    fn test_threshold() {
        let source = source("ops@example.net");
        assert!(source.score_is_vpn(0.99));
        assert!(source.score_is_vpn(1.0));
        assert!(!source.score_is_vpn(0.98));
    }
}
