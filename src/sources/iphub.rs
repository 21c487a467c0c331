//! IPHub source.

use super::VpnSource;
use crate::config::IpHubConfig;
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, warn};

pub const NAME: &str = "iphub";

const ENDPOINT: &str = "https://v2.api.iphub.info/ip";

/// IPHub API response.
#[derive(Debug, Deserialize)]
struct IpHubResponse {
    /// 0 = residential, 1 = non-residential (hosting/VPN), 2 = mixed.
    block: u8,
}

/// IPHub source.
pub struct IpHubSource {
    config: IpHubConfig,
    client: Client,
}

impl IpHubSource {
    pub fn new(config: IpHubConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn block_is_vpn(&self, block: u8) -> bool {
        block == self.config.block_type
    }
}

#[async_trait]
impl VpnSource for IpHubSource {
    fn name(&self) -> &str {
        NAME
    }

    fn requires_key(&self) -> bool {
        true
    }

    async fn get_result(&self, ip: &IpAddr) -> Result<bool, ApiError> {
        let key = self.config.key.trim();
        if key.is_empty() {
            return Err(ApiError::hard(format!("Key is not defined for {}", NAME)));
        }

        debug!(ip = %ip, "Querying IPHub");

        let response = self
            .client
            .get(format!("{}/{}", ENDPOINT, ip))
            .header("X-Key", key)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ApiError::hard(format!(
                    "{} rejected the configured key (HTTP {})",
                    NAME,
                    response.status()
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("IPHub rate limit exceeded");
                return Err(ApiError::soft(format!("{} rate limited", NAME)));
            }
            status if !status.is_success() => {
                return Err(ApiError::soft(format!("{} returned HTTP {}", NAME, status)));
            }
            _ => {}
        }

        let body: IpHubResponse = response
            .json()
            .await
            .map_err(|e| ApiError::soft(format!("Failed to parse {} response: {}", NAME, e)))?;

        debug!(ip = %ip, block = body.block, "IPHub lookup complete");

        Ok(self.block_is_vpn(body.block))
    }
}
