//! VPN sources and the name-to-factory registry that builds them.

pub mod blocklist;
pub mod getipintel;
pub mod iphub;
pub mod proxycheck;

use crate::config::Config;
use crate::error::ApiError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// User agent sent by HTTP sources.
pub const USER_AGENT: &str = concat!("vpn-verdict/", env!("CARGO_PKG_VERSION"));

/// A single third-party VPN check.
#[async_trait]
pub trait VpnSource: Send + Sync {
    /// Source name for configuration, logging and hard-failure tracking.
    fn name(&self) -> &str;

    /// Whether the source cannot work without an API key.
    fn requires_key(&self) -> bool;

    /// Returns true if the source considers the IP a VPN or proxy.
    async fn get_result(&self, ip: &IpAddr) -> Result<bool, ApiError>;
}

/// Shared handle to a source.
pub type SharedSource = Arc<dyn VpnSource>;

/// Builds a source from configuration. Returns `None` when the source has no
/// configuration section or is disabled.
pub type SourceFactory =
    Box<dyn Fn(&Config, &reqwest::Client) -> Option<Result<SharedSource, ApiError>> + Send + Sync>;

/// Mapping from source name to factory.
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in HTTP sources and every configured
    /// blocklist.
    pub fn with_builtin(config: &Config) -> Self {
        let mut registry = Self::new();

        registry.register(
            getipintel::NAME,
            Box::new(|config: &Config, client: &reqwest::Client| {
                let c = config.sources.getipintel.as_ref().filter(|c| c.enabled)?;
                Some(Ok(Arc::new(getipintel::GetIpIntelSource::new(
                    c.clone(),
                    client.clone(),
                )) as SharedSource))
            }),
        );

        registry.register(
            iphub::NAME,
            Box::new(|config: &Config, client: &reqwest::Client| {
                let c = config.sources.iphub.as_ref().filter(|c| c.enabled)?;
                Some(Ok(
                    Arc::new(iphub::IpHubSource::new(c.clone(), client.clone())) as SharedSource
                ))
            }),
        );

        registry.register(
            proxycheck::NAME,
            Box::new(|config: &Config, client: &reqwest::Client| {
                let c = config.sources.proxycheck.as_ref().filter(|c| c.enabled)?;
                Some(Ok(Arc::new(proxycheck::ProxyCheckSource::new(
                    c.clone(),
                    client.clone(),
                )) as SharedSource))
            }),
        );

        for blocklist_config in &config.sources.blocklists {
            let name = blocklist_config.name.clone();
            registry.register(
                &blocklist_config.name,
                Box::new(move |config: &Config, _: &reqwest::Client| {
                    let c = config
                        .sources
                        .blocklists
                        .iter()
                        .find(|b| b.name == name && b.enabled)?;
                    Some(
                        blocklist::BlocklistSource::new(c.clone())
                            .map(|s| Arc::new(s) as SharedSource),
                    )
                }),
            );
        }

        registry
    }

    /// Register or replace a factory.
    pub fn register(&mut self, name: &str, factory: SourceFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Names with a registered factory.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the active sources in `sources.order`, skipping unknown,
    /// disabled and misconfigured ones.
    pub fn build(&self, config: &Config) -> Vec<SharedSource> {
        let client = http_client(config.connection.timeout());
        let mut sources: Vec<SharedSource> = Vec::new();

        for name in &config.sources.order {
            if sources.iter().any(|s| s.name() == name) {
                warn!(source = %name, "Source listed twice in order, ignoring duplicate");
                continue;
            }

            let Some(factory) = self.factories.get(name) else {
                warn!(source = %name, "Removed undefined source");
                continue;
            };

            match factory(config, &client) {
                None => debug!(source = %name, "Source is disabled"),
                Some(Err(e)) => warn!(source = %name, error = %e, "Failed to create source"),
                Some(Ok(source)) => {
                    if source.requires_key() && !has_key(config, name) {
                        warn!(source = %name, "Source requires a key which was not provided, removing");
                        continue;
                    }
                    info!(source = %name, "Source enabled");
                    sources.push(source);
                }
            }
        }

        sources
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn has_key(config: &Config, name: &str) -> bool {
    match name {
        iphub::NAME => config
            .sources
            .iphub
            .as_ref()
            .is_some_and(|c| !c.key.trim().is_empty()),
        proxycheck::NAME => config
            .sources
            .proxycheck
            .as_ref()
            .is_some_and(|c| !c.key.trim().is_empty()),
        _ => false,
    }
}

/// HTTP client shared by every source, bounded by the per-call timeout.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build configured HTTP client, using defaults");
            reqwest::Client::new()
        })
}
