//! Policy layer: turns a lookup into a yes/no VPN decision.

use crate::config::{Config, FailAction, IgnoreEntry};
use crate::error::LookupError;
use crate::orchestrator::{Lookup, Orchestrator, OrchestratorOptions};
use crate::replication::{self, SharedBus};
use crate::sources::SourceRegistry;
use crate::store;
use crate::verdict::Verdict;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What produced an [`Assessment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Checking is switched off in `settings.enabled`.
    Disabled,
    /// The IP matched the ignore list.
    Ignored,
    /// A fresh stored verdict was reused.
    Cache,
    /// Sources were queried.
    Sources,
    /// Nothing decided, `settings.fail_action` applied.
    FailAction,
}

/// Final answer for one IP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub ip: IpAddr,
    pub is_vpn: bool,
    pub decision_source: DecisionSource,
    /// The verdict behind the decision, when there was one.
    pub verdict: Option<Verdict>,
    /// Surrogate ID of the player, when one was given.
    pub player_id: Option<i64>,
}

/// VPN guard.
pub struct VpnGuard {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    ignore: Vec<IgnoreEntry>,
    bus: Option<SharedBus>,
    replication: Option<JoinHandle<()>>,
}

impl VpnGuard {
    /// Open the configured store and bus, build the sources and start
    /// replication. Must be called from within a Tokio runtime.
    pub fn new(mut config: Config) -> anyhow::Result<Self> {
        config.ensure_server_id();

        let (store_name, store_config) = config
            .storage
            .primary()
            .ok_or_else(|| anyhow::anyhow!("storage.order names no enabled engine"))?;
        let store = store::open(store_name, store_config)?;

        let sources = SourceRegistry::with_builtin(&config).build(&config);
        if sources.is_empty() {
            warn!("No VPN sources enabled, uncached lookups cannot be decided");
        }

        let mut orchestrator =
            Orchestrator::new(sources, store, OrchestratorOptions::from_config(&config));

        let bus = config
            .messaging
            .primary()
            .map(|(name, engine)| replication::open(name, engine));
        if let Some(bus) = &bus {
            info!(bus = %bus.name(), server_id = %config.node.server_id, "Replication enabled");
            orchestrator = orchestrator.with_bus(bus.clone());
        }

        let orchestrator = Arc::new(orchestrator);
        let replication = orchestrator.start_replication()?;

        let mut guard = Self::with_orchestrator(config, orchestrator);
        guard.bus = bus;
        guard.replication = replication;
        Ok(guard)
    }

    /// Wrap an already built orchestrator.
    pub fn with_orchestrator(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        let ignore = config.parse_ignore();

        info!(
            method = %config.algorithm.method,
            sources = orchestrator.active_sources().len(),
            ignore_entries = ignore.len(),
            "VPN guard initialized"
        );

        Self {
            config: Arc::new(config),
            orchestrator,
            ignore,
            bus: None,
            replication: None,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn is_ignored(&self, ip: &IpAddr) -> bool {
        self.ignore.iter().any(|entry| entry.contains(ip))
    }

    /// Decide whether `ip` is a VPN, optionally recording the player.
    ///
    /// Only an unparsable IP or a failure to intern the player is an error.
    /// A failed lookup resolves through `fail_action` like an undetermined one.
    pub async fn check(&self, ip: &str, player: Option<Uuid>) -> Result<Assessment, LookupError> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| LookupError::InvalidIp(ip.to_string()))?;

        let player_id = match player {
            Some(player) => Some(self.orchestrator.store().player_id(player).await?),
            None => None,
        };

        if !self.config.settings.enabled {
            debug!(ip = %addr, "VPN checks disabled globally");
            return Ok(self.assess(addr, false, DecisionSource::Disabled, None, player_id));
        }

        if self.is_ignored(&addr) {
            debug!(ip = %addr, "IP is on the ignore list");
            return Ok(self.assess(addr, false, DecisionSource::Ignored, None, player_id));
        }

        let method = self.config.algorithm.method;
        let lookup = match self.orchestrator.lookup(&addr.to_string(), method).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(ip = %addr, error = %e, "VPN lookup failed");
                Lookup::Undetermined
            }
        };

        let assessment = match lookup.verdict() {
            Some(verdict) => {
                let source = if lookup.is_cached() {
                    DecisionSource::Cache
                } else {
                    DecisionSource::Sources
                };
                self.assess(addr, self.is_vpn(verdict), source, Some(verdict), player_id)
            }
            None => {
                let is_vpn = self.config.settings.fail_action == FailAction::Block;
                debug!(ip = %addr, fail_action = ?self.config.settings.fail_action, "Lookup undetermined");
                self.assess(addr, is_vpn, DecisionSource::FailAction, None, player_id)
            }
        };

        if assessment.is_vpn && self.config.settings.log_blocked {
            info!(
                ip = %addr,
                verdict = ?assessment.verdict,
                source = ?assessment.decision_source,
                "VPN detected"
            );
        } else if !assessment.is_vpn && self.config.settings.log_allowed {
            info!(ip = %addr, source = ?assessment.decision_source, "IP passed VPN check");
        }

        Ok(assessment)
    }

    fn is_vpn(&self, verdict: Verdict) -> bool {
        match verdict {
            Verdict::Cascade(vpn) => vpn,
            Verdict::Consensus(ratio) => ratio >= self.config.algorithm.min_consensus,
        }
    }

    fn assess(
        &self,
        ip: IpAddr,
        is_vpn: bool,
        decision_source: DecisionSource,
        verdict: Option<Verdict>,
        player_id: Option<i64>,
    ) -> Assessment {
        Assessment {
            ip,
            is_vpn,
            decision_source,
            verdict,
            player_id,
        }
    }

    /// Close the bus and the store, then wait for the replication listener.
    pub async fn shutdown(self) {
        if let Some(bus) = &self.bus {
            bus.close().await;
        }
        if let Some(handle) = self.replication {
            if let Err(e) = handle.await {
                warn!(error = %e, "Replication listener ended abnormally");
            }
        }
        self.orchestrator.store().close().await;
        info!("VPN guard stopped");
    }
}
