//! Configuration types for the VPN verdict engine.

use crate::verdict::VerdictKind;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Identity of this node in a cluster.
    #[serde(default)]
    pub node: NodeConfig,

    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Aggregation policy.
    #[serde(default)]
    pub algorithm: AlgorithmConfig,

    /// Worker pool and timeouts.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// VPN sources and their order.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Verdict store backends.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Replication bus backends.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// IPs and CIDR ranges that are never checked.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            settings: Settings::default(),
            algorithm: AlgorithmConfig::default(),
            connection: ConnectionConfig::default(),
            sources: SourcesConfig::default(),
            storage: StorageConfig::default(),
            messaging: MessagingConfig::default(),
            ignore: Vec::new(),
        }
    }
}

/// Node identity.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Unique ID used as the replication origin. Generated when empty.
    #[serde(default)]
    pub server_id: String,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// What an undetermined lookup resolves to.
    #[serde(default)]
    pub fail_action: FailAction,

    /// Log IPs found to be VPNs.
    #[serde(default = "default_true")]
    pub log_blocked: bool,

    /// Log IPs that passed.
    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_action: FailAction::default(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

/// Outcome applied when no source could decide and nothing is cached.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Treat as not a VPN (fail-open).
    #[default]
    Allow,
    /// Treat as a VPN (fail-closed).
    Block,
}

/// Aggregation policy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlgorithmConfig {
    /// Cascade or consensus.
    #[serde(default)]
    pub method: VerdictKind,

    /// Minimum consensus ratio that counts as a VPN.
    #[serde(default = "default_min_consensus")]
    pub min_consensus: f64,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            method: VerdictKind::default(),
            min_consensus: default_min_consensus(),
        }
    }
}

fn default_min_consensus() -> f64 {
    0.6
}

/// Worker pool, timeouts and the memory cache tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent source calls.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Timeout for a single source call in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Timeout for a whole cascade or consensus run in milliseconds.
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,

    /// How long verdicts stay in the in-process cache.
    #[serde(default = "default_memory_cache")]
    pub memory_cache_seconds: u64,

    /// Upper bound on in-process cache entries.
    #[serde(default = "default_memory_cache_entries")]
    pub memory_cache_entries: usize,
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            timeout_ms: default_timeout(),
            lookup_timeout_ms: default_lookup_timeout(),
            memory_cache_seconds: default_memory_cache(),
            memory_cache_entries: default_memory_cache_entries(),
        }
    }
}

fn default_threads() -> usize {
    4
}

fn default_timeout() -> u64 {
    5000
}

fn default_lookup_timeout() -> u64 {
    15000
}

fn default_memory_cache() -> u64 {
    60
}

fn default_memory_cache_entries() -> usize {
    10000
}

/// VPN source settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    /// Source names in query order.
    #[serde(default)]
    pub order: Vec<String>,

    /// How long a stored verdict stays fresh, in seconds.
    #[serde(default = "default_cache_time")]
    pub cache_time_seconds: u64,

    #[serde(default)]
    pub getipintel: Option<GetIpIntelConfig>,

    #[serde(default)]
    pub iphub: Option<IpHubConfig>,

    #[serde(default)]
    pub proxycheck: Option<ProxyCheckConfig>,

    /// File-based blocklists, each registered under its own name.
    #[serde(default)]
    pub blocklists: Vec<BlocklistConfig>,
}

impl SourcesConfig {
    /// Freshness window for stored verdicts in milliseconds.
    pub fn cache_time_millis(&self) -> i64 {
        i64::try_from(self.cache_time_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            cache_time_seconds: default_cache_time(),
            getipintel: None,
            iphub: None,
            proxycheck: None,
            blocklists: Vec::new(),
        }
    }
}

fn default_cache_time() -> u64 {
    6 * 60 * 60
}

/// GetIPIntel source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GetIpIntelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Contact e-mail required by the service.
    #[serde(default = "default_contact")]
    pub contact: String,

    /// Score at or above which an IP counts as a VPN.
    #[serde(default = "default_getipintel_threshold")]
    pub threshold: f64,
}

/// Placeholder contact shipped in the example config.
pub const PLACEHOLDER_CONTACT: &str = "admin@yoursite.com";

fn default_contact() -> String {
    PLACEHOLDER_CONTACT.to_string()
}

fn default_getipintel_threshold() -> f64 {
    0.99
}

/// IPHub source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpHubConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key (supports ${ENV_VAR} syntax).
    #[serde(default)]
    pub key: String,

    /// `block` value that counts as a VPN.
    #[serde(default = "default_block_type")]
    pub block_type: u8,
}

fn default_block_type() -> u8 {
    1
}

/// proxycheck.io source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Optional API key.
    #[serde(default)]
    pub key: String,
}

/// File-based blocklist source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlocklistConfig {
    /// Source name used in `sources.order`.
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to blocklist file.
    pub path: PathBuf,

    /// File format.
    #[serde(default)]
    pub format: BlocklistFormat,

    /// How often to re-read the file (seconds).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
}

fn default_refresh_interval() -> u64 {
    300
}

/// Blocklist file format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistFormat {
    /// Plain text, one IP/CIDR per line.
    #[default]
    Plain,
    /// CSV with IP in the first column.
    Csv,
    /// JSON array of IPs.
    Json,
}

/// Verdict store engines.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Engine names in preference order. The first enabled one is used.
    #[serde(default = "default_storage_order")]
    pub order: Vec<String>,

    #[serde(default = "default_storage_engines")]
    pub engines: BTreeMap<String, StorageEngineConfig>,
}

impl StorageConfig {
    /// First enabled engine in `order`.
    pub fn primary(&self) -> Option<(&str, &StorageEngineConfig)> {
        self.order.iter().find_map(|name| {
            self.engines
                .get(name)
                .filter(|e| e.enabled)
                .map(|e| (name.as_str(), e))
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            order: default_storage_order(),
            engines: default_storage_engines(),
        }
    }
}

fn default_storage_order() -> Vec<String> {
    vec!["memory".to_string()]
}

fn default_storage_engines() -> BTreeMap<String, StorageEngineConfig> {
    let mut engines = BTreeMap::new();
    engines.insert(
        "memory".to_string(),
        StorageEngineConfig {
            enabled: true,
            engine: StorageEngine::Memory,
        },
    );
    engines
}

/// One configured storage engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageEngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub engine: StorageEngine,
}

/// Storage backend kind.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageEngine {
    /// Process-local, lost on restart.
    Memory,
    /// SQLite database file.
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

fn default_prefix() -> String {
    "avpn_".to_string()
}

/// Replication bus engines.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MessagingConfig {
    /// Engine names in preference order. Empty means single-node.
    #[serde(default)]
    pub order: Vec<String>,

    #[serde(default)]
    pub engines: BTreeMap<String, MessagingEngineConfig>,
}

impl MessagingConfig {
    /// First enabled engine in `order`.
    pub fn primary(&self) -> Option<(&str, &MessagingEngineConfig)> {
        self.order.iter().find_map(|name| {
            self.engines
                .get(name)
                .filter(|e| e.enabled)
                .map(|e| (name.as_str(), e))
        })
    }
}

/// One configured messaging engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagingEngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub engine: MessagingEngine,
}

/// Messaging backend kind.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagingEngine {
    /// In-process broadcast channel.
    Memory {
        #[serde(default = "default_bus_capacity")]
        capacity: usize,
    },
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        config.ensure_server_id();
        Ok(config)
    }

    /// Assign a random server ID if none is configured.
    pub fn ensure_server_id(&mut self) {
        if self.node.server_id.trim().is_empty() {
            self.node.server_id = uuid::Uuid::new_v4().to_string();
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.algorithm.min_consensus) {
            anyhow::bail!(
                "min_consensus ({}) must be between 0 and 1",
                self.algorithm.min_consensus
            );
        }

        if self.connection.threads == 0 {
            anyhow::bail!("connection.threads must be at least 1");
        }

        if self.connection.timeout_ms == 0 {
            anyhow::bail!("connection.timeout_ms must be greater than 0");
        }

        for blocklist in &self.sources.blocklists {
            if blocklist.enabled && !blocklist.path.exists() {
                anyhow::bail!(
                    "Blocklist '{}' path does not exist: {}",
                    blocklist.name,
                    blocklist.path.display()
                );
            }
        }

        for name in &self.storage.order {
            if !self.storage.engines.contains_key(name) {
                anyhow::bail!("storage.order references undefined engine '{}'", name);
            }
        }

        for name in &self.messaging.order {
            if !self.messaging.engines.contains_key(name) {
                anyhow::bail!("messaging.order references undefined engine '{}'", name);
            }
        }

        for entry in &self.ignore {
            if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNet>().is_err() {
                anyhow::bail!("Invalid ignore entry: {}", entry);
            }
        }

        Ok(())
    }

    /// Parse ignore entries into IpAddr or IpNet.
    pub fn parse_ignore(&self) -> Vec<IgnoreEntry> {
        self.ignore
            .iter()
            .filter_map(|s| {
                if let Ok(ip) = s.parse::<IpAddr>() {
                    Some(IgnoreEntry::Single(ip))
                } else if let Ok(net) = s.parse::<IpNet>() {
                    Some(IgnoreEntry::Network(net))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# VPN Verdict Configuration

node:
  server_id: ""                # Random UUID when empty; must be unique per node

settings:
  enabled: true
  fail_action: allow           # allow or block when no source could decide
  log_blocked: true
  log_allowed: false

algorithm:
  method: cascade              # cascade or consensus
  min_consensus: 0.6           # Consensus ratio that counts as a VPN

connection:
  threads: 4                   # Max concurrent source calls
  timeout_ms: 5000             # Per source call
  lookup_timeout_ms: 15000     # Whole cascade/consensus run
  memory_cache_seconds: 60
  memory_cache_entries: 10000

sources:
  order:
    - getipintel
    - iphub
    - proxycheck
    - internal-blocklist
  cache_time_seconds: 21600    # Stored verdicts stay fresh for 6 hours

  getipintel:
    enabled: true
    contact: "admin@yoursite.com"  # MUST be a real address or the service bans you
    threshold: 0.99

  iphub:
    enabled: true
    key: "${IPHUB_KEY}"
    block_type: 1

  proxycheck:
    enabled: true
    key: ""                    # Optional

  blocklists:
    - name: "internal-blocklist"
      enabled: false
      path: "/etc/vpn-verdict/blocklist.txt"
      format: plain            # plain, csv, or json
      refresh_interval_seconds: 300

storage:
  order:
    - local
  engines:
    local:
      type: sqlite
      enabled: true
      path: "vpn-verdict.db"
      prefix: "avpn_"
    scratch:
      type: memory
      enabled: true

messaging:
  order: []                    # Empty for a single node
  engines:
    local-bus:
      type: memory
      enabled: true
      capacity: 1024

# Never checked. Supports single IPs and CIDR notation
ignore:
  - "127.0.0.1"
  - "10.0.0.0/8"
  - "192.168.0.0/16"
  - "172.16.0.0/12"
"#
        .to_string()
    }
}

/// Parsed ignore entry.
#[derive(Debug, Clone)]
pub enum IgnoreEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl IgnoreEntry {
    /// Check if an IP address matches this entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            IgnoreEntry::Single(ignored) => ignored == ip,
            IgnoreEntry::Network(net) => net.contains(ip),
        }
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return content.to_string();
    };

    re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.enabled);
        assert_eq!(settings.fail_action, FailAction::Allow);
        assert!(settings.log_blocked);
        assert!(!settings.log_allowed);
    }

    #[test]
    fn test_default_connection() {
        let connection = ConnectionConfig::default();
        assert_eq!(connection.threads, 4);
        assert_eq!(connection.timeout(), Duration::from_millis(5000));
        assert_eq!(connection.memory_cache_seconds, 60);
    }

    #[test]
    fn test_default_algorithm() {
        let algorithm = AlgorithmConfig::default();
        assert_eq!(algorithm.method, VerdictKind::Cascade);
        assert!((algorithm.min_consensus - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_time_millis() {
        let sources = SourcesConfig::default();
        assert_eq!(sources.cache_time_millis(), 21_600_000);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("VPN_VERDICT_TEST_KEY", "secret123");
        let input = "key: \"${VPN_VERDICT_TEST_KEY}\"";
        let result = expand_env_vars(input);
        assert_eq!(result, "key: \"secret123\"");
        std::env::remove_var("VPN_VERDICT_TEST_KEY");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let input = "key: \"${VPN_VERDICT_NONEXISTENT_VAR}\"";
        assert_eq!(expand_env_vars(input), "key: \"\"");
    }

    #[test]
    fn test_ignore_entry_network() {
        let entry = IgnoreEntry::Network("10.0.0.0/8".parse().unwrap());
        assert!(entry.contains(&"10.0.0.1".parse().unwrap()));
        assert!(!entry.contains(&"11.0.0.1".parse().unwrap()));

        let entry = IgnoreEntry::Single("192.168.1.1".parse().unwrap());
        assert!(entry.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!entry.contains(&"192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
node:
  server_id: "proxy-1"

settings:
  fail_action: block

algorithm:
  method: consensus
  min_consensus: 0.75

sources:
  order: [iphub, proxycheck]
  iphub:
    key: "abc"
  proxycheck: {}

storage:
  order: [db]
  engines:
    db:
      type: sqlite
      path: "/tmp/avpn.db"

ignore:
  - "127.0.0.1"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.node.server_id, "proxy-1");
        assert_eq!(config.settings.fail_action, FailAction::Block);
        assert_eq!(config.algorithm.method, VerdictKind::Consensus);
        assert_eq!(config.sources.order, vec!["iphub", "proxycheck"]);
        assert_eq!(config.sources.iphub.as_ref().unwrap().block_type, 1);
        assert!(config.sources.proxycheck.as_ref().unwrap().enabled);

        let (name, engine) = config.storage.primary().unwrap();
        assert_eq!(name, "db");
        assert_eq!(
            engine.engine,
            StorageEngine::Sqlite {
                path: PathBuf::from("/tmp/avpn.db"),
                prefix: "avpn_".to_string(),
            }
        );
        assert!(config.messaging.primary().is_none());
    }

    #[test]
    fn test_example_config_parses() {
        let mut config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        config.ensure_server_id();
        assert!(!config.node.server_id.is_empty());
        assert_eq!(config.sources.order.len(), 4);
        assert_eq!(config.parse_ignore().len(), 4);
        assert_eq!(config.storage.primary().unwrap().0, "local");
    }

    #[test]
    fn test_validate_min_consensus() {
        let mut config = Config::default();
        config.algorithm.min_consensus = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_threads() {
        let mut config = Config::default();
        config.connection.threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ignore_invalid() {
        let mut config = Config::default();
        config.ignore = vec!["not-an-ip".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_undefined_engine() {
        let mut config = Config::default();
        config.storage.order = vec!["missing".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_engine_is_skipped() {
        let mut config = Config::default();
        config.storage.engines.insert(
            "disk".to_string(),
            StorageEngineConfig {
                enabled: false,
                engine: StorageEngine::Sqlite {
                    path: PathBuf::from("x.db"),
                    prefix: default_prefix(),
                },
            },
        );
        config.storage.order = vec!["disk".to_string(), "memory".to_string()];
        assert_eq!(config.storage.primary().unwrap().0, "memory");
    }
}
