//! File-based VPN range list.
//!
//! Lists of hosting/VPN provider ranges are a cheap first source to put
//! ahead of rate-limited HTTP sources in a cascade.

use super::VpnSource;
use crate::config::{BlocklistConfig, BlocklistFormat};
use crate::error::ApiError;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Parsed list contents: exact addresses plus ranges.
#[derive(Debug, Default)]
struct RangeSet {
    addrs: HashSet<IpAddr>,
    nets: Vec<IpNet>,
}

impl RangeSet {
    fn insert(&mut self, s: &str) {
        if let Ok(ip) = s.parse::<IpAddr>() {
            self.addrs.insert(ip);
        } else if let Ok(net) = s.parse::<IpNet>() {
            self.nets.push(net);
        }
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        self.addrs.contains(ip) || self.nets.iter().any(|n| n.contains(ip))
    }

    fn len(&self) -> usize {
        self.addrs.len() + self.nets.len()
    }
}

/// File-based VPN range list source.
pub struct BlocklistSource {
    config: BlocklistConfig,
    entries: RwLock<RangeSet>,
    last_refresh: RwLock<Option<Instant>>,
}

impl BlocklistSource {
    /// Create the source and load the file once.
    pub fn new(config: BlocklistConfig) -> Result<Self, ApiError> {
        let content = std::fs::read_to_string(&config.path).map_err(|e| {
            ApiError::hard(format!(
                "Blocklist '{}' could not be read from {}: {}",
                config.name,
                config.path.display(),
                e
            ))
        })?;
        let entries = parse_list(&content, config.format)?;

        info!(blocklist = %config.name, entries = entries.len(), "Blocklist loaded");

        Ok(Self {
            config,
            entries: RwLock::new(entries),
            last_refresh: RwLock::new(Some(Instant::now())),
        })
    }

    fn needs_refresh(&self) -> bool {
        let last = self.last_refresh.read().ok().and_then(|l| *l);
        match last {
            Some(instant) => {
                instant.elapsed() > Duration::from_secs(self.config.refresh_interval_seconds)
            }
            None => true,
        }
    }

    /// Re-read the file from disk.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let content = tokio::fs::read_to_string(&self.config.path).await?;
        let entries = parse_list(&content, self.config.format)?;
        let count = entries.len();

        if let Ok(mut e) = self.entries.write() {
            *e = entries;
        }
        if let Ok(mut last) = self.last_refresh.write() {
            *last = Some(Instant::now());
        }

        debug!(blocklist = %self.config.name, entries = count, "Blocklist refreshed");
        Ok(())
    }

    fn is_listed(&self, ip: &IpAddr) -> Result<bool, ApiError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ApiError::soft(format!("Blocklist '{}' lock poisoned", self.config.name)))?;
        Ok(entries.contains(ip))
    }

    fn is_empty(&self) -> bool {
        self.entries.read().map(|e| e.len() == 0).unwrap_or(true)
    }
}

#[async_trait]
impl VpnSource for BlocklistSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn requires_key(&self) -> bool {
        false
    }

    async fn get_result(&self, ip: &IpAddr) -> Result<bool, ApiError> {
        if self.needs_refresh() {
            if let Err(e) = self.refresh().await {
                // A stale list still answers; an empty one cannot
                if self.is_empty() {
                    return Err(e);
                }
                warn!(blocklist = %self.config.name, error = %e, "Failed to refresh blocklist");
            }
        }

        let listed = self.is_listed(ip)?;
        if listed {
            debug!(ip = %ip, blocklist = %self.config.name, "IP found in blocklist");
        }
        Ok(listed)
    }
}

/// Parse list contents in the given format.
fn parse_list(content: &str, format: BlocklistFormat) -> Result<RangeSet, ApiError> {
    let mut set = RangeSet::default();

    match format {
        BlocklistFormat::Plain => {
            for line in data_lines(content) {
                set.insert(line);
            }
        }
        BlocklistFormat::Csv => {
            for line in data_lines(content) {
                if let Some(first) = line.split(',').next() {
                    set.insert(first.trim());
                }
            }
        }
        BlocklistFormat::Json => {
            let ips: Vec<String> = serde_json::from_str(content)
                .map_err(|e| ApiError::soft(format!("Invalid JSON blocklist: {}", e)))?;
            for ip in &ips {
                set.insert(ip.trim());
            }
        }
    }

    Ok(set)
}

/// Non-empty, non-comment lines.
fn data_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_blocklist(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn create_config(file: &NamedTempFile, format: BlocklistFormat) -> BlocklistConfig {
        BlocklistConfig {
            name: "hosting-ranges".to_string(),
            enabled: true,
            path: file.path().to_path_buf(),
            format,
            refresh_interval_seconds: 300,
        }
    }

    #[test]
    fn test_parse_plain() {
        let content = "# Comment\n192.168.1.1\n10.0.0.0/8\n\nnot-an-ip\n1.2.3.4\n";
        let set = parse_list(content, BlocklistFormat::Plain).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&"10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_parse_csv() {
        let content = "192.168.1.1,reason1\n10.0.0.0/8,reason2\n";
        let set = parse_list(content, BlocklistFormat::Csv).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_parse_json() {
        let set = parse_list(r#"["192.168.1.1", "2001:db8::/32"]"#, BlocklistFormat::Json).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&"2001:db8::1".parse().unwrap()));
        assert!(parse_list("{", BlocklistFormat::Json).is_err());
    }

    #[tokio::test]
    async fn test_blocklist_source() {
        let file = create_temp_blocklist("192.168.1.1\n10.0.0.0/8\n");
        let source = BlocklistSource::new(create_config(&file, BlocklistFormat::Plain)).unwrap();

        assert_eq!(source.name(), "hosting-ranges");
        assert!(source.get_result(&"192.168.1.1".parse().unwrap()).await.unwrap());
        assert!(source.get_result(&"10.0.0.1".parse().unwrap()).await.unwrap());
        assert!(!source.get_result(&"8.8.8.8".parse().unwrap()).await.unwrap());
    }

    #[test]
    fn test_missing_file_is_hard_error() {
        let config = BlocklistConfig {
            name: "gone".to_string(),
            enabled: true,
            path: "/nonexistent/vpn-ranges.txt".into(),
            format: BlocklistFormat::Plain,
            refresh_interval_seconds: 300,
        };
        assert!(matches!(BlocklistSource::new(config), Err(e) if e.is_hard()));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_changes() {
        let mut file = create_temp_blocklist("1.1.1.1\n");
        let source = BlocklistSource::new(create_config(&file, BlocklistFormat::Plain)).unwrap();
        assert!(!source.get_result(&"2.2.2.2".parse().unwrap()).await.unwrap());

        file.write_all(b"2.2.2.2\n").unwrap();
        file.flush().unwrap();
        source.refresh().await.unwrap();

        assert!(source.get_result(&"2.2.2.2".parse().unwrap()).await.unwrap());
    }
}
