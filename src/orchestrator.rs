//! Cascade and consensus aggregation over the configured sources.
//!
//! A lookup checks the memory tier, then the verdict store, and only on a
//! miss queries sources. Concurrent lookups for the same IP and policy share
//! one source batch. Fresh verdicts are written through to the store and
//! published to the replication bus without delaying the caller.

use crate::cache::VerdictCache;
use crate::config::Config;
use crate::error::{ApiError, LookupError, MessagingError};
use crate::inflight::SingleFlight;
use crate::replication::{ReplicationListener, ReplicationMessage, SharedBus};
use crate::sources::SharedSource;
use crate::store::SharedStore;
use crate::verdict::{now_millis, Consensus, PostVpnResult, Verdict, VerdictKind, VerdictRecord};
use dashmap::DashSet;
use futures::future::join_all;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tuning for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Replication origin of this node.
    pub server_id: String,
    /// Maximum concurrent source calls across all lookups.
    pub threads: usize,
    /// Bound on a single source call.
    pub call_timeout: Duration,
    /// Bound on a whole cascade or consensus run.
    pub lookup_timeout: Duration,
    /// Freshness window for stored verdicts.
    pub cache_time_millis: i64,
    pub memory_cache_ttl: Duration,
    pub memory_cache_entries: usize,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_id: config.node.server_id.clone(),
            threads: config.connection.threads,
            call_timeout: config.connection.timeout(),
            lookup_timeout: config.connection.lookup_timeout(),
            cache_time_millis: config.sources.cache_time_millis(),
            memory_cache_ttl: Duration::from_secs(config.connection.memory_cache_seconds),
            memory_cache_entries: config.connection.memory_cache_entries,
        }
    }
}

/// How a lookup was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// A fresh row of the requested policy was already known.
    Cached(VerdictRecord),
    /// Sources were queried. `stored` is `None` when the write-through failed.
    Computed {
        verdict: Verdict,
        stored: Option<PostVpnResult>,
    },
    /// No source answered definitively, or the lookup timed out.
    Undetermined,
}

impl Lookup {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Lookup::Cached(record) => Some(record.verdict),
            Lookup::Computed { verdict, .. } => Some(*verdict),
            Lookup::Undetermined => None,
        }
    }

    /// The stored row behind this answer. Cache hits report `fresh: false`.
    pub fn result(&self) -> Option<PostVpnResult> {
        match self {
            Lookup::Cached(record) => Some(PostVpnResult {
                id: record.id,
                ip_id: record.ip_id,
                ip: record.ip.clone(),
                verdict: record.verdict,
                created: record.created,
                fresh: false,
            }),
            Lookup::Computed { stored, .. } => stored.clone(),
            Lookup::Undetermined => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Lookup::Cached(_))
    }
}

type FlightKey = (String, VerdictKind);

/// Runs cascade and consensus lookups.
pub struct Orchestrator {
    sources: Vec<SharedSource>,
    store: SharedStore,
    bus: Option<SharedBus>,
    cache: Arc<VerdictCache>,
    inflight: SingleFlight<FlightKey, Result<Lookup, LookupError>>,
    workers: Arc<Semaphore>,
    disabled: DashSet<String>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    /// `sources` must already be filtered and in query order.
    pub fn new(sources: Vec<SharedSource>, store: SharedStore, options: OrchestratorOptions) -> Self {
        let cache = Arc::new(
            VerdictCache::new(options.memory_cache_ttl, options.memory_cache_entries)
                .with_max_age(options.cache_time_millis),
        );

        info!(
            sources = sources.len(),
            store = %store.name(),
            threads = options.threads,
            "Orchestrator initialized"
        );

        Self {
            sources,
            store,
            bus: None,
            cache,
            inflight: SingleFlight::new(),
            workers: Arc::new(Semaphore::new(options.threads.max(1))),
            disabled: DashSet::new(),
            options,
        }
    }

    /// Publish fresh verdicts on `bus`.
    pub fn with_bus(mut self, bus: SharedBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<VerdictCache> {
        &self.cache
    }

    pub fn server_id(&self) -> &str {
        &self.options.server_id
    }

    /// Names of sources still in rotation, in query order.
    pub fn active_sources(&self) -> Vec<&str> {
        self.active().map(|s| s.name()).collect()
    }

    /// Subscribe to the bus and apply other nodes' verdicts on a background task.
    ///
    /// Returns `None` on a single node without a bus.
    pub fn start_replication(&self) -> Result<Option<JoinHandle<()>>, MessagingError> {
        let Some(bus) = &self.bus else {
            return Ok(None);
        };
        let listener = ReplicationListener::new(
            self.options.server_id.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.options.cache_time_millis,
        );
        Ok(Some(listener.spawn(bus.subscribe()?)))
    }

    /// First-positive-wins lookup.
    ///
    /// An undetermined run reports `false`.
    pub async fn cascade(&self, ip: &str) -> Result<bool, LookupError> {
        let lookup = self.lookup(ip, VerdictKind::Cascade).await?;
        Ok(lookup.verdict().and_then(|v| v.as_cascade()).unwrap_or(false))
    }

    /// Ratio of positive sources over those that answered.
    pub async fn consensus(&self, ip: &str) -> Result<Consensus, LookupError> {
        let lookup = self.lookup(ip, VerdictKind::Consensus).await?;
        Ok(match lookup.verdict().and_then(|v| v.as_consensus()) {
            Some(ratio) => Consensus::Ratio(ratio),
            None => Consensus::Unknown,
        })
    }

    /// Resolve `ip` under `kind`, reporting how the answer was obtained.
    pub async fn lookup(&self, ip: &str, kind: VerdictKind) -> Result<Lookup, LookupError> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| LookupError::InvalidIp(ip.to_string()))?;
        let ip = addr.to_string();

        if let Some(record) = self.cache.get(&ip, kind) {
            debug!(ip = %ip, kind = %kind, "Memory cache hit");
            return Ok(Lookup::Cached(record));
        }

        self.inflight
            .run((ip.clone(), kind), || self.resolve(&ip, addr, kind))
            .await
    }

    async fn resolve(&self, ip: &str, addr: IpAddr, kind: VerdictKind) -> Result<Lookup, LookupError> {
        if let Some(record) = self
            .store
            .get_by_ip_kind(ip, kind, self.options.cache_time_millis)
            .await?
        {
            debug!(ip = %ip, kind = %kind, "Store cache hit");
            self.cache.insert(record.clone());
            return Ok(Lookup::Cached(record));
        }

        let computed = match tokio::time::timeout(self.options.lookup_timeout, self.compute(&addr, kind)).await {
            Ok(computed) => computed,
            Err(_) => {
                warn!(ip = %ip, kind = %kind, "Lookup timed out");
                None
            }
        };

        let Some(verdict) = computed else {
            debug!(ip = %ip, kind = %kind, "No source answered definitively");
            return Ok(Lookup::Undetermined);
        };

        let stored = self.write_through(ip, verdict).await;
        Ok(Lookup::Computed { verdict, stored })
    }

    async fn compute(&self, ip: &IpAddr, kind: VerdictKind) -> Option<Verdict> {
        match kind {
            VerdictKind::Cascade => self.run_cascade(ip).await.map(Verdict::Cascade),
            VerdictKind::Consensus => self.run_consensus(ip).await.ratio().map(Verdict::Consensus),
        }
    }

    /// `None` when every source failed.
    async fn run_cascade(&self, ip: &IpAddr) -> Option<bool> {
        let mut definitive = false;
        for source in self.active() {
            match self.query(source, ip).await {
                Some(true) => {
                    debug!(ip = %ip, source = source.name(), "Cascade positive");
                    return Some(true);
                }
                Some(false) => definitive = true,
                None => {}
            }
        }
        definitive.then_some(false)
    }

    async fn run_consensus(&self, ip: &IpAddr) -> Consensus {
        let answers = join_all(self.active().map(|source| self.query(source, ip))).await;
        let definitive = answers.iter().flatten().count();
        let positives = answers.iter().flatten().filter(|vpn| **vpn).count();

        debug!(ip = %ip, positives, definitive, "Consensus collected");
        Consensus::from_counts(positives, definitive)
    }

    /// One bounded source call. `None` for any failure.
    async fn query(&self, source: &SharedSource, ip: &IpAddr) -> Option<bool> {
        let _permit = self.workers.acquire().await.ok()?;

        match tokio::time::timeout(self.options.call_timeout, source.get_result(ip)).await {
            Ok(Ok(vpn)) => Some(vpn),
            Ok(Err(e)) if e.is_hard() => {
                self.disable(source.name(), &e);
                None
            }
            Ok(Err(e)) => {
                warn!(source = source.name(), ip = %ip, error = %e, "Source lookup failed");
                None
            }
            Err(_) => {
                warn!(source = source.name(), ip = %ip, "Source lookup timed out");
                None
            }
        }
    }

    fn active(&self) -> impl Iterator<Item = &SharedSource> {
        self.sources
            .iter()
            .filter(|source| !self.disabled.contains(source.name()))
    }

    fn disable(&self, name: &str, e: &ApiError) {
        if self.disabled.insert(name.to_string()) {
            error!(
                source = name,
                error = %e.message,
                "Source is misconfigured, removing it until restart"
            );
        }
    }

    async fn write_through(&self, ip: &str, verdict: Verdict) -> Option<PostVpnResult> {
        let (stored, created) = match self.store.post(ip, verdict).await {
            Ok(result) => {
                self.cache.insert(result.record());
                let created = result.created;
                (Some(result), created)
            }
            Err(e) => {
                warn!(ip = %ip, store = %self.store.name(), error = %e, "Failed to store verdict");
                (None, now_millis())
            }
        };

        self.publish(ReplicationMessage {
            origin: self.options.server_id.clone(),
            ip: ip.to_string(),
            verdict,
            created,
        });
        stored
    }

    fn publish(&self, message: ReplicationMessage) {
        let Some(bus) = &self.bus else {
            return;
        };
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(&message).await {
                warn!(ip = %message.ip, bus = %bus.name(), error = %e, "Failed to publish verdict");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{InMemoryBus, ReplicationBus};
    use crate::store::{MemoryStore, VerdictStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        answer: Result<bool, ApiError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, answer: Result<bool, ApiError>) -> Arc<Self> {
            Self::slow(name, answer, Duration::ZERO)
        }

        fn slow(name: &'static str, answer: Result<bool, ApiError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl crate::sources::VpnSource for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn requires_key(&self) -> bool {
            false
        }

        async fn get_result(&self, _ip: &IpAddr) -> Result<bool, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.answer.clone()
        }
    }

    fn options() -> OrchestratorOptions {
        OrchestratorOptions {
            server_id: "node-a".to_string(),
            threads: 4,
            call_timeout: Duration::from_secs(1),
            lookup_timeout: Duration::from_secs(5),
            cache_time_millis: 60_000,
            memory_cache_ttl: Duration::from_secs(60),
            memory_cache_entries: 100,
        }
    }

    fn orchestrator(sources: &[Arc<Scripted>]) -> (Orchestrator, Arc<MemoryStore>) {
        orchestrator_with(sources, options())
    }

    fn orchestrator_with(
        sources: &[Arc<Scripted>],
        options: OrchestratorOptions,
    ) -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sources = sources.iter().map(|s| s.clone() as SharedSource).collect();
        (Orchestrator::new(sources, store.clone(), options), store)
    }

    #[tokio::test]
    async fn test_cascade_stops_at_first_positive() {
        let a = Scripted::new("a", Ok(false));
        let b = Scripted::new("b", Ok(true));
        let c = Scripted::new("c", Ok(true));
        let (orchestrator, _) = orchestrator(&[a.clone(), b.clone(), c.clone()]);

        assert!(orchestrator.cascade("1.2.3.4").await.unwrap());
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_policies_disagree_on_same_input() {
        let a = Scripted::new("a", Ok(false));
        let b = Scripted::new("b", Ok(true));
        let (orchestrator, _) = orchestrator(&[a, b]);

        assert!(orchestrator.cascade("1.2.3.4").await.unwrap());
        let consensus = orchestrator.consensus("1.2.3.4").await.unwrap();
        assert_eq!(consensus, Consensus::Ratio(0.5));
        assert!(!consensus.meets(0.6));
    }

    #[tokio::test]
    async fn test_soft_failure_is_skipped_and_excluded() {
        let a = Scripted::new("a", Err(ApiError::soft("HTTP 503")));
        let b = Scripted::new("b", Ok(true));
        let (orchestrator, _) = orchestrator(&[a.clone(), b]);

        assert!(orchestrator.cascade("1.2.3.4").await.unwrap());
        assert_eq!(
            orchestrator.consensus("1.2.3.4").await.unwrap(),
            Consensus::Ratio(1.0)
        );
        // Soft failures stay in rotation
        assert_eq!(a.calls(), 2);
        assert_eq!(orchestrator.active_sources(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_hard_failure_disables_source() {
        let a = Scripted::new("a", Err(ApiError::hard("contact is not defined")));
        let b = Scripted::new("b", Ok(false));
        let (orchestrator, _) = orchestrator(&[a.clone(), b.clone()]);

        assert!(!orchestrator.cascade("1.2.3.4").await.unwrap());
        assert!(!orchestrator.cascade("5.6.7.8").await.unwrap());

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
        assert_eq!(orchestrator.active_sources(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_undetermined_is_not_persisted() {
        let a = Scripted::new("a", Err(ApiError::soft("timeout")));
        let (orchestrator, store) = orchestrator(&[a]);

        let lookup = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();
        assert_eq!(lookup, Lookup::Undetermined);
        assert!(!orchestrator.cascade("1.2.3.4").await.unwrap());
        assert_eq!(
            orchestrator.consensus("1.2.3.4").await.unwrap(),
            Consensus::Unknown
        );
        assert!(store.dump_verdicts(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_lookup_hits_cache() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, store) = orchestrator(&[a.clone()]);

        let first = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();
        let second = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();

        assert!(first.result().unwrap().fresh);
        assert!(second.is_cached());
        assert!(!second.result().unwrap().fresh);
        assert_eq!(first.verdict(), second.verdict());
        assert_eq!(a.calls(), 1);
        assert_eq!(store.verdict_count(), 1);
    }

    #[tokio::test]
    async fn test_store_hit_skips_sources() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, store) = orchestrator(&[a.clone()]);
        store.post("1.2.3.4", Verdict::Cascade(false)).await.unwrap();

        assert!(!orchestrator.cascade("1.2.3.4").await.unwrap());
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_other_policy_row_is_a_miss() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, store) = orchestrator(&[a.clone()]);
        store.post("1.2.3.4", Verdict::Cascade(false)).await.unwrap();

        assert_eq!(
            orchestrator.consensus("1.2.3.4").await.unwrap(),
            Consensus::Ratio(1.0)
        );
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_row_is_recomputed() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, store) = orchestrator(&[a.clone()]);
        store
            .apply_replicated("node-b", "1.2.3.4", Verdict::Cascade(false), now_millis() - 120_000)
            .await
            .unwrap();

        assert!(orchestrator.cascade("1.2.3.4").await.unwrap());
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_tier_respects_store_freshness() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, _) = orchestrator_with(
            &[a.clone()],
            OrchestratorOptions {
                cache_time_millis: 50,
                memory_cache_ttl: Duration::from_secs(60),
                ..options()
            },
        );

        let first = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();
        assert!(!first.is_cached());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();
        assert!(!second.is_cached());
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_older_matching_row_beats_newer_other_policy() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, store) = orchestrator(&[a.clone()]);
        let now = now_millis();
        store
            .apply_replicated("node-b", "1.2.3.4", Verdict::Cascade(false), now - 1_000)
            .await
            .unwrap();
        store
            .apply_replicated("node-c", "1.2.3.4", Verdict::Consensus(0.5), now)
            .await
            .unwrap();

        let lookup = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();
        assert!(lookup.is_cached());
        assert_eq!(lookup.verdict(), Some(Verdict::Cascade(false)));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_batch() {
        let a = Scripted::slow("a", Ok(true), Duration::from_millis(50));
        let b = Scripted::slow("b", Ok(false), Duration::from_millis(50));
        let (orchestrator, store) = orchestrator(&[a.clone(), b.clone()]);

        let lookups = (0..10).map(|_| orchestrator.consensus("1.2.3.4"));
        let results = join_all(lookups).await;

        assert!(results
            .iter()
            .all(|r| *r.as_ref().unwrap() == Consensus::Ratio(0.5)));
        assert_eq!((a.calls(), b.calls()), (1, 1));
        assert_eq!(store.verdict_count(), 1);
    }

    #[tokio::test]
    async fn test_ip_is_canonicalized() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, _) = orchestrator(&[a.clone()]);

        orchestrator.cascade("2001:DB8::1").await.unwrap();
        orchestrator.cascade(" 2001:db8:0::1 ").await.unwrap();
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ip_is_rejected() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, _) = orchestrator(&[a.clone()]);

        assert_eq!(
            orchestrator.cascade("not-an-ip").await,
            Err(LookupError::InvalidIp("not-an-ip".to_string()))
        );
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let a = Scripted::slow("a", Ok(true), Duration::from_millis(500));
        let b = Scripted::new("b", Ok(false));
        let mut options = options();
        options.call_timeout = Duration::from_millis(20);
        let (orchestrator, _) = orchestrator_with(&[a, b], options);

        assert_eq!(
            orchestrator.consensus("1.2.3.4").await.unwrap(),
            Consensus::Ratio(0.0)
        );
    }

    #[tokio::test]
    async fn test_lookup_timeout_is_undetermined() {
        let a = Scripted::slow("a", Ok(true), Duration::from_millis(500));
        let mut options = options();
        options.lookup_timeout = Duration::from_millis(20);
        let (orchestrator, store) = orchestrator_with(&[a], options);

        let lookup = orchestrator.lookup("1.2.3.4", VerdictKind::Cascade).await.unwrap();
        assert_eq!(lookup, Lookup::Undetermined);
        assert_eq!(store.verdict_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_verdict_is_published() {
        let a = Scripted::new("a", Ok(true));
        let bus = Arc::new(InMemoryBus::new(16));
        let mut subscription = bus.subscribe().unwrap();
        let (orchestrator, _) = orchestrator(&[a]);
        let orchestrator = orchestrator.with_bus(bus.clone());

        orchestrator.cascade("1.2.3.4").await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.origin, "node-a");
        assert_eq!(message.ip, "1.2.3.4");
        assert_eq!(message.verdict, Verdict::Cascade(true));
    }

    #[tokio::test]
    async fn test_closed_store_surfaces_error() {
        let a = Scripted::new("a", Ok(true));
        let (orchestrator, store) = orchestrator(&[a]);
        store.close().await;

        assert!(matches!(
            orchestrator.cascade("1.2.3.4").await,
            Err(LookupError::Storage(_))
        ));
    }
}
