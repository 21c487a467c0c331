mod common;

use common::{options, Scripted};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use vpn_verdict::sources::SharedSource;
use vpn_verdict::{
    ApiError, Config, Consensus, DecisionSource, MemoryStore, Orchestrator, SqliteStore,
    VerdictKind, VerdictStore, VpnGuard,
};

fn sources(list: &[Arc<Scripted>]) -> Vec<SharedSource> {
    list.iter().map(|s| s.clone() as SharedSource).collect()
}

#[tokio::test]
async fn test_same_input_both_policies() {
    let a = Scripted::new("a", Ok(false));
    let b = Scripted::new("b", Ok(true));

    let mut cascade_config = Config::default();
    cascade_config.algorithm.method = VerdictKind::Cascade;
    let mut consensus_config = Config::default();
    consensus_config.algorithm.method = VerdictKind::Consensus;
    consensus_config.algorithm.min_consensus = 0.6;

    let cascade = VpnGuard::with_orchestrator(
        cascade_config,
        Arc::new(Orchestrator::new(
            sources(&[a.clone(), b.clone()]),
            Arc::new(MemoryStore::new()),
            options("node-a"),
        )),
    );
    let consensus = VpnGuard::with_orchestrator(
        consensus_config,
        Arc::new(Orchestrator::new(
            sources(&[a, b]),
            Arc::new(MemoryStore::new()),
            options("node-a"),
        )),
    );

    assert!(cascade.check("192.0.2.10", None).await.unwrap().is_vpn);

    let assessment = consensus.check("192.0.2.10", None).await.unwrap();
    assert!(!assessment.is_vpn);
    assert_eq!(assessment.decision_source, DecisionSource::Sources);
    assert_eq!(
        consensus
            .orchestrator()
            .consensus("192.0.2.10")
            .await
            .unwrap(),
        Consensus::Ratio(0.5)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_across_tasks() {
    let a = Scripted::slow("a", Ok(true), Duration::from_millis(100));
    let b = Scripted::slow("b", Err(ApiError::soft("HTTP 429")), Duration::from_millis(20));
    let orchestrator = Arc::new(Orchestrator::new(
        sources(&[a.clone(), b.clone()]),
        Arc::new(MemoryStore::new()),
        options("node-a"),
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.consensus("192.0.2.20").await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), Consensus::Ratio(1.0));
    }

    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn test_sqlite_backed_cache_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("verdicts.db");
    let a = Scripted::new("a", Ok(true));

    {
        let store = Arc::new(SqliteStore::open("sqlite", &path, "avpn_").unwrap());
        let orchestrator = Orchestrator::new(sources(&[a.clone()]), store.clone(), options("node-a"));
        assert!(orchestrator.cascade("192.0.2.30").await.unwrap());
        store.close().await;
    }

    let store = Arc::new(SqliteStore::open("sqlite", &path, "avpn_").unwrap());
    let orchestrator = Orchestrator::new(sources(&[a.clone()]), store, options("node-a"));
    let lookup = orchestrator
        .lookup("192.0.2.30", VerdictKind::Cascade)
        .await
        .unwrap();

    assert!(lookup.is_cached());
    assert_eq!(a.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_interning_creates_one_row() {
    let dir = tempfile::TempDir::new().unwrap();
    let sqlite: Arc<dyn VerdictStore> =
        Arc::new(SqliteStore::open("sqlite", &dir.path().join("ids.db"), "avpn_").unwrap());
    let memory: Arc<dyn VerdictStore> = Arc::new(MemoryStore::new());

    for store in [sqlite, memory] {
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.ip_id("192.0.2.40").await }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.dump_ips(0, 10).await.unwrap().len(), 1);
    }
}
