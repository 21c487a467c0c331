use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vpn_verdict::orchestrator::OrchestratorOptions;
use vpn_verdict::{ApiError, VpnSource};

/// Source that always gives the same answer and counts its calls.
pub struct Scripted {
    name: &'static str,
    answer: Result<bool, ApiError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn new(name: &'static str, answer: Result<bool, ApiError>) -> Arc<Self> {
        Self::slow(name, answer, Duration::ZERO)
    }

    pub fn slow(name: &'static str, answer: Result<bool, ApiError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            answer,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VpnSource for Scripted {
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

pub fn options(server_id: &str) -> OrchestratorOptions {
    OrchestratorOptions {
        server_id: server_id.to_string(),
        threads: 4,
        call_timeout: Duration::from_secs(1),
        lookup_timeout: Duration::from_secs(5),
        cache_time_millis: 60_000,
        memory_cache_ttl: Duration::from_secs(60),
        memory_cache_entries: 1000,
    }
}
