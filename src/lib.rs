//! VPN verdict aggregation, caching and replication.
//!
//! Decides whether an IP belongs to a VPN or proxy by asking several
//! third-party sources and combining their answers, then remembers the
//! answer so that neither this node nor its peers ask again for a while.
//!
//! # Features
//!
//! - **Cascade** - First positive source wins, remaining sources are skipped
//! - **Consensus** - Ratio of positive sources, compared against a threshold
//! - **Sources** - GetIPIntel, IPHub, ProxyCheck and local range files
//! - **Caching** - In-process tier in front of a memory or SQLite store
//! - **Single-flight** - Concurrent lookups for one IP share a single batch
//! - **Replication** - Fresh verdicts are published to the other nodes
//! - **Migration** - Paged copy of every table between two stores
//!
//! # Example Configuration
//!
//! ```yaml
//! algorithm:
//!   method: consensus
//!   min_consensus: 0.6
//!
//! sources:
//!   order: [iphub, proxycheck]
//!   iphub:
//!     key: "${IPHUB_KEY}"
//!   proxycheck:
//!     key: ""
//!
//! storage:
//!   order: [local]
//!   engines:
//!     local:
//!       type: sqlite
//!       path: "vpn-verdict.db"
//!
//! ignore:
//!   - "10.0.0.0/8"
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod guard;
pub mod inflight;
pub mod orchestrator;
pub mod replication;
pub mod sources;
pub mod store;
pub mod verdict;

pub use config::Config;
pub use error::{ApiError, LookupError, MessagingError, StorageError};
pub use guard::{Assessment, DecisionSource, VpnGuard};
pub use orchestrator::{Lookup, Orchestrator, OrchestratorOptions};
pub use replication::{InMemoryBus, ReplicationBus, ReplicationMessage};
pub use sources::{SourceRegistry, VpnSource};
pub use store::{MemoryStore, SqliteStore, VerdictStore};
pub use verdict::{Consensus, Verdict, VerdictKind};
