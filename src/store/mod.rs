//! Verdict storage.
//!
//! A [`VerdictStore`] owns three tables: interned IPs, interned players and
//! verdict rows keyed by the IP's surrogate ID. Backends must guarantee that
//! interning a key creates at most one row even under concurrent callers, and
//! that a verdict row is only written after its IP has been interned.

pub mod memory;
pub mod migrate;
pub mod sqlite;
pub mod surrogate;

pub use memory::MemoryStore;
pub use migrate::{migrate, MigrationReport};
pub use sqlite::SqliteStore;

use crate::config::{StorageEngine, StorageEngineConfig};
use crate::error::StorageError;
use crate::verdict::{
    IpRecord, PlayerRecord, PostVpnResult, RawVerdict, Verdict, VerdictKind, VerdictRecord,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Backend-agnostic verdict persistence.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Surrogate ID for an IP, interning it on first use.
    async fn ip_id(&self, ip: &str) -> Result<i64, StorageError>;

    /// Surrogate ID for a player, interning it on first use.
    async fn player_id(&self, player: Uuid) -> Result<i64, StorageError>;

    /// Most recent verdict for `ip` created within `max_age_millis`.
    async fn get_by_ip(
        &self,
        ip: &str,
        max_age_millis: i64,
    ) -> Result<Option<VerdictRecord>, StorageError>;

    /// Most recent verdict of policy `kind` for `ip` created within
    /// `max_age_millis`, ignoring newer rows of the other policy.
    async fn get_by_ip_kind(
        &self,
        ip: &str,
        kind: VerdictKind,
        max_age_millis: i64,
    ) -> Result<Option<VerdictRecord>, StorageError>;

    /// Record a freshly computed verdict stamped with the current time.
    async fn post(&self, ip: &str, verdict: Verdict) -> Result<PostVpnResult, StorageError>;

    /// Record a verdict computed by another node, keeping its timestamp.
    ///
    /// Returns false without writing when a local row for the IP is at least
    /// as new as `created`, so replaying a message is a no-op.
    async fn apply_replicated(
        &self,
        origin: &str,
        ip: &str,
        verdict: Verdict,
        created: i64,
    ) -> Result<bool, StorageError>;

    /// Page of interned IPs ordered by ID.
    async fn dump_ips(&self, offset: u64, size: usize) -> Result<Vec<IpRecord>, StorageError>;

    /// Import interned IPs. `truncate` clears IPs and verdicts first.
    ///
    /// Without `truncate`, known IPs are skipped and an IP whose ID is
    /// already taken gets a fresh one.
    async fn load_ips(&self, ips: &[IpRecord], truncate: bool) -> Result<(), StorageError>;

    /// Page of interned players ordered by ID.
    async fn dump_players(
        &self,
        offset: u64,
        size: usize,
    ) -> Result<Vec<PlayerRecord>, StorageError>;

    /// Import interned players. `truncate` clears players first.
    async fn load_players(
        &self,
        players: &[PlayerRecord],
        truncate: bool,
    ) -> Result<(), StorageError>;

    /// Page of verdict rows ordered by ID.
    async fn dump_verdicts(&self, offset: u64, size: usize)
        -> Result<Vec<RawVerdict>, StorageError>;

    /// Import verdict rows. Every `ip_id` must already exist.
    ///
    /// `truncate` clears verdicts first and keeps row IDs. Otherwise rows
    /// identical to an existing one are skipped and new rows get fresh IDs.
    async fn load_verdicts(&self, rows: &[RawVerdict], truncate: bool)
        -> Result<(), StorageError>;

    /// Release backend resources. Later calls fail with `StorageError::Closed`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn VerdictStore>;

/// Open the backend described by an engine config.
pub fn open(name: &str, config: &StorageEngineConfig) -> Result<SharedStore, StorageError> {
    match &config.engine {
        StorageEngine::Memory => Ok(Arc::new(MemoryStore::with_name(name))),
        StorageEngine::Sqlite { path, prefix } => {
            Ok(Arc::new(SqliteStore::open(name, path, prefix)?))
        }
    }
}
