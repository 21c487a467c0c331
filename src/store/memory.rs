//! Process-local verdict store.

use super::surrogate::Interner;
use super::VerdictStore;
use crate::error::StorageError;
use crate::verdict::{
    now_millis, IpRecord, PlayerRecord, PostVpnResult, RawVerdict, Verdict, VerdictKind,
    VerdictRecord,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    ips: Interner<String>,
    players: Interner<Uuid>,
    verdicts: BTreeMap<i64, RawVerdict>,
    /// Verdict row IDs per IP surrogate ID.
    by_ip: HashMap<i64, Vec<i64>>,
    next_verdict: i64,
}

impl Tables {
    fn insert_verdict(&mut self, ip_id: i64, verdict: Verdict, created: i64) -> i64 {
        self.next_verdict = self.next_verdict.max(1);
        let id = self.next_verdict;
        self.next_verdict += 1;
        self.put_verdict(RawVerdict {
            id,
            ip_id,
            verdict,
            created,
        });
        id
    }

    fn put_verdict(&mut self, row: RawVerdict) {
        self.next_verdict = self.next_verdict.max(row.id + 1);
        self.by_ip.entry(row.ip_id).or_default().push(row.id);
        self.verdicts.insert(row.id, row);
    }

    /// Newest row for an IP, ties broken by row ID.
    fn latest(&self, ip_id: i64) -> Option<&RawVerdict> {
        self.by_ip
            .get(&ip_id)?
            .iter()
            .filter_map(|id| self.verdicts.get(id))
            .max_by_key(|row| (row.created, row.id))
    }

    fn latest_of(&self, ip_id: i64, kind: VerdictKind) -> Option<&RawVerdict> {
        self.by_ip
            .get(&ip_id)?
            .iter()
            .filter_map(|id| self.verdicts.get(id))
            .filter(|row| row.verdict.kind() == kind)
            .max_by_key(|row| (row.created, row.id))
    }

    fn clear_verdicts(&mut self) {
        self.verdicts.clear();
        self.by_ip.clear();
    }

    fn record(&self, row: &RawVerdict) -> Result<VerdictRecord, StorageError> {
        let ip = self.ips.key_of(row.ip_id).ok_or_else(|| {
            StorageError::Integrity(format!("verdict {} references unknown ip {}", row.id, row.ip_id))
        })?;
        Ok(VerdictRecord {
            id: row.id,
            ip_id: row.ip_id,
            ip: ip.clone(),
            verdict: row.verdict,
            created: row.created,
        })
    }
}

/// Verdict store held entirely in memory.
///
/// All three tables sit behind one lock, so interning and inserting a
/// verdict happen atomically.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    tables: RwLock<Tables>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_name("memory")
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: RwLock::new(Tables::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        self.tables
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        self.tables
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    /// Number of verdict rows.
    pub fn verdict_count(&self) -> usize {
        self.tables.read().map(|t| t.verdicts.len()).unwrap_or(0)
    }

    /// Number of interned IPs.
    pub fn ip_count(&self) -> usize {
        self.tables.read().map(|t| t.ips.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerdictStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ip_id(&self, ip: &str) -> Result<i64, StorageError> {
        let key = ip.to_string();
        if let Some(id) = self.read()?.ips.get(&key) {
            return Ok(id);
        }
        Ok(self.write()?.ips.intern(&key))
    }

    async fn player_id(&self, player: Uuid) -> Result<i64, StorageError> {
        if let Some(id) = self.read()?.players.get(&player) {
            return Ok(id);
        }
        Ok(self.write()?.players.intern(&player))
    }

    async fn get_by_ip(
        &self,
        ip: &str,
        max_age_millis: i64,
    ) -> Result<Option<VerdictRecord>, StorageError> {
        let tables = self.read()?;
        let Some(ip_id) = tables.ips.get(&ip.to_string()) else {
            return Ok(None);
        };
        let now = now_millis();
        match tables.latest(ip_id) {
            Some(row) if now - row.created <= max_age_millis => Ok(Some(tables.record(row)?)),
            _ => Ok(None),
        }
    }

    async fn get_by_ip_kind(
        &self,
        ip: &str,
        kind: VerdictKind,
        max_age_millis: i64,
    ) -> Result<Option<VerdictRecord>, StorageError> {
        let tables = self.read()?;
        let Some(ip_id) = tables.ips.get(&ip.to_string()) else {
            return Ok(None);
        };
        let now = now_millis();
        match tables.latest_of(ip_id, kind) {
            Some(row) if now - row.created <= max_age_millis => Ok(Some(tables.record(row)?)),
            _ => Ok(None),
        }
    }

    async fn post(&self, ip: &str, verdict: Verdict) -> Result<PostVpnResult, StorageError> {
        let mut tables = self.write()?;
        let ip_id = tables.ips.intern(&ip.to_string());
        let created = now_millis();
        let id = tables.insert_verdict(ip_id, verdict, created);

        Ok(PostVpnResult {
            id,
            ip_id,
            ip: ip.to_string(),
            verdict,
            created,
            fresh: true,
        })
    }

    async fn apply_replicated(
        &self,
        origin: &str,
        ip: &str,
        verdict: Verdict,
        created: i64,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        let ip_id = tables.ips.intern(&ip.to_string());

        if let Some(latest) = tables.latest(ip_id) {
            if latest.created >= created {
                debug!(ip = %ip, origin = %origin, "Replicated verdict is not newer, skipping");
                return Ok(false);
            }
        }

        tables.insert_verdict(ip_id, verdict, created);
        Ok(true)
    }

    async fn dump_ips(&self, offset: u64, size: usize) -> Result<Vec<IpRecord>, StorageError> {
        Ok(self
            .read()?
            .ips
            .page(offset, size)
            .into_iter()
            .map(|(id, ip)| IpRecord { id, ip })
            .collect())
    }

    async fn load_ips(&self, ips: &[IpRecord], truncate: bool) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        if truncate {
            tables.ips.clear();
            tables.clear_verdicts();
        }
        for record in ips {
            tables.ips.insert_raw(record.id, &record.ip);
        }
        Ok(())
    }

    async fn dump_players(
        &self,
        offset: u64,
        size: usize,
    ) -> Result<Vec<PlayerRecord>, StorageError> {
        Ok(self
            .read()?
            .players
            .page(offset, size)
            .into_iter()
            .map(|(id, player)| PlayerRecord { id, player })
            .collect())
    }

    async fn load_players(
        &self,
        players: &[PlayerRecord],
        truncate: bool,
    ) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        if truncate {
            tables.players.clear();
        }
        for record in players {
            tables.players.insert_raw(record.id, &record.player);
        }
        Ok(())
    }

    async fn dump_verdicts(
        &self,
        offset: u64,
        size: usize,
    ) -> Result<Vec<RawVerdict>, StorageError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(self
            .read()?
            .verdicts
            .values()
            .skip(skip)
            .take(size)
            .cloned()
            .collect())
    }

    async fn load_verdicts(
        &self,
        rows: &[RawVerdict],
        truncate: bool,
    ) -> Result<(), StorageError> {
        let mut tables = self.write()?;

        if let Some(orphan) = rows.iter().find(|r| tables.ips.key_of(r.ip_id).is_none()) {
            return Err(StorageError::Integrity(format!(
                "verdict {} references unknown ip {}",
                orphan.id, orphan.ip_id
            )));
        }

        if truncate {
            tables.clear_verdicts();
            for row in rows {
                tables.put_verdict(row.clone());
            }
            return Ok(());
        }

        for row in rows {
            let duplicate = tables.by_ip.get(&row.ip_id).is_some_and(|ids| {
                ids.iter().filter_map(|id| tables.verdicts.get(id)).any(|existing| {
                    existing.created == row.created && existing.verdict == row.verdict
                })
            });
            if !duplicate {
                tables.insert_verdict(row.ip_id, row.verdict, row.created);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
