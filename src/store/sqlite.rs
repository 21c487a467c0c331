//! SQLite verdict store.
//!
//! Blocking rusqlite calls run on tokio's blocking pool. One connection is
//! shared behind a mutex; SQLite serializes writers anyway.

use super::VerdictStore;
use crate::error::StorageError;
use crate::verdict::{
    now_millis, IpRecord, PlayerRecord, PostVpnResult, RawVerdict, Verdict, VerdictKind,
    VerdictRecord,
};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Table names derived from the configured prefix.
#[derive(Debug, Clone)]
struct Tables {
    ips: String,
    players: String,
    verdicts: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            ips: format!("{prefix}ips"),
            players: format!("{prefix}players"),
            verdicts: format!("{prefix}vpn_values"),
        }
    }

    fn schema(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {ips} (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               ip TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS {players} (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               uuid TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS {verdicts} (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               ip_id INTEGER NOT NULL REFERENCES {ips}(id) ON DELETE CASCADE,
               cascade_value INTEGER CHECK (cascade_value IN (0, 1) OR cascade_value IS NULL),
               consensus_value REAL CHECK (consensus_value BETWEEN 0.0 AND 1.0 OR consensus_value IS NULL),
               created INTEGER NOT NULL,
               CHECK ((cascade_value IS NULL) <> (consensus_value IS NULL))
             );
             CREATE INDEX IF NOT EXISTS {verdicts}_ip_created ON {verdicts} (ip_id, created);",
            ips = self.ips,
            players = self.players,
            verdicts = self.verdicts,
        )
    }
}

/// Verdict store backed by a SQLite file.
pub struct SqliteStore {
    name: String,
    tables: Tables,
    conn: Arc<Mutex<Option<Connection>>>,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(name: &str, path: &Path, prefix: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| {
            StorageError::Backend(format!("failed to open {}: {}", path.display(), e))
        })?;
        let store = Self::with_connection(name, conn, prefix)?;
        info!(store = %name, path = %path.display(), "SQLite verdict store opened");
        Ok(store)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory(name: &str, prefix: &str) -> Result<Self, StorageError> {
        Self::with_connection(name, Connection::open_in_memory()?, prefix)
    }

    fn with_connection(name: &str, conn: Connection, prefix: &str) -> Result<Self, StorageError> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StorageError::Backend(format!(
                "invalid table prefix '{}': only letters, digits and '_' are allowed",
                prefix
            )));
        }

        let tables = Tables::new(prefix);
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(&tables.schema())?;

        Ok(Self {
            name: name.to_string(),
            tables,
            conn: Arc::new(Mutex::new(Some(conn))),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Tables) -> Result<T, StorageError> + Send + 'static,
    {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let conn = self.conn.clone();
        let tables = self.tables.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".to_string()))?;
            let conn = guard.as_mut().ok_or(StorageError::Closed)?;
            f(conn, &tables)
        })
        .await?
    }
}

fn intern_ip(tx: &Transaction<'_>, tables: &Tables, ip: &str) -> Result<i64, StorageError> {
    tx.execute(
        &format!("INSERT OR IGNORE INTO {} (ip) VALUES (?1)", tables.ips),
        params![ip],
    )?;
    Ok(tx.query_row(
        &format!("SELECT id FROM {} WHERE ip = ?1", tables.ips),
        params![ip],
        |row| row.get(0),
    )?)
}

fn insert_verdict(
    tx: &Transaction<'_>,
    tables: &Tables,
    id: Option<i64>,
    ip_id: i64,
    verdict: Verdict,
    created: i64,
) -> Result<i64, StorageError> {
    let (cascade, consensus) = verdict.to_columns();
    tx.execute(
        &format!(
            "INSERT INTO {} (id, ip_id, cascade_value, consensus_value, created) VALUES (?1, ?2, ?3, ?4, ?5)",
            tables.verdicts
        ),
        params![id, ip_id, cascade, consensus, created],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Newest row for `ip`, optionally limited to one policy, if created at or
/// after `oldest`.
fn latest_verdict(
    conn: &Connection,
    tables: &Tables,
    ip: String,
    kind: Option<VerdictKind>,
    oldest: i64,
) -> Result<Option<VerdictRecord>, StorageError> {
    let filter = match kind {
        None => "",
        Some(VerdictKind::Cascade) => "AND v.cascade_value IS NOT NULL",
        Some(VerdictKind::Consensus) => "AND v.consensus_value IS NOT NULL",
    };
    let row = conn
        .query_row(
            &format!(
                "SELECT v.id, v.ip_id, v.cascade_value, v.consensus_value, v.created
                 FROM {verdicts} v JOIN {ips} i ON i.id = v.ip_id
                 WHERE i.ip = ?1 {filter}
                 ORDER BY v.created DESC, v.id DESC
                 LIMIT 1",
                verdicts = tables.verdicts,
                ips = tables.ips,
                filter = filter,
            ),
            params![ip],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<bool>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((id, ip_id, cascade, consensus, created)) if created >= oldest => {
            Ok(Some(VerdictRecord {
                id,
                ip_id,
                ip,
                verdict: decode_verdict(id, cascade, consensus)?,
                created,
            }))
        }
        _ => Ok(None),
    }
}

fn decode_verdict(id: i64, cascade: Option<bool>, consensus: Option<f64>) -> Result<Verdict, StorageError> {
    Verdict::from_columns(cascade, consensus)
        .ok_or_else(|| StorageError::Corrupt(format!("verdict {} has invalid columns", id)))
}

#[async_trait]
impl VerdictStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ip_id(&self, ip: &str) -> Result<i64, StorageError> {
        let ip = ip.to_string();
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            let id = intern_ip(&tx, tables, &ip)?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn player_id(&self, player: Uuid) -> Result<i64, StorageError> {
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            let uuid = player.to_string();
            tx.execute(
                &format!("INSERT OR IGNORE INTO {} (uuid) VALUES (?1)", tables.players),
                params![uuid],
            )?;
            let id = tx.query_row(
                &format!("SELECT id FROM {} WHERE uuid = ?1", tables.players),
                params![uuid],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn get_by_ip(
        &self,
        ip: &str,
        max_age_millis: i64,
    ) -> Result<Option<VerdictRecord>, StorageError> {
        let ip = ip.to_string();
        let oldest = now_millis().saturating_sub(max_age_millis);
        self.with_conn(move |conn, tables| latest_verdict(conn, tables, ip, None, oldest))
            .await
    }

    async fn get_by_ip_kind(
        &self,
        ip: &str,
        kind: VerdictKind,
        max_age_millis: i64,
    ) -> Result<Option<VerdictRecord>, StorageError> {
        let ip = ip.to_string();
        let oldest = now_millis().saturating_sub(max_age_millis);
        self.with_conn(move |conn, tables| latest_verdict(conn, tables, ip, Some(kind), oldest))
            .await
    }

    async fn post(&self, ip: &str, verdict: Verdict) -> Result<PostVpnResult, StorageError> {
        let ip = ip.to_string();
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            let ip_id = intern_ip(&tx, tables, &ip)?;
            let created = now_millis();
            let id = insert_verdict(&tx, tables, None, ip_id, verdict, created)?;
            tx.commit()?;

            Ok(PostVpnResult {
                id,
                ip_id,
                ip,
                verdict,
                created,
                fresh: true,
            })
        })
        .await
    }

    async fn apply_replicated(
        &self,
        origin: &str,
        ip: &str,
        verdict: Verdict,
        created: i64,
    ) -> Result<bool, StorageError> {
        let ip = ip.to_string();
        let origin = origin.to_string();
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            let ip_id = intern_ip(&tx, tables, &ip)?;
            let latest: Option<i64> = tx.query_row(
                &format!("SELECT MAX(created) FROM {} WHERE ip_id = ?1", tables.verdicts),
                params![ip_id],
                |row| row.get(0),
            )?;

            if latest.is_some_and(|latest| latest >= created) {
                debug!(ip = %ip, origin = %origin, "Replicated verdict is not newer, skipping");
                // Interning alone is harmless; keep it
                tx.commit()?;
                return Ok(false);
            }

            insert_verdict(&tx, tables, None, ip_id, verdict, created)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn dump_ips(&self, offset: u64, size: usize) -> Result<Vec<IpRecord>, StorageError> {
        self.with_conn(move |conn, tables| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, ip FROM {} ORDER BY id LIMIT ?1 OFFSET ?2",
                tables.ips
            ))?;
            let rows = stmt
                .query_map(params![size as i64, offset as i64], |row| {
                    Ok(IpRecord {
                        id: row.get(0)?,
                        ip: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn load_ips(&self, ips: &[IpRecord], truncate: bool) -> Result<(), StorageError> {
        let ips = ips.to_vec();
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            if truncate {
                tx.execute(&format!("DELETE FROM {}", tables.verdicts), [])?;
                tx.execute(&format!("DELETE FROM {}", tables.ips), [])?;
            }
            for record in &ips {
                let known: Option<i64> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE ip = ?1", tables.ips),
                        params![record.ip],
                        |row| row.get(0),
                    )
                    .optional()?;
                if known.is_some() {
                    continue;
                }
                let taken: Option<i64> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id = ?1", tables.ips),
                        params![record.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let id = if taken.is_some() || record.id < 1 {
                    None
                } else {
                    Some(record.id)
                };
                tx.execute(
                    &format!("INSERT INTO {} (id, ip) VALUES (?1, ?2)", tables.ips),
                    params![id, record.ip],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn dump_players(
        &self,
        offset: u64,
        size: usize,
    ) -> Result<Vec<PlayerRecord>, StorageError> {
        self.with_conn(move |conn, tables| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, uuid FROM {} ORDER BY id LIMIT ?1 OFFSET ?2",
                tables.players
            ))?;
            let rows = stmt
                .query_map(params![size as i64, offset as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, uuid)| -> Result<PlayerRecord, StorageError> {
                    let player = Uuid::parse_str(&uuid).map_err(|e| {
                        StorageError::Corrupt(format!("player {} has invalid uuid: {}", id, e))
                    })?;
                    Ok(PlayerRecord { id, player })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn load_players(
        &self,
        players: &[PlayerRecord],
        truncate: bool,
    ) -> Result<(), StorageError> {
        let players = players.to_vec();
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            if truncate {
                tx.execute(&format!("DELETE FROM {}", tables.players), [])?;
            }
            for record in &players {
                let uuid = record.player.to_string();
                let known: Option<i64> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE uuid = ?1", tables.players),
                        params![uuid],
                        |row| row.get(0),
                    )
                    .optional()?;
                if known.is_some() {
                    continue;
                }
                let taken: Option<i64> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id = ?1", tables.players),
                        params![record.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let id = if taken.is_some() || record.id < 1 {
                    None
                } else {
                    Some(record.id)
                };
                tx.execute(
                    &format!("INSERT INTO {} (id, uuid) VALUES (?1, ?2)", tables.players),
                    params![id, uuid],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn dump_verdicts(
        &self,
        offset: u64,
        size: usize,
    ) -> Result<Vec<RawVerdict>, StorageError> {
        self.with_conn(move |conn, tables| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, ip_id, cascade_value, consensus_value, created FROM {} ORDER BY id LIMIT ?1 OFFSET ?2",
                tables.verdicts
            ))?;
            let rows = stmt
                .query_map(params![size as i64, offset as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<bool>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, ip_id, cascade, consensus, created)| -> Result<RawVerdict, StorageError> {
                    Ok(RawVerdict {
                        id,
                        ip_id,
                        verdict: decode_verdict(id, cascade, consensus)?,
                        created,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn load_verdicts(
        &self,
        rows: &[RawVerdict],
        truncate: bool,
    ) -> Result<(), StorageError> {
        let rows = rows.to_vec();
        self.with_conn(move |conn, tables| {
            let tx = conn.transaction()?;
            if truncate {
                tx.execute(&format!("DELETE FROM {}", tables.verdicts), [])?;
            }
            for row in &rows {
                let ip_known: Option<i64> = tx
                    .query_row(
                        &format!("SELECT id FROM {} WHERE id = ?1", tables.ips),
                        params![row.ip_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if ip_known.is_none() {
                    return Err(StorageError::Integrity(format!(
                        "verdict {} references unknown ip {}",
                        row.id, row.ip_id
                    )));
                }

                if truncate {
                    insert_verdict(&tx, tables, Some(row.id), row.ip_id, row.verdict, row.created)?;
                    continue;
                }

                let (cascade, consensus) = row.verdict.to_columns();
                let duplicate: Option<i64> = tx
                    .query_row(
                        &format!(
                            "SELECT id FROM {} WHERE ip_id = ?1 AND created = ?2
                             AND cascade_value IS ?3 AND consensus_value IS ?4 LIMIT 1",
                            tables.verdicts
                        ),
                        params![row.ip_id, row.created, cascade, consensus],
                        |r| r.get(0),
                    )
                    .optional()?;
                if duplicate.is_none() {
                    insert_verdict(&tx, tables, None, row.ip_id, row.verdict, row.created)?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let conn = self.conn.clone();
        let closed = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = conn.lock() {
                guard.take();
            }
        })
        .await;
        if closed.is_ok() {
            info!(store = %self.name, "SQLite verdict store closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
