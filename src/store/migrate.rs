//! Copy every table from one store into another.

use super::VerdictStore;
use crate::error::StorageError;
use std::collections::HashMap;
use tracing::{debug, info};

/// Row counts copied by [`migrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub ips: usize,
    pub players: usize,
    pub verdicts: usize,
}

/// Copy IPs, players and verdicts from `from` into `to`, `page_size` rows at a time.
///
/// With `truncate` the target tables are cleared before the first page,
/// even when the source is empty. Without it the rows are merged, and any
/// IP that ends up with a different surrogate ID in the target has its
/// verdicts rewritten to point at the new ID.
pub async fn migrate(
    from: &dyn VerdictStore,
    to: &dyn VerdictStore,
    page_size: usize,
    truncate: bool,
) -> Result<MigrationReport, StorageError> {
    let page_size = page_size.max(1);
    let mut report = MigrationReport::default();

    info!(
        from = %from.name(),
        to = %to.name(),
        page_size,
        truncate,
        "Starting store migration"
    );

    // IP ID in the source -> IP ID in the target
    let mut remap: HashMap<i64, i64> = HashMap::new();
    let mut offset = 0u64;
    loop {
        let page = from.dump_ips(offset, page_size).await?;
        if offset == 0 || !page.is_empty() {
            to.load_ips(&page, truncate && offset == 0).await?;
        }
        for record in &page {
            remap.insert(record.id, to.ip_id(&record.ip).await?);
        }
        report.ips += page.len();
        offset += page.len() as u64;
        if page.len() < page_size {
            break;
        }
    }
    debug!(ips = report.ips, "Copied IPs");

    offset = 0;
    loop {
        let page = from.dump_players(offset, page_size).await?;
        if offset == 0 || !page.is_empty() {
            to.load_players(&page, truncate && offset == 0).await?;
        }
        report.players += page.len();
        offset += page.len() as u64;
        if page.len() < page_size {
            break;
        }
    }
    debug!(players = report.players, "Copied players");

    offset = 0;
    loop {
        let mut page = from.dump_verdicts(offset, page_size).await?;
        let fetched = page.len();
        for row in &mut page {
            row.ip_id = *remap.get(&row.ip_id).ok_or_else(|| {
                StorageError::Integrity(format!(
                    "verdict {} references ip {} missing from {}",
                    row.id,
                    row.ip_id,
                    from.name()
                ))
            })?;
        }
        if offset == 0 || !page.is_empty() {
            to.load_verdicts(&page, truncate && offset == 0).await?;
        }
        report.verdicts += fetched;
        offset += fetched as u64;
        if fetched < page_size {
            break;
        }
    }

    info!(
        ips = report.ips,
        players = report.players,
        verdicts = report.verdicts,
        "Store migration complete"
    );
    Ok(report)
}
