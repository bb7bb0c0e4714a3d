//! WAL purge job

use super::{Job, JobStatus};
use crate::engine::Engine;
use crate::table::TableHandle;
use crate::wal::{list_segments, list_wals, segment_dir, wal_dir};
use crate::{ChronoError, Result, SegmentId, TxnId, WalId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// What one purge pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub segments: usize,
    pub wal_dirs: usize,
    pub partition_dirs: usize,
}

impl PurgeStats {
    fn is_empty(&self) -> bool {
        self.segments == 0 && self.wal_dirs == 0 && self.partition_dirs == 0
    }
}

/// Reclaims applied WAL segments and superseded partition versions.
///
/// A segment is deleted only when it is not open by a live writer and every
/// transaction referencing it is at or below the table's durable commit
/// version. Tables whose apply lock is held are skipped for the pass.
pub struct WalPurgeJob {
    engine: Arc<Engine>,
    interval: Duration,
    next_run: Mutex<Instant>,
    run_lock: Arc<Mutex<()>>,
}

impl WalPurgeJob {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        let run_lock = engine.purge_run_lock();
        Self {
            engine,
            interval,
            next_run: Mutex::new(Instant::now() + interval / 2),
            run_lock,
        }
    }

    /// Run a pass over every table now, ignoring the interval
    pub fn run(&self) -> Option<PurgeStats> {
        let _running = self.run_lock.try_lock()?;
        let mut total = PurgeStats::default();
        for table in self.engine.all_tables() {
            match self.purge_table(&table) {
                Ok(Some(stats)) => {
                    total.segments += stats.segments;
                    total.wal_dirs += stats.wal_dirs;
                    total.partition_dirs += stats.partition_dirs;
                }
                Ok(None) => debug!("Purge skipped busy table {}", table.name()),
                Err(e) => error!("Purge of table {} failed: {}", table.name(), e),
            }
        }
        Some(total)
    }

    /// Purge one table, `None` if its apply lock is held
    pub fn purge_table(&self, table: &TableHandle) -> Result<Option<PurgeStats>> {
        let Some(_guard) = self.engine.locks().try_acquire(table.id()) else {
            return Ok(None);
        };
        let visibility = self.engine.table_visibility(table.id())?;
        let mut stats = PurgeStats::default();

        let watermark = visibility.version();
        let segment_txns = table.sequencer().segment_txns();
        self.purge_segments(table, watermark, &segment_txns, &mut stats)?;

        // superseded partition versions, once no reader can still see them
        let state = visibility.state();
        if visibility.oldest_pinned().map_or(true, |pinned| pinned >= state.txn) {
            let referenced = state.referenced_dirs();
            for entry in fs::read_dir(table.dir())? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if is_partition_dir(&name) && !referenced.contains(&name) {
                    fs::remove_dir_all(entry.path())?;
                    stats.partition_dirs += 1;
                }
            }
        }

        if !stats.is_empty() {
            info!(
                "Purged table {}: {} segments, {} wal dirs, {} partition versions",
                table.name(),
                stats.segments,
                stats.wal_dirs,
                stats.partition_dirs
            );
        }
        Ok(Some(stats))
    }

    /// Delete applied segments that no writer holds open.
    ///
    /// `segment_txns` may be older than the sequencer: every candidate is
    /// checked again before it is removed.
    fn purge_segments(
        &self,
        table: &TableHandle,
        watermark: TxnId,
        segment_txns: &HashMap<(WalId, SegmentId), TxnId>,
        stats: &mut PurgeStats,
    ) -> Result<()> {
        let on_disk = list_segments(table.dir())?;
        table.with_active_segments(|active| -> Result<()> {
            for (wal_id, segment_id) in on_disk {
                if active.get(&wal_id) == Some(&Some(segment_id)) {
                    continue;
                }
                let max_txn = segment_txns.get(&(wal_id, segment_id)).copied();
                if max_txn.is_some_and(|txn| txn > watermark) {
                    continue;
                }

                if let Err(e) = self.verify(table, wal_id, segment_id, watermark) {
                    error!("Skipping purge: {}", e);
                    continue;
                }
                fs::remove_dir_all(segment_dir(table.dir(), wal_id, segment_id))?;
                debug!(
                    "Purged WAL segment {}/{} of {} (max txn {:?})",
                    wal_id,
                    segment_id,
                    table.name(),
                    max_txn
                );
                stats.segments += 1;
            }

            for wal_id in list_wals(table.dir())? {
                if active.contains_key(&wal_id) {
                    continue;
                }
                let dir = wal_dir(table.dir(), wal_id);
                if fs::read_dir(&dir)?.next().is_none() {
                    fs::remove_dir(&dir)?;
                    stats.wal_dirs += 1;
                }
            }
            Ok(())
        })
    }

    /// Re-check a deletion candidate against the latest sequencer state
    fn verify(
        &self,
        table: &TableHandle,
        wal_id: WalId,
        segment_id: SegmentId,
        watermark: TxnId,
    ) -> Result<()> {
        let max_txn = table
            .sequencer()
            .segment_txns()
            .get(&(wal_id, segment_id))
            .copied()
            .unwrap_or(0);
        if max_txn > watermark {
            return Err(ChronoError::PurgeRace {
                segment: format!("{}/wal{}/{}", table.name(), wal_id, segment_id),
                max_txn,
                watermark,
            });
        }
        Ok(())
    }
}

/// `<name>.<txn>` directories hold partition versions
fn is_partition_dir(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(base, txn)| !base.is_empty() && txn.parse::<TxnId>().is_ok())
}

impl Job for WalPurgeJob {
    fn name(&self) -> &'static str {
        "wal-purge"
    }

    fn try_run_once(&self) -> JobStatus {
        {
            let mut next_run = self.next_run.lock();
            let now = Instant::now();
            if now < *next_run {
                return JobStatus::NoWork;
            }
            *next_run = now + self.interval;
        }
        match self.run() {
            None => JobStatus::WouldBlock,
            Some(stats) if stats.is_empty() => JobStatus::NoWork,
            Some(_) => JobStatus::DidWork,
        }
    }
}
