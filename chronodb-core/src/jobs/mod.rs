//! Background jobs
//!
//! Jobs do a bounded amount of work per call and never block waiting for
//! another job; a scheduler calls [`Job::try_run_once`] in a loop and backs
//! off when there is nothing to do.

mod apply;
mod check;
mod purge;

pub use apply::WalApplyJob;
pub use check::CheckWalTransactionsJob;
pub use purge::{PurgeStats, WalPurgeJob};

use std::time::Duration;

/// Outcome of one job step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Progress was made; call again
    DidWork,
    /// Nothing to do right now
    NoWork,
    /// Work exists but another holder owns the resource
    WouldBlock,
}

/// A unit of background work
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// Do at most one bounded step of work
    fn try_run_once(&self) -> JobStatus;
}

/// Apply job configuration
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Transactions applied per table before yielding
    pub max_txns_per_run: usize,
    /// Retries of a failing merge before the table is suspended
    pub max_merge_retries: u32,
    /// Untouched rows needed to split a part instead of rewriting it
    pub o3_split_min_rows: u64,
    /// Parts per partition before they are squashed
    pub max_split_parts: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_txns_per_run: crate::config::MAX_TXNS_PER_RUN,
            max_merge_retries: crate::config::MAX_MERGE_RETRIES,
            o3_split_min_rows: crate::config::O3_SPLIT_MIN_ROWS,
            max_split_parts: crate::config::MAX_SPLIT_PARTS,
        }
    }
}

/// Purge job configuration
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    pub interval: Duration,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::config::PURGE_INTERVAL_MS),
        }
    }
}
