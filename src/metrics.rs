//! Lightweight process-wide metrics for a run.
//!
//! Atomic counters per subsystem:
//! - Snapshots (created / promoted / destroyed)
//! - Transfers (full / incremental / verification failures)
//! - Approval (requested / granted)
//! - Scrub (started / failed)

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Snapshots -----
static SNAPSHOTS_CREATED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_PROMOTED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_DESTROYED: AtomicU64 = AtomicU64::new(0);

// ----- Transfers -----
static TRANSFERS_FULL: AtomicU64 = AtomicU64::new(0);
static TRANSFERS_INCREMENTAL: AtomicU64 = AtomicU64::new(0);
static VERIFY_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Approval -----
static APPROVALS_REQUESTED: AtomicU64 = AtomicU64::new(0);
static APPROVALS_GRANTED: AtomicU64 = AtomicU64::new(0);

// ----- Scrub -----
static SCRUBS_STARTED: AtomicU64 = AtomicU64::new(0);
static SCRUBS_FAILED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub snapshots_created: u64,
    pub snapshots_promoted: u64,
    pub snapshots_destroyed: u64,

    pub transfers_full: u64,
    pub transfers_incremental: u64,
    pub verify_failures: u64,

    pub approvals_requested: u64,
    pub approvals_granted: u64,

    pub scrubs_started: u64,
    pub scrubs_failed: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapshots: created={} promoted={} destroyed={}; \
             transfers: full={} incremental={} verify_failures={}; \
             approvals: requested={} granted={}; \
             scrubs: started={} failed={}",
            self.snapshots_created,
            self.snapshots_promoted,
            self.snapshots_destroyed,
            self.transfers_full,
            self.transfers_incremental,
            self.verify_failures,
            self.approvals_requested,
            self.approvals_granted,
            self.scrubs_started,
            self.scrubs_failed,
        )
    }
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        snapshots_created: SNAPSHOTS_CREATED.load(Ordering::Relaxed),
        snapshots_promoted: SNAPSHOTS_PROMOTED.load(Ordering::Relaxed),
        snapshots_destroyed: SNAPSHOTS_DESTROYED.load(Ordering::Relaxed),
        transfers_full: TRANSFERS_FULL.load(Ordering::Relaxed),
        transfers_incremental: TRANSFERS_INCREMENTAL.load(Ordering::Relaxed),
        verify_failures: VERIFY_FAILURES.load(Ordering::Relaxed),
        approvals_requested: APPROVALS_REQUESTED.load(Ordering::Relaxed),
        approvals_granted: APPROVALS_GRANTED.load(Ordering::Relaxed),
        scrubs_started: SCRUBS_STARTED.load(Ordering::Relaxed),
        scrubs_failed: SCRUBS_FAILED.load(Ordering::Relaxed),
    }
}

pub fn reset_metrics() {
    for c in [
        &SNAPSHOTS_CREATED,
        &SNAPSHOTS_PROMOTED,
        &SNAPSHOTS_DESTROYED,
        &TRANSFERS_FULL,
        &TRANSFERS_INCREMENTAL,
        &VERIFY_FAILURES,
        &APPROVALS_REQUESTED,
        &APPROVALS_GRANTED,
        &SCRUBS_STARTED,
        &SCRUBS_FAILED,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}

// ----- recorders -----

pub fn record_snapshot_created() {
    SNAPSHOTS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_promoted() {
    SNAPSHOTS_PROMOTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_destroyed() {
    SNAPSHOTS_DESTROYED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_transfer(incremental: bool) {
    if incremental {
        TRANSFERS_INCREMENTAL.fetch_add(1, Ordering::Relaxed);
    } else {
        TRANSFERS_FULL.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_verify_failure() {
    VERIFY_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_approval(granted: bool) {
    APPROVALS_REQUESTED.fetch_add(1, Ordering::Relaxed);
    if granted {
        APPROVALS_GRANTED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_scrub_started() {
    SCRUBS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_scrub_failed() {
    SCRUBS_FAILED.fetch_add(1, Ordering::Relaxed);
}
