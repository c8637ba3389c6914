//! Target decommissioning: remove (snapshots + registry entry) and destroy
//! (container erase, then remove).
//!
//! A target leaves the registry only if every one of its snapshots on the
//! source could be deleted. The latest approved snapshot (over all targets)
//! is never deleted: it is the baseline of the next diff, so a target whose
//! snapshot holds it stays registered until another target has been backed up.

use anyhow::Result;
use log::{error, info, warn};

use crate::config::{BackupTarget, Registry};
use crate::metrics::record_snapshot_destroyed;
use crate::snapname::{all_matching, latest_matching};
use crate::volume::VolumeOps;
use crate::zfs::PoolOps;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveReport {
    /// Targets dropped from the registry.
    pub removed: Vec<String>,
    /// Targets kept because some snapshot could not (or must not) be deleted.
    pub kept: Vec<String>,
    pub deleted_snapshots: Vec<String>,
}

/// Delete the targets' snapshots on the source and drop them from `registry`.
/// The caller persists the registry.
pub fn remove_targets(pools: &dyn PoolOps, registry: &mut Registry, targets: &[String]) -> Result<RemoveReport> {
    let source = registry.pool_to_backup.clone();
    let latest_approved = latest_matching(pools, &source, &registry.target_names())?
        .map(|s| s.to_string());
    let mut report = RemoveReport::default();

    for pool in targets {
        info!("remove: '{}'", pool);
        let mut all_deleted = true;
        for snap in all_matching(pools, &source, &[pool.as_str()])? {
            let name = snap.to_string();
            if latest_approved.as_deref() == Some(name.as_str()) {
                warn!(
                    "remove: {} is the latest approved snapshot; back up another disk and remove again",
                    name
                );
                all_deleted = false;
                continue;
            }
            match pools.destroy_snapshot(&source, &name) {
                Ok(()) => {
                    info!("remove: deleted snapshot {}", name);
                    record_snapshot_destroyed();
                    report.deleted_snapshots.push(name);
                }
                Err(e) => {
                    error!("remove: could not delete snapshot {}: {}", name, e);
                    all_deleted = false;
                }
            }
        }

        if all_deleted && registry.remove_target(pool) {
            info!("remove: '{}' dropped from registry", pool);
            report.removed.push(pool.clone());
        } else {
            report.kept.push(pool.clone());
        }
    }
    Ok(report)
}

/// Erase the containers of `targets`; returns the pools that were destroyed.
pub fn destroy_targets(volumes: &dyn VolumeOps, targets: &[&BackupTarget]) -> Vec<String> {
    let mut destroyed = Vec::new();
    for t in targets {
        info!("destroy: '{}'", t.zpool);
        match volumes.erase(t) {
            Ok(()) => destroyed.push(t.zpool.clone()),
            Err(e) => error!("destroy: '{}' failed: {:#}", t.zpool, e),
        }
    }
    destroyed
}
