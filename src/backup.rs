//! Backup orchestrator: one state machine run per target, targets strictly
//! one after another.
//!
//! States:
//!   Start -> TempSnapshotCreated -> TargetOnline -> BaselineDiscovered
//!         -> NoDiffApproved | DiffApproved | DiffRejected
//!         -> Promoted -> TransferRunning -> Verified -> RetentionPruned -> Done
//!   any -> Failed (best-effort offline rollback, target recorded as failed)
//!
//! Invariants:
//! - the temporary snapshot is destroyed iff it was never promoted;
//! - once promoted it is the new approved baseline and survives any later failure;
//! - the destination is offline while waiting for approval;
//! - "what landed" is always re-read from the destination, never inferred
//!   from the source baseline or from the transfer exit status;
//! - after a verified transfer exactly one snapshot of the target remains on
//!   the source.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use std::fmt;

use crate::approve::{decide, ApprovalDecision, Approver, Verdict};
use crate::config::BackupTarget;
use crate::diff::{compute_diff, DiffSet};
use crate::error::ZfsError;
use crate::metrics::{
    record_snapshot_created, record_snapshot_destroyed, record_snapshot_promoted, record_transfer,
    record_verify_failure,
};
use crate::snapname::{all_matching, latest_matching, next_name, SnapshotName};
use crate::volume::{bring_online, take_offline, VolumeOps};
use crate::zfs::{PoolOps, TransferMode, TransferRequest};

/// Sentinel name of the working snapshot. Not time-stamped, so at most one
/// can exist on the source pool.
pub const TEMP_SNAPSHOT: &str = "TEMP_SNAPSHOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Start,
    TempSnapshotCreated,
    TargetOnline,
    BaselineDiscovered,
    NoDiffApproved,
    DiffApproved,
    DiffRejected,
    Promoted,
    TransferRunning,
    Verified,
    RetentionPruned,
    Done,
    Failed,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Calendar day used for the final snapshot name.
    pub today: NaiveDate,
    /// Leave successfully backed-up destinations online (a scrub follows).
    pub keep_online: bool,
}

impl BackupOptions {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            keep_online: false,
        }
    }

    pub fn keep_online(mut self, on: bool) -> Self {
        self.keep_online = on;
        self
    }
}

/// What the destination actually holds after a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub snapshot: String,
    /// Destination datasets lacking `snapshot`.
    pub missing: Vec<String>,
}

impl TransferOutcome {
    pub fn success(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    /// Last state reached before the failure.
    pub state: BackupState,
    /// Failing command / diagnostic chain.
    pub reason: String,
    /// Datasets missing the new snapshot (verification failures only).
    pub missing_datasets: Vec<String>,
    /// Promoted snapshot kept on the source despite the failure, if any.
    pub promoted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    BackedUp {
        snapshot: String,
        mode: TransferMode,
        pruned: Vec<String>,
        approval: ApprovalDecision,
    },
    /// Approval declined or timed out; nothing transferred, not an error.
    Omitted { approval: ApprovalDecision },
    Failed(TargetFailure),
}

impl TargetOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TargetOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: String,
    pub outcome: TargetOutcome,
}

/// Result of a backup pass over several targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub targets: Vec<TargetReport>,
}

impl BackupReport {
    /// Pools of the targets that failed (the run's error set).
    pub fn failed(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| t.outcome.is_failed())
            .map(|t| t.target.as_str())
            .collect()
    }

    pub fn backed_up(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| matches!(t.outcome, TargetOutcome::BackedUp { .. }))
            .map(|t| t.target.as_str())
            .collect()
    }

    /// Targets left out by the approval gate, with the verdict that did it.
    pub fn omitted(&self) -> Vec<(&str, Verdict)> {
        self.targets
            .iter()
            .filter_map(|t| match &t.outcome {
                TargetOutcome::Omitted { approval } => Some((t.target.as_str(), approval.verdict)),
                _ => None,
            })
            .collect()
    }

    pub fn outcome(&self, target: &str) -> Option<&TargetOutcome> {
        self.targets
            .iter()
            .find(|t| t.target == target)
            .map(|t| &t.outcome)
    }
}

// Mutable bookkeeping of one target pass.
struct TargetRun<'t> {
    target: &'t BackupTarget,
    state: BackupState,
    temp_pending: bool,
    promoted: Option<SnapshotName>,
    missing: Vec<String>,
}

impl<'t> TargetRun<'t> {
    fn new(target: &'t BackupTarget) -> Self {
        Self {
            target,
            state: BackupState::Start,
            temp_pending: false,
            promoted: None,
            missing: Vec::new(),
        }
    }

    fn enter(&mut self, state: BackupState) {
        debug!("backup[{}]: {} -> {}", self.target.zpool, self.state, state);
        self.state = state;
    }
}

pub struct Orchestrator<'a> {
    pools: &'a dyn PoolOps,
    volumes: &'a dyn VolumeOps,
    source_pool: &'a str,
    /// Every registered target: approval baselines are target-agnostic.
    all_targets: Vec<String>,
    approver: &'a mut dyn Approver,
    opts: BackupOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        pools: &'a dyn PoolOps,
        volumes: &'a dyn VolumeOps,
        source_pool: &'a str,
        all_targets: Vec<String>,
        approver: &'a mut dyn Approver,
        opts: BackupOptions,
    ) -> Self {
        Self {
            pools,
            volumes,
            source_pool,
            all_targets,
            approver,
            opts,
        }
    }

    /// Back up every target in order; one target's failure never stops the next.
    pub fn run(&mut self, targets: &[&BackupTarget]) -> BackupReport {
        let mut report = BackupReport::default();
        for target in targets {
            let outcome = self.backup_target(target);
            report.targets.push(TargetReport {
                target: target.zpool.clone(),
                outcome,
            });
        }
        report
    }

    pub fn backup_target(&mut self, target: &BackupTarget) -> TargetOutcome {
        info!(
            "backup: \"{}\" -> \"{}\"",
            self.source_pool, target.zpool
        );
        let mut run = TargetRun::new(target);

        let mut outcome = match self.drive(&mut run) {
            Ok(o) => o,
            Err(e) => {
                error!("backup[{}]: aborted in state {}: {:#}", target.zpool, run.state, e);
                if let Err(re) = take_offline(self.pools, self.volumes, target) {
                    warn!("backup[{}]: could not take destination offline: {:#}", target.zpool, re);
                }
                let failure = TargetFailure {
                    state: run.state,
                    reason: format!("{:#}", e),
                    missing_datasets: std::mem::take(&mut run.missing),
                    promoted: run.promoted.as_ref().map(|s| s.to_string()),
                };
                run.enter(BackupState::Failed);
                TargetOutcome::Failed(failure)
            }
        };

        if run.temp_pending {
            info!("backup[{}]: destroying unpromoted {}", target.zpool, TEMP_SNAPSHOT);
            match self.pools.destroy_snapshot(self.source_pool, TEMP_SNAPSHOT) {
                Ok(()) => {
                    record_snapshot_destroyed();
                    run.temp_pending = false;
                }
                Err(e) => {
                    error!("backup[{}]: could not destroy {}: {}", target.zpool, TEMP_SNAPSHOT, e);
                    if !outcome.is_failed() {
                        outcome = TargetOutcome::Failed(TargetFailure {
                            state: run.state,
                            reason: format!("destroy {}: {}", TEMP_SNAPSHOT, e),
                            missing_datasets: Vec::new(),
                            promoted: None,
                        });
                    }
                }
            }
        }
        outcome
    }

    fn drive(&mut self, run: &mut TargetRun<'_>) -> Result<TargetOutcome> {
        let target = run.target;
        let source = self.source_pool;

        // Start -> TempSnapshotCreated
        self.pools.create_snapshot(source, TEMP_SNAPSHOT)?;
        record_snapshot_created();
        run.temp_pending = true;
        run.enter(BackupState::TempSnapshotCreated);
        info!("backup[{}]: created {}@{}", target.zpool, source, TEMP_SNAPSHOT);

        // TempSnapshotCreated -> TargetOnline
        bring_online(self.pools, self.volumes, target)?;
        run.enter(BackupState::TargetOnline);
        let on_destination = latest_matching(self.pools, &target.zpool, &[target.zpool.as_str()])?;
        match &on_destination {
            Some(s) => info!("backup[{}]: latest snapshot on destination: {}", target.zpool, s),
            None => info!("backup[{}]: no snapshot on destination, first backup", target.zpool),
        }

        // approval may take hours: keep the destination offline meanwhile
        take_offline(self.pools, self.volumes, target)?;

        let baseline = latest_matching(self.pools, source, &self.all_targets)?;
        run.enter(BackupState::BaselineDiscovered);

        let diff = match &baseline {
            Some(b) => {
                info!("backup[{}]: latest approved snapshot: {}", target.zpool, b);
                compute_diff(self.pools, source, &b.to_string(), TEMP_SNAPSHOT)?
            }
            None => {
                warn!("backup[{}]: no approved snapshot on {}", target.zpool, source);
                DiffSet::no_baseline(source)
            }
        };

        let approval = decide(&mut *self.approver, &diff)?;
        if !approval.approved() {
            run.enter(BackupState::DiffRejected);
            info!("backup[{}]: omitting backup ({})", target.zpool, approval.verdict);
            run.enter(BackupState::Done);
            return Ok(TargetOutcome::Omitted { approval });
        }
        run.enter(if diff.is_empty() {
            BackupState::NoDiffApproved
        } else {
            BackupState::DiffApproved
        });

        // Promotion: from here on the snapshot is the approved baseline
        let name = next_name(self.pools, source, &target.zpool, self.opts.today)?;
        let snapshot = name.to_string();
        self.pools.rename_snapshot(source, TEMP_SNAPSHOT, &snapshot)?;
        run.temp_pending = false;
        run.promoted = Some(name);
        record_snapshot_promoted();
        run.enter(BackupState::Promoted);
        info!("backup[{}]: renamed {} -> {}", target.zpool, TEMP_SNAPSHOT, snapshot);

        // Promoted -> TransferRunning
        bring_online(self.pools, self.volumes, target)?;
        let health = self.pools.pool_health(&target.zpool)?;
        if !health.healthy {
            return Err(anyhow!("destination {} is not healthy:\n{}", target.zpool, health.report));
        }
        let mode = match &on_destination {
            None => TransferMode::Full,
            Some(prev) => TransferMode::Incremental {
                from: prev.to_string(),
            },
        };
        run.enter(BackupState::TransferRunning);
        info!("backup[{}]: {} transfer of {}", target.zpool, mode, snapshot);
        self.pools.send_receive(&TransferRequest {
            source_pool: source.to_string(),
            dest_pool: target.zpool.clone(),
            snapshot: snapshot.clone(),
            mode: mode.clone(),
        })?;
        record_transfer(matches!(mode, TransferMode::Incremental { .. }));

        // TransferRunning -> Verified
        let landed = verify_transfer(self.pools, &target.zpool, &snapshot)?;
        if !landed.success() {
            record_verify_failure();
            run.missing = landed.missing.clone();
            return Err(anyhow!(
                "snapshot {} missing on destination datasets: {}",
                snapshot,
                landed.missing.join(" ")
            ));
        }
        let health = self.pools.pool_health(&target.zpool)?;
        if !health.healthy {
            return Err(anyhow!(
                "destination {} is not healthy after transfer:\n{}",
                target.zpool,
                health.report
            ));
        }
        run.enter(BackupState::Verified);
        info!("backup[{}]: verified {} on every dataset", target.zpool, snapshot);

        // Verified -> RetentionPruned
        let pruned = prune_source(self.pools, source, &target.zpool, &snapshot)?;
        run.enter(BackupState::RetentionPruned);

        if !self.opts.keep_online {
            take_offline(self.pools, self.volumes, target)?;
        }
        run.enter(BackupState::Done);

        Ok(TargetOutcome::BackedUp {
            snapshot,
            mode,
            pruned,
            approval,
        })
    }
}

/// Re-read the destination: which datasets lack `snapshot`?
pub fn verify_transfer(pools: &dyn PoolOps, dest_pool: &str, snapshot: &str) -> Result<TransferOutcome> {
    let mut missing = Vec::new();
    for dataset in pools.list_datasets(dest_pool)? {
        match pools.check_snapshot(&dataset, snapshot) {
            Ok(()) => {}
            Err(ZfsError::NotFound { .. }) => missing.push(dataset),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(TransferOutcome {
        snapshot: snapshot.to_string(),
        missing,
    })
}

/// Destroy every snapshot of `target` on the source except `keep`.
pub fn prune_source(pools: &dyn PoolOps, source: &str, target: &str, keep: &str) -> Result<Vec<String>> {
    let mut pruned = Vec::new();
    for snap in all_matching(pools, source, &[target])? {
        let name = snap.to_string();
        if name == keep {
            continue;
        }
        info!("backup[{}]: deleting old snapshot {}", target, name);
        pools.destroy_snapshot(source, &name)?;
        record_snapshot_destroyed();
        pruned.push(name);
    }
    Ok(pruned)
}
