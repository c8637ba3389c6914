//! Run coordinator.
//!
//! Resolves the selected targets, keeps those whose device is attached and
//! dispatches the requested operations in a fixed order:
//!   import -> backup -> scrub -> export -> destroy -> remove
//! Everything runs in the caller's thread; the caller holds the run lock.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use log::{error, info};
use std::path::PathBuf;

use crate::approve::Approver;
use crate::backup::{BackupOptions, BackupReport, Orchestrator};
use crate::config::{BackupTarget, RunConfig};
use crate::decommission::{destroy_targets, remove_targets, RemoveReport};
use crate::scrub::{ScrubReport, ScrubSupervisor};
use crate::volume::{bring_online, take_offline, VolumeOps};
use crate::zfs::PoolOps;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operations {
    pub import: bool,
    pub export: bool,
    pub backup: bool,
    pub scrub: bool,
    pub destroy: bool,
    pub remove: bool,
}

impl Operations {
    pub fn any(&self) -> bool {
        self.import || self.export || self.backup || self.scrub || self.destroy || self.remove
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Target pools to act on; empty = every registered target.
    pub selected: Vec<String>,
    pub ops: Operations,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub present: Vec<String>,
    pub backup: Option<BackupReport>,
    pub scrub: Option<ScrubReport>,
    pub removed: Option<RemoveReport>,
    /// (pool, message) for import/export/destroy failures.
    pub failures: Vec<(String, String)>,
}

impl RunReport {
    /// Every pool that failed anywhere in the run, first occurrence order.
    pub fn error_set(&self) -> Vec<&str> {
        let mut set: Vec<&str> = Vec::new();
        let backup = self.backup.iter().flat_map(|b| b.failed());
        let scrub = self.scrub.iter().flat_map(|s| s.failed());
        let other = self.failures.iter().map(|(p, _)| p.as_str());
        for p in backup.chain(scrub).chain(other) {
            if !set.contains(&p) {
                set.push(p);
            }
        }
        set
    }

    pub fn is_success(&self) -> bool {
        self.error_set().is_empty()
    }
}

pub struct Coordinator<'a> {
    pools: &'a dyn PoolOps,
    volumes: &'a dyn VolumeOps,
    cfg: &'a mut RunConfig,
    /// Where the registry is persisted after remove; None = keep in memory.
    registry_path: Option<PathBuf>,
    today: NaiveDate,
}

impl<'a> Coordinator<'a> {
    pub fn new(pools: &'a dyn PoolOps, volumes: &'a dyn VolumeOps, cfg: &'a mut RunConfig) -> Self {
        Self {
            pools,
            volumes,
            cfg,
            registry_path: None,
            today: Local::now().date_naive(),
        }
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    fn selected_targets(&self, selected: &[String]) -> Result<Vec<BackupTarget>> {
        let reg = &self.cfg.registry;
        if selected.is_empty() {
            return Ok(reg.backup_disks.clone());
        }
        selected
            .iter()
            .map(|name| {
                reg.target(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("'{}' is not a registered backup pool", name))
            })
            .collect()
    }

    /// Execute `req`. `approver` is required when a backup is requested;
    /// `confirm` answers the destroy/remove safety questions.
    pub fn execute(
        &mut self,
        req: &RunRequest,
        approver: Option<&mut dyn Approver>,
        confirm: &mut dyn FnMut(&str) -> bool,
    ) -> Result<RunReport> {
        let selected = self.selected_targets(&req.selected)?;
        let present: Vec<&BackupTarget> = selected.iter().filter(|t| self.volumes.is_present(t)).collect();
        let mut report = RunReport {
            present: present.iter().map(|t| t.zpool.clone()).collect(),
            ..RunReport::default()
        };

        if present.is_empty() {
            info!("no backup disk present");
        } else {
            info!("present backup disks: {}", report.present.join(" "));
        }

        if req.ops.import {
            for t in &present {
                if let Err(e) = bring_online(self.pools, self.volumes, t) {
                    error!("import: {}: {:#}", t.zpool, e);
                    report.failures.push((t.zpool.clone(), format!("import: {:#}", e)));
                }
            }
        }

        if req.ops.backup && !present.is_empty() {
            let approver = approver.ok_or_else(|| anyhow!("backup requested without an approval strategy"))?;
            let opts = BackupOptions::new(self.today).keep_online(req.ops.scrub);
            let mut orch = Orchestrator::new(
                self.pools,
                self.volumes,
                self.cfg.source_pool(),
                self.cfg.registry.target_names(),
                approver,
                opts,
            );
            report.backup = Some(orch.run(&present));
        }

        if req.ops.scrub && !present.is_empty() {
            let skip: Vec<String> = report.error_set().into_iter().map(str::to_string).collect();
            let skip_refs: Vec<&str> = skip.iter().map(String::as_str).collect();
            let supervisor = ScrubSupervisor::new(self.pools, self.volumes)
                .with_cadence(self.cfg.scrub_first_check_delay, self.cfg.scrub_poll_interval);
            report.scrub = Some(supervisor.run(&present, &skip_refs));
        }

        if req.ops.export {
            for t in &present {
                if let Err(e) = take_offline(self.pools, self.volumes, t) {
                    error!("export: {}: {:#}", t.zpool, e);
                    report.failures.push((t.zpool.clone(), format!("export: {:#}", e)));
                }
            }
        }

        let mut to_remove: Vec<String> = Vec::new();
        if req.ops.destroy && !present.is_empty() {
            if confirm("Do you REALLY want to destroy all these pools, remove them from config and delete snapshots? Type uppercase 'yes': ") {
                let destroyed = destroy_targets(self.volumes, &present);
                let failed: Vec<&str> = present
                    .iter()
                    .map(|t| t.zpool.as_str())
                    .filter(|p| !destroyed.iter().any(|d| d == p))
                    .collect();
                if failed.is_empty() {
                    to_remove = destroyed;
                } else {
                    for p in &failed {
                        report.failures.push((p.to_string(), "destroy failed".to_string()));
                    }
                    if confirm(&format!(
                        "The following disk(s) failed to destroy: {}. Remove them anyway? Type uppercase 'yes': ",
                        failed.join(" ")
                    )) {
                        to_remove = report.present.clone();
                    } else {
                        to_remove = destroyed;
                    }
                }
            } else {
                info!("destroy: skipped");
            }
        } else if req.ops.remove {
            let names: Vec<String> = selected.iter().map(|t| t.zpool.clone()).collect();
            if !names.is_empty()
                && confirm("Do you REALLY want to remove all these pools from config and delete snapshots? Type uppercase 'yes': ")
            {
                to_remove = names;
            } else {
                info!("remove: skipped");
            }
        }

        if !to_remove.is_empty() {
            let removed = remove_targets(self.pools, &mut self.cfg.registry, &to_remove)?;
            if !removed.removed.is_empty() {
                if let Some(path) = &self.registry_path {
                    self.cfg
                        .registry
                        .save(path)
                        .with_context(|| format!("save registry {}", path.display()))?;
                }
            }
            report.removed = Some(removed);
        }

        Ok(report)
    }
}
