//! Scrub supervisor.
//!
//! Starts an integrity scrub on every eligible target, then polls all of
//! them from one thread until none is running. A pool leaves the polling set
//! (and goes offline) as soon as its scrub is terminal.
//!
//! Cadence: the first status check happens after `first_check_delay`, later
//! checks every `poll_interval` (both from RunConfig, 60 s by default).

use log::{error, info, warn};
use std::fmt;
use std::time::Duration;

use crate::config::BackupTarget;
use crate::metrics::{record_scrub_failed, record_scrub_started};
use crate::volume::{bring_online, take_offline, VolumeOps};
use crate::zfs::{PoolOps, ScrubState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubStatus {
    Running,
    CompletedHealthy,
    /// Scrub finished but the pool reports problems (tool report attached).
    CompletedUnhealthy(String),
    Aborted,
    /// Could not start or could not read the status.
    Error(String),
}

impl ScrubStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScrubStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ScrubStatus::CompletedUnhealthy(_) | ScrubStatus::Aborted | ScrubStatus::Error(_)
        )
    }
}

impl fmt::Display for ScrubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrubStatus::Running => write!(f, "running"),
            ScrubStatus::CompletedHealthy => write!(f, "completed-healthy"),
            ScrubStatus::CompletedUnhealthy(r) => write!(f, "completed-unhealthy:\n{}", r),
            ScrubStatus::Aborted => write!(f, "aborted"),
            ScrubStatus::Error(e) => write!(f, "error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubJob {
    pub pool: String,
    pub status: ScrubStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubReport {
    pub jobs: Vec<ScrubJob>,
}

impl ScrubReport {
    pub fn failed(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.status.is_failure())
            .map(|j| j.pool.as_str())
            .collect()
    }

    pub fn status(&self, pool: &str) -> Option<&ScrubStatus> {
        self.jobs.iter().find(|j| j.pool == pool).map(|j| &j.status)
    }
}

pub struct ScrubSupervisor<'a> {
    pools: &'a dyn PoolOps,
    volumes: &'a dyn VolumeOps,
    first_check_delay: Duration,
    poll_interval: Duration,
}

impl<'a> ScrubSupervisor<'a> {
    pub fn new(pools: &'a dyn PoolOps, volumes: &'a dyn VolumeOps) -> Self {
        Self {
            pools,
            volumes,
            first_check_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_cadence(mut self, first_check_delay: Duration, poll_interval: Duration) -> Self {
        self.first_check_delay = first_check_delay;
        self.poll_interval = poll_interval;
        self
    }

    /// Scrub `targets` except those whose pool is listed in `skip` (the run's
    /// error set). Returns one job per scrubbed or attempted target.
    pub fn run(&self, targets: &[&BackupTarget], skip: &[&str]) -> ScrubReport {
        let mut report = ScrubReport::default();
        let mut polling: Vec<(usize, &BackupTarget)> = Vec::new();

        info!("scrub: starting scrub of pool(s)");
        for target in targets {
            if skip.contains(&target.zpool.as_str()) {
                info!("scrub: skipping {} because of previous errors", target.zpool);
                continue;
            }
            let mut status = self.start(target);
            if status.is_terminal() {
                if let Err(e) = self.offline(target) {
                    status = match status {
                        ScrubStatus::Error(msg) => ScrubStatus::Error(format!("{}; offline: {}", msg, e)),
                        _ => ScrubStatus::Error(e),
                    };
                }
                record_scrub_failed();
            } else {
                polling.push((report.jobs.len(), *target));
            }
            report.jobs.push(ScrubJob {
                pool: target.zpool.clone(),
                status,
            });
        }

        if polling.is_empty() {
            return report;
        }

        info!("scrub: waiting for {} scrub(s) to complete", polling.len());
        std::thread::sleep(self.first_check_delay);
        loop {
            polling.retain(|&(idx, target)| {
                let status = self.check(&target.zpool);
                if !status.is_terminal() {
                    return true;
                }
                let status = match self.offline(target) {
                    Ok(()) => status,
                    Err(e) if !status.is_failure() => ScrubStatus::Error(e),
                    Err(_) => status,
                };
                if status.is_failure() {
                    error!("scrub: failed for {}: {}", target.zpool, status);
                    record_scrub_failed();
                } else {
                    info!("scrub: succeeded for {}", target.zpool);
                }
                report.jobs[idx].status = status;
                false
            });
            if polling.is_empty() {
                break;
            }
            std::thread::sleep(self.poll_interval);
        }
        report
    }

    fn start(&self, target: &BackupTarget) -> ScrubStatus {
        if let Err(e) = bring_online(self.pools, self.volumes, target) {
            error!("scrub: could not bring {} online: {:#}", target.zpool, e);
            return ScrubStatus::Error(format!("{:#}", e));
        }
        match self.pools.start_scrub(&target.zpool) {
            Ok(()) => {
                info!("scrub: started scrub of pool {}", target.zpool);
                record_scrub_started();
                ScrubStatus::Running
            }
            Err(e) => {
                error!("scrub: failed to start scrub of pool {}: {}", target.zpool, e);
                ScrubStatus::Error(e.to_string())
            }
        }
    }

    fn check(&self, pool: &str) -> ScrubStatus {
        let state = match self.pools.scrub_state(pool) {
            Ok(s) => s,
            Err(e) => return ScrubStatus::Error(e.to_string()),
        };
        match state {
            ScrubState::InProgress => ScrubStatus::Running,
            ScrubState::Canceled => ScrubStatus::Aborted,
            ScrubState::Unknown(report) => {
                ScrubStatus::Error(format!("unexpected scrub status:\n{}", report))
            }
            ScrubState::Finished => match self.pools.pool_health(pool) {
                Ok(h) if h.healthy => ScrubStatus::CompletedHealthy,
                Ok(h) => ScrubStatus::CompletedUnhealthy(h.report),
                Err(e) => ScrubStatus::Error(e.to_string()),
            },
        }
    }

    fn offline(&self, target: &BackupTarget) -> Result<(), String> {
        take_offline(self.pools, self.volumes, target).map_err(|e| {
            warn!("scrub: could not take {} offline: {:#}", target.zpool, e);
            format!("{:#}", e)
        })
    }
}
