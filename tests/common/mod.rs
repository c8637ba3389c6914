#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

use zrotate::approve::{Approver, Verdict};
use zrotate::config::BackupTarget;
use zrotate::diff::DiffSet;
use zrotate::error::{ZfsError, ZfsResult};
use zrotate::volume::VolumeOps;
use zrotate::zfs::{
    ChangeKind, ChangeRecord, EntryKind, PoolHealth, PoolOps, ScrubState, TransferMode, TransferRequest,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("zrtest-{prefix}-{pid}-{t}-{id}"))
}

pub fn target(pool: &str) -> BackupTarget {
    BackupTarget {
        zpool: pool.to_string(),
        id: format!("ata-{pool}-part1"),
        luks: format!("{pool}-crypt"),
        luks_keyfile: format!("/etc/keys/{pool}.key"),
    }
}

pub fn modified(path: &str) -> ChangeRecord {
    ChangeRecord {
        change: ChangeKind::Modified,
        entry: EntryKind::File,
        timestamp: 1_700_000_000,
        path: path.to_string(),
        new_path: None,
    }
}

// ----- fake pools -----

#[derive(Default)]
struct PoolState {
    /// Datasets, root first.
    datasets: Vec<String>,
    /// dataset -> snapshot names, creation order.
    snaps: BTreeMap<String, Vec<String>>,
}

#[derive(Default)]
struct State {
    pools: BTreeMap<String, PoolState>,
    imported: HashSet<String>,
    diffs: HashMap<String, Vec<ChangeRecord>>,
    failures: HashSet<(String, String)>,
    unhealthy: HashMap<String, String>,
    /// Destination datasets that a transfer silently skips.
    skip_on_receive: HashSet<String>,
    scrub_states: HashMap<String, VecDeque<ScrubState>>,
    transfers: Vec<TransferRequest>,
    calls: Vec<String>,
}

/// In-memory pools: recursive snapshots, creation order, scripted failures.
#[derive(Default)]
pub struct FakePool {
    state: RefCell<State>,
}

fn pool_of(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

impl FakePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool with its root dataset and `children` (names relative to the root).
    pub fn add_pool(&self, pool: &str, children: &[&str]) {
        let mut st = self.state.borrow_mut();
        let mut ps = PoolState::default();
        ps.datasets.push(pool.to_string());
        for c in children {
            ps.datasets.push(format!("{pool}/{c}"));
        }
        for d in &ps.datasets {
            ps.snaps.insert(d.clone(), Vec::new());
        }
        st.pools.insert(pool.to_string(), ps);
    }

    /// Add a dataset that has none of the pool's existing snapshots.
    pub fn add_dataset(&self, dataset: &str) {
        let mut st = self.state.borrow_mut();
        if let Some(ps) = st.pools.get_mut(pool_of(dataset)) {
            ps.datasets.push(dataset.to_string());
            ps.snaps.insert(dataset.to_string(), Vec::new());
        }
    }

    /// Recursive snapshot without going through the trait (setup helper).
    pub fn seed_snapshot(&self, pool: &str, name: &str) {
        let mut st = self.state.borrow_mut();
        if let Some(ps) = st.pools.get_mut(pool) {
            for v in ps.snaps.values_mut() {
                v.push(name.to_string());
            }
        }
    }

    pub fn set_imported(&self, pool: &str, on: bool) {
        let mut st = self.state.borrow_mut();
        if on {
            st.imported.insert(pool.to_string());
        } else {
            st.imported.remove(pool);
        }
    }

    pub fn set_diff(&self, dataset: &str, changes: Vec<ChangeRecord>) {
        self.state.borrow_mut().diffs.insert(dataset.to_string(), changes);
    }

    /// Make `op` fail with a fatal error for `key` (op-specific, e.g. "pool@snap").
    pub fn fail(&self, op: &str, key: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert((op.to_string(), key.to_string()));
    }

    /// Undo a scripted failure.
    pub fn recover(&self, op: &str, key: &str) {
        self.state
            .borrow_mut()
            .failures
            .remove(&(op.to_string(), key.to_string()));
    }

    pub fn set_unhealthy(&self, pool: &str, report: &str) {
        self.state
            .borrow_mut()
            .unhealthy
            .insert(pool.to_string(), report.to_string());
    }

    pub fn set_healthy(&self, pool: &str) {
        self.state.borrow_mut().unhealthy.remove(pool);
    }

    pub fn skip_on_receive(&self, dest_dataset: &str) {
        self.state
            .borrow_mut()
            .skip_on_receive
            .insert(dest_dataset.to_string());
    }

    /// States returned by successive `scrub_state` calls; Finished once drained.
    pub fn script_scrub(&self, pool: &str, states: Vec<ScrubState>) {
        self.state
            .borrow_mut()
            .scrub_states
            .insert(pool.to_string(), states.into());
    }

    pub fn snapshots(&self, dataset: &str) -> Vec<String> {
        let st = self.state.borrow();
        st.pools
            .get(pool_of(dataset))
            .and_then(|ps| ps.snaps.get(dataset))
            .cloned()
            .unwrap_or_default()
    }

    pub fn imported(&self, pool: &str) -> bool {
        self.state.borrow().imported.contains(pool)
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.state.borrow().transfers.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.borrow_mut().calls.push(call);
    }

    fn check_fail(&self, op: &str, key: &str) -> ZfsResult<()> {
        let st = self.state.borrow();
        if st.failures.contains(&(op.to_string(), key.to_string())) {
            return Err(ZfsError::fatal(format!("{op} {key}"), "scripted failure"));
        }
        Ok(())
    }

    fn root_snaps(&self, pool: &str) -> ZfsResult<Vec<String>> {
        let st = self.state.borrow();
        let ps = st.pools.get(pool).ok_or_else(|| ZfsError::not_found(pool))?;
        Ok(ps.snaps.get(pool).cloned().unwrap_or_default())
    }
}

impl PoolOps for FakePool {
    fn create_snapshot(&self, pool: &str, name: &str) -> ZfsResult<()> {
        self.record(format!("snapshot {pool}@{name}"));
        self.check_fail("create", &format!("{pool}@{name}"))?;
        if self.root_snaps(pool)?.iter().any(|s| s == name) {
            return Err(ZfsError::fatal(
                format!("zfs snapshot -r {pool}@{name}"),
                "dataset already exists",
            ));
        }
        self.seed_snapshot(pool, name);
        Ok(())
    }

    fn rename_snapshot(&self, pool: &str, from: &str, to: &str) -> ZfsResult<()> {
        self.record(format!("rename {pool}@{from} {to}"));
        self.check_fail("rename", &format!("{pool}@{from}"))?;
        if !self.root_snaps(pool)?.iter().any(|s| s == from) {
            return Err(ZfsError::not_found(format!("{pool}@{from}")));
        }
        let mut st = self.state.borrow_mut();
        if let Some(ps) = st.pools.get_mut(pool) {
            for v in ps.snaps.values_mut() {
                for s in v.iter_mut() {
                    if *s == from {
                        *s = to.to_string();
                    }
                }
            }
        }
        Ok(())
    }

    fn destroy_snapshot(&self, pool: &str, name: &str) -> ZfsResult<()> {
        self.record(format!("destroy {pool}@{name}"));
        self.check_fail("destroy", &format!("{pool}@{name}"))?;
        if !self.root_snaps(pool)?.iter().any(|s| s == name) {
            return Err(ZfsError::not_found(format!("{pool}@{name}")));
        }
        let mut st = self.state.borrow_mut();
        if let Some(ps) = st.pools.get_mut(pool) {
            for v in ps.snaps.values_mut() {
                v.retain(|s| s != name);
            }
        }
        Ok(())
    }

    fn list_snapshots(&self, pool: &str) -> ZfsResult<Vec<String>> {
        self.root_snaps(pool)
    }

    fn list_datasets(&self, pool: &str) -> ZfsResult<Vec<String>> {
        let st = self.state.borrow();
        let ps = st.pools.get(pool).ok_or_else(|| ZfsError::not_found(pool))?;
        Ok(ps.datasets.clone())
    }

    fn check_snapshot(&self, dataset: &str, snapshot: &str) -> ZfsResult<()> {
        self.check_fail("check", &format!("{dataset}@{snapshot}"))?;
        if self.snapshots(dataset).iter().any(|s| s == snapshot) {
            Ok(())
        } else {
            Err(ZfsError::not_found(format!("{dataset}@{snapshot}")))
        }
    }

    fn diff(&self, dataset: &str, from: &str, to: &str) -> ZfsResult<Vec<ChangeRecord>> {
        self.record(format!("diff {dataset}@{from} {to}"));
        self.check_fail("diff", dataset)?;
        for snap in [from, to] {
            self.check_snapshot(dataset, snap)?;
        }
        Ok(self
            .state
            .borrow()
            .diffs
            .get(dataset)
            .cloned()
            .unwrap_or_default())
    }

    fn send_receive(&self, req: &TransferRequest) -> ZfsResult<()> {
        self.record(format!("send {}@{} -> {} ({})", req.source_pool, req.snapshot, req.dest_pool, req.mode));
        self.state.borrow_mut().transfers.push(req.clone());
        self.check_fail("send", &req.dest_pool)?;
        if !self.imported(&req.dest_pool) {
            return Err(ZfsError::fatal("zfs recv", format!("pool '{}' is not imported", req.dest_pool)));
        }
        if let TransferMode::Incremental { from } = &req.mode {
            if !self.root_snaps(&req.source_pool)?.iter().any(|s| s == from) {
                return Err(ZfsError::fatal("zfs send", format!("source has no snapshot {from}")));
            }
            if !self.root_snaps(&req.dest_pool)?.iter().any(|s| s == from) {
                return Err(ZfsError::fatal("zfs recv", format!("destination has no snapshot {from}")));
            }
        }

        let mut st = self.state.borrow_mut();
        let src = st
            .pools
            .get(&req.source_pool)
            .ok_or_else(|| ZfsError::not_found(&req.source_pool))?;
        let mut landed: Vec<(String, Vec<String>)> = Vec::new();
        for ds in &src.datasets {
            let snaps = src.snaps.get(ds).cloned().unwrap_or_default();
            let Some(pos) = snaps.iter().position(|s| s == &req.snapshot) else {
                continue;
            };
            let dest_ds = format!("{}{}", req.dest_pool, &ds[req.source_pool.len()..]);
            landed.push((dest_ds, snaps[..=pos].to_vec()));
        }
        let skip = st.skip_on_receive.clone();
        let dest = st
            .pools
            .get_mut(&req.dest_pool)
            .ok_or_else(|| ZfsError::not_found(&req.dest_pool))?;
        for (ds, snaps) in landed {
            if !dest.datasets.contains(&ds) {
                dest.datasets.push(ds.clone());
            }
            let entry = dest.snaps.entry(ds.clone()).or_default();
            if skip.contains(&ds) {
                continue;
            }
            *entry = snaps;
        }
        Ok(())
    }

    fn pool_health(&self, pool: &str) -> ZfsResult<PoolHealth> {
        self.check_fail("health", pool)?;
        let st = self.state.borrow();
        Ok(match st.unhealthy.get(pool) {
            Some(report) => PoolHealth {
                healthy: false,
                report: report.clone(),
            },
            None => PoolHealth {
                healthy: true,
                report: "all pools are healthy".to_string(),
            },
        })
    }

    fn is_imported(&self, pool: &str) -> ZfsResult<bool> {
        Ok(self.imported(pool))
    }

    fn import_pool(&self, pool: &str) -> ZfsResult<()> {
        self.record(format!("import {pool}"));
        self.check_fail("import", pool)?;
        self.set_imported(pool, true);
        Ok(())
    }

    fn export_pool(&self, pool: &str) -> ZfsResult<()> {
        self.record(format!("export {pool}"));
        self.check_fail("export", pool)?;
        self.set_imported(pool, false);
        Ok(())
    }

    fn start_scrub(&self, pool: &str) -> ZfsResult<()> {
        self.record(format!("scrub {pool}"));
        self.check_fail("scrub", pool)
    }

    fn scrub_state(&self, pool: &str) -> ZfsResult<ScrubState> {
        self.check_fail("scrub-status", pool)?;
        let mut st = self.state.borrow_mut();
        Ok(st
            .scrub_states
            .get_mut(pool)
            .and_then(|q| q.pop_front())
            .unwrap_or(ScrubState::Finished))
    }
}

// ----- fake volumes -----

#[derive(Default)]
struct VolState {
    present: HashSet<String>,
    open: HashSet<String>,
    failures: HashSet<(String, String)>,
    erased: Vec<String>,
}

/// Devices keyed by pool name.
#[derive(Default)]
pub struct FakeVolumes {
    state: RefCell<VolState>,
}

impl FakeVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, pool: &str) {
        self.state.borrow_mut().present.insert(pool.to_string());
    }

    pub fn fail(&self, op: &str, pool: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert((op.to_string(), pool.to_string()));
    }

    pub fn open_now(&self, pool: &str) -> bool {
        self.state.borrow().open.contains(pool)
    }

    pub fn erased(&self) -> Vec<String> {
        self.state.borrow().erased.clone()
    }

    fn check_fail(&self, op: &str, pool: &str) -> Result<()> {
        if self
            .state
            .borrow()
            .failures
            .contains(&(op.to_string(), pool.to_string()))
        {
            return Err(anyhow!("{op} {pool}: scripted failure"));
        }
        Ok(())
    }
}

impl VolumeOps for FakeVolumes {
    fn is_present(&self, target: &BackupTarget) -> bool {
        self.state.borrow().present.contains(&target.zpool)
    }

    fn is_open(&self, target: &BackupTarget) -> bool {
        self.open_now(&target.zpool)
    }

    fn open(&self, target: &BackupTarget) -> Result<()> {
        self.check_fail("open", &target.zpool)?;
        self.state.borrow_mut().open.insert(target.zpool.clone());
        Ok(())
    }

    fn close(&self, target: &BackupTarget) -> Result<()> {
        self.check_fail("close", &target.zpool)?;
        self.state.borrow_mut().open.remove(&target.zpool);
        Ok(())
    }

    fn erase(&self, target: &BackupTarget) -> Result<()> {
        self.check_fail("erase", &target.zpool)?;
        self.state.borrow_mut().erased.push(target.zpool.clone());
        Ok(())
    }
}

// ----- approvers -----

/// Returns a fixed verdict and remembers what it was shown.
pub struct FixedApprover {
    pub verdict: Verdict,
    pub calls: usize,
    pub last: Option<DiffSet>,
}

impl FixedApprover {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            calls: 0,
            last: None,
        }
    }
}

impl Approver for FixedApprover {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn approve(&mut self, diff: &DiffSet) -> Result<Verdict> {
        self.calls += 1;
        self.last = Some(diff.clone());
        Ok(self.verdict)
    }
}

/// Approves, recording whether `pool` was imported while waiting.
pub struct WatchingApprover<'p> {
    pub pools: &'p FakePool,
    pub pool: String,
    pub seen_imported: Vec<bool>,
}

impl Approver for WatchingApprover<'_> {
    fn name(&self) -> &'static str {
        "watching"
    }

    fn approve(&mut self, _diff: &DiffSet) -> Result<Verdict> {
        self.seen_imported.push(self.pools.imported(&self.pool));
        Ok(Verdict::Approved)
    }
}
