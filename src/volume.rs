//! Encrypted backup volumes: presence, container open/close/erase.
//!
//! `VolumeOps` is the collaborator contract; `LuksVolumes` implements it
//! over `cryptsetup` and the `/dev/disk/by-id` + `/dev/mapper` trees.
//!
//! `bring_online` / `take_offline` compose a volume with its pool:
//! - online  = open container (if closed) -> import pool (if not imported)
//! - offline = export pool (if imported) -> close container (if open)
//! Both are idempotent, so rollback paths may call them blindly.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::BackupTarget;
use crate::zfs::PoolOps;

pub trait VolumeOps {
    /// Is the backing device attached?
    fn is_present(&self, target: &BackupTarget) -> bool;

    /// Is the encryption container mapped?
    fn is_open(&self, target: &BackupTarget) -> bool;

    fn open(&self, target: &BackupTarget) -> Result<()>;

    fn close(&self, target: &BackupTarget) -> Result<()>;

    /// Irreversibly destroy the container's key material.
    fn erase(&self, target: &BackupTarget) -> Result<()>;
}

/// LUKS containers addressed by stable device identifiers.
#[derive(Debug, Clone)]
pub struct LuksVolumes {
    by_id_dir: PathBuf,
    mapper_dir: PathBuf,
    cryptsetup_bin: String,
}

impl Default for LuksVolumes {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            mapper_dir: PathBuf::from("/dev/mapper"),
            cryptsetup_bin: "cryptsetup".to_string(),
        }
    }
}

impl LuksVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alternative device trees (used by tests and chroots).
    pub fn with_dirs(mut self, by_id: impl Into<PathBuf>, mapper: impl Into<PathBuf>) -> Self {
        self.by_id_dir = by_id.into();
        self.mapper_dir = mapper.into();
        self
    }

    pub fn with_cryptsetup(mut self, bin: impl Into<String>) -> Self {
        self.cryptsetup_bin = bin.into();
        self
    }

    pub fn partition_path(&self, target: &BackupTarget) -> PathBuf {
        self.by_id_dir.join(&target.id)
    }

    pub fn mapper_path(&self, target: &BackupTarget) -> PathBuf {
        self.mapper_dir.join(&target.luks)
    }

    fn cryptsetup(&self, args: &[&str]) -> Result<()> {
        let cmdline = format!("{} {}", self.cryptsetup_bin, args.join(" "));
        debug!("exec: {}", cmdline);
        let out = Command::new(&self.cryptsetup_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawn \"{}\"", cmdline))?;
        if !out.status.success() {
            return Err(anyhow!(
                "error in \"{}\": {}",
                cmdline,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(())
    }
}

fn path_str(p: &Path) -> Result<&str> {
    p.to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", p.display()))
}

impl VolumeOps for LuksVolumes {
    fn is_present(&self, target: &BackupTarget) -> bool {
        self.partition_path(target).exists()
    }

    fn is_open(&self, target: &BackupTarget) -> bool {
        self.mapper_path(target).exists()
    }

    fn open(&self, target: &BackupTarget) -> Result<()> {
        let part = self.partition_path(target);
        self.cryptsetup(&[
            "open",
            "--type",
            "luks",
            "--key-file",
            &target.luks_keyfile,
            path_str(&part)?,
            &target.luks,
        ])
    }

    fn close(&self, target: &BackupTarget) -> Result<()> {
        self.cryptsetup(&["close", &target.luks])
    }

    fn erase(&self, target: &BackupTarget) -> Result<()> {
        let part = self.partition_path(target);
        self.cryptsetup(&["erase", "--batch-mode", path_str(&part)?])?;
        if let Err(e) = std::fs::remove_file(&target.luks_keyfile) {
            warn!("erase: could not remove key file {}: {}", target.luks_keyfile, e);
        }
        Ok(())
    }
}

/// Open the container and import the pool, skipping what is already done.
pub fn bring_online(pools: &dyn PoolOps, volumes: &dyn VolumeOps, target: &BackupTarget) -> Result<()> {
    if !volumes.is_open(target) {
        info!("opening container {}", target.luks);
        volumes
            .open(target)
            .with_context(|| format!("open container {}", target.luks))?;
    } else {
        debug!("container already open: {}", target.luks);
    }

    if !pools.is_imported(&target.zpool)? {
        info!("importing pool {}", target.zpool);
        pools.import_pool(&target.zpool)?;
    } else {
        debug!("pool already imported: {}", target.zpool);
    }
    Ok(())
}

/// Export the pool and close the container, skipping what is already done.
pub fn take_offline(pools: &dyn PoolOps, volumes: &dyn VolumeOps, target: &BackupTarget) -> Result<()> {
    if pools.is_imported(&target.zpool)? {
        info!("exporting pool {}", target.zpool);
        pools.export_pool(&target.zpool)?;
    }

    if volumes.is_open(target) {
        info!("closing container {}", target.luks);
        volumes
            .close(target)
            .with_context(|| format!("close container {}", target.luks))?;
    }
    Ok(())
}

/// Targets whose backing device is currently attached, registry order kept.
pub fn present_targets<'a>(volumes: &dyn VolumeOps, targets: &'a [BackupTarget]) -> Vec<&'a BackupTarget> {
    targets.iter().filter(|t| volumes.is_present(t)).collect()
}
