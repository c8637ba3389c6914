//! `zfs` / `zpool` command-line adapter.
//!
//! All command construction and all parsing of tool output happens here.
//! Diagnostics containing "does not exist" are classified as
//! `ZfsError::NotFound`; every other non-zero exit is `ZfsError::Fatal`
//! carrying the command line and the tool's stderr.

use log::debug;
use std::io::Read;
use std::process::{Command, Output, Stdio};

use crate::error::{ZfsError, ZfsResult};
use crate::zfs::{
    ChangeKind, ChangeRecord, EntryKind, PoolHealth, PoolOps, ScrubState, TransferMode,
    TransferRequest,
};

const NOT_FOUND_MARKER: &str = "does not exist";

/// Production `PoolOps` backed by the system `zfs` and `zpool` binaries.
#[derive(Debug, Clone)]
pub struct ZfsCli {
    zfs_bin: String,
    zpool_bin: String,
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self {
            zfs_bin: "zfs".to_string(),
            zpool_bin: "zpool".to_string(),
        }
    }
}

impl ZfsCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override binary paths (e.g. "/usr/sbin/zfs").
    pub fn with_binaries(mut self, zfs: impl Into<String>, zpool: impl Into<String>) -> Self {
        self.zfs_bin = zfs.into();
        self.zpool_bin = zpool.into();
        self
    }

    fn zfs(&self, args: &[&str]) -> ZfsResult<String> {
        run(&self.zfs_bin, args)
    }

    fn zpool(&self, args: &[&str]) -> ZfsResult<String> {
        run(&self.zpool_bin, args)
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

fn run(program: &str, args: &[&str]) -> ZfsResult<String> {
    let cmdline = command_line(program, args);
    debug!("exec: {}", cmdline);
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ZfsError::fatal(&cmdline, e.to_string()))?;
    classify(&cmdline, args.last().copied().unwrap_or(program), out)
}

fn classify(cmdline: &str, object: &str, out: Output) -> ZfsResult<String> {
    if out.status.success() {
        return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if stderr.contains(NOT_FOUND_MARKER) {
        return Err(ZfsError::not_found(object));
    }
    Err(ZfsError::fatal(cmdline, stderr))
}

impl PoolOps for ZfsCli {
    fn create_snapshot(&self, pool: &str, name: &str) -> ZfsResult<()> {
        self.zfs(&["snapshot", "-r", &format!("{pool}@{name}")])?;
        Ok(())
    }

    fn rename_snapshot(&self, pool: &str, from: &str, to: &str) -> ZfsResult<()> {
        self.zfs(&["rename", "-r", &format!("{pool}@{from}"), &format!("@{to}")])?;
        Ok(())
    }

    fn destroy_snapshot(&self, pool: &str, name: &str) -> ZfsResult<()> {
        self.zfs(&["destroy", "-r", &format!("{pool}@{name}")])?;
        Ok(())
    }

    fn list_snapshots(&self, pool: &str) -> ZfsResult<Vec<String>> {
        // -H: no headers, -d 1: only the pool's root dataset, -s creation: oldest first
        let out = self.zfs(&[
            "list", "-H", "-r", "-d", "1", "-t", "snapshot", "-o", "name", "-s", "creation", pool,
        ])?;
        Ok(parse_snapshot_list(pool, &out))
    }

    fn list_datasets(&self, pool: &str) -> ZfsResult<Vec<String>> {
        let out = self.zfs(&["list", "-rH", "-o", "name", pool])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn check_snapshot(&self, dataset: &str, snapshot: &str) -> ZfsResult<()> {
        self.zfs(&["list", "-H", &format!("{dataset}@{snapshot}")])?;
        Ok(())
    }

    fn diff(&self, dataset: &str, from: &str, to: &str) -> ZfsResult<Vec<ChangeRecord>> {
        let a = format!("{dataset}@{from}");
        let b = format!("{dataset}@{to}");
        let cmdline = command_line(&self.zfs_bin, &["diff", "-FHt", &a, &b]);
        let out = self.zfs(&["diff", "-FHt", &a, &b])?;
        let mut records = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let rec = parse_diff_line(line).ok_or_else(|| {
                ZfsError::fatal(&cmdline, format!("unparsable diff line: {line}"))
            })?;
            records.push(rec);
        }
        Ok(records)
    }

    fn send_receive(&self, req: &TransferRequest) -> ZfsResult<()> {
        let snap = format!("{}@{}", req.source_pool, req.snapshot);
        let mut send_args: Vec<String> = vec!["send".into(), "-R".into()];
        if let TransferMode::Incremental { from } = &req.mode {
            send_args.push("-I".into());
            send_args.push(format!("{}@{}", req.source_pool, from));
        }
        send_args.push(snap);
        let recv_args = ["recv", "-Fdu", req.dest_pool.as_str()];

        let send_refs: Vec<&str> = send_args.iter().map(String::as_str).collect();
        let send_line = command_line(&self.zfs_bin, &send_refs);
        let recv_line = command_line(&self.zfs_bin, &recv_args);
        debug!("exec: {} | {}", send_line, recv_line);

        let mut send_child = Command::new(&self.zfs_bin)
            .args(&send_refs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ZfsError::fatal(&send_line, e.to_string()))?;

        let send_stdout = send_child
            .stdout
            .take()
            .ok_or_else(|| ZfsError::fatal(&send_line, "send stdout not captured"))?;

        // stderr of send is drained on a side thread so a chatty sender cannot block
        let send_stderr = send_child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let recv_out = Command::new(&self.zfs_bin)
            .args(recv_args)
            .stdin(send_stdout)
            .output()
            .map_err(|e| ZfsError::fatal(&recv_line, e.to_string()))?;

        let send_status = send_child
            .wait()
            .map_err(|e| ZfsError::fatal(&send_line, e.to_string()))?;
        let send_err = send_stderr
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !recv_out.status.success() {
            return Err(ZfsError::fatal(
                recv_line,
                String::from_utf8_lossy(&recv_out.stderr).trim().to_string(),
            ));
        }
        if !send_status.success() {
            return Err(ZfsError::fatal(send_line, send_err.trim().to_string()));
        }
        Ok(())
    }

    fn pool_health(&self, pool: &str) -> ZfsResult<PoolHealth> {
        let out = self.zpool(&["status", "-x", pool])?;
        Ok(PoolHealth {
            healthy: out.contains("is healthy"),
            report: out.trim_end().to_string(),
        })
    }

    fn is_imported(&self, pool: &str) -> ZfsResult<bool> {
        let out = self.zpool(&["list", "-H", "-o", "name"])?;
        Ok(out.lines().any(|l| l.trim() == pool))
    }

    fn import_pool(&self, pool: &str) -> ZfsResult<()> {
        // -N: do not mount, the backup datasets must never shadow the source
        self.zpool(&["import", "-N", pool])?;
        Ok(())
    }

    fn export_pool(&self, pool: &str) -> ZfsResult<()> {
        self.zpool(&["export", pool])?;
        Ok(())
    }

    fn start_scrub(&self, pool: &str) -> ZfsResult<()> {
        self.zpool(&["scrub", pool])?;
        Ok(())
    }

    fn scrub_state(&self, pool: &str) -> ZfsResult<ScrubState> {
        let out = self.zpool(&["status", pool])?;
        Ok(parse_scrub_state(&out))
    }
}

// ------------- parsers -------------

/// `<pool>@<name>` lines of the root dataset -> `<name>` in input order.
pub fn parse_snapshot_list(pool: &str, out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| {
            let (ds, snap) = line.trim().split_once('@')?;
            if ds == pool && !snap.is_empty() {
                Some(snap.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// One line of `zfs diff -FHt`:
///   `<secs>.<nanos>\t<change>\t<type>\t<path>[\t<new path>]`
pub fn parse_diff_line(line: &str) -> Option<ChangeRecord> {
    let mut cols = line.split('\t');
    let ts = cols.next()?;
    let change = ChangeKind::from_symbol(cols.next()?)?;
    let entry = EntryKind::from_symbol(cols.next()?)?;
    let path = cols.next()?.to_string();
    let new_path = cols.next().map(str::to_string);
    let timestamp = ts.split('.').next()?.parse::<i64>().ok()?;
    Some(ChangeRecord {
        change,
        entry,
        timestamp,
        path,
        new_path,
    })
}

pub fn parse_scrub_state(status: &str) -> ScrubState {
    if status.contains("scrub in progress") {
        ScrubState::InProgress
    } else if status.contains("scrub canceled") {
        ScrubState::Canceled
    } else if status.contains("scrub repaired") {
        ScrubState::Finished
    } else {
        ScrubState::Unknown(status.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_list_keeps_root_dataset_only() {
        let out = "tank@a\ntank/home@a\ntank@backupA_2024-01-01_1\n\n";
        assert_eq!(
            parse_snapshot_list("tank", out),
            vec!["a".to_string(), "backupA_2024-01-01_1".to_string()]
        );
    }

    #[test]
    fn diff_line_plain_and_rename() {
        let r = parse_diff_line("1700000000.123456789\tM\tF\t/tank/home/a.txt").unwrap();
        assert_eq!(r.change, ChangeKind::Modified);
        assert_eq!(r.entry, EntryKind::File);
        assert_eq!(r.timestamp, 1_700_000_000);
        assert_eq!(r.path, "/tank/home/a.txt");
        assert!(r.new_path.is_none());

        let r = parse_diff_line("1700000001.0\tR\t/\t/tank/old\t/tank/new").unwrap();
        assert_eq!(r.change, ChangeKind::Renamed);
        assert_eq!(r.entry, EntryKind::Directory);
        assert_eq!(r.new_path.as_deref(), Some("/tank/new"));

        assert!(parse_diff_line("garbage").is_none());
        assert!(parse_diff_line("17\tX\tF\t/p").is_none());
    }

    #[test]
    fn scrub_state_classification() {
        assert_eq!(
            parse_scrub_state("  scan: scrub in progress since Sun"),
            ScrubState::InProgress
        );
        assert_eq!(
            parse_scrub_state("  scan: scrub canceled on Sun"),
            ScrubState::Canceled
        );
        assert_eq!(
            parse_scrub_state("  scan: scrub repaired 0B in 00:01:02 with 0 errors"),
            ScrubState::Finished
        );
        assert!(matches!(
            parse_scrub_state("  scan: none requested"),
            ScrubState::Unknown(_)
        ));
    }
}
