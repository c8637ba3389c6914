//! Pool primitives used by the backup lifecycle.
//!
//! `PoolOps` is the narrow interface between the orchestration code and the
//! pool tooling: one method per operation, typed parameters, typed results.
//! The production implementation lives in `zfs::cli` and is the only place
//! that builds command lines or parses tool output.
//!
//! Naming conventions:
//! - `pool` is a pool name ("tank"), `dataset` a full dataset name ("tank/home").
//! - Snapshot names are passed WITHOUT the `<dataset>@` prefix.

use std::fmt;

use crate::error::ZfsResult;

pub mod cli;

pub use cli::ZfsCli;

/// Kind of a single change reported between two snapshots of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Renamed,
}

impl ChangeKind {
    pub fn symbol(self) -> char {
        match self {
            ChangeKind::Added => '+',
            ChangeKind::Removed => '-',
            ChangeKind::Modified => 'M',
            ChangeKind::Renamed => 'R',
        }
    }

    pub fn from_symbol(c: &str) -> Option<Self> {
        match c {
            "+" => Some(ChangeKind::Added),
            "-" => Some(ChangeKind::Removed),
            "M" => Some(ChangeKind::Modified),
            "R" => Some(ChangeKind::Renamed),
            _ => None,
        }
    }
}

/// Kind of filesystem entry a change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Link,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Door,
    EventPort,
}

impl EntryKind {
    pub fn symbol(self) -> char {
        match self {
            EntryKind::File => 'F',
            EntryKind::Directory => '/',
            EntryKind::Link => '@',
            EntryKind::BlockDevice => 'B',
            EntryKind::CharDevice => 'C',
            EntryKind::Fifo => '|',
            EntryKind::Socket => '=',
            EntryKind::Door => '>',
            EntryKind::EventPort => 'P',
        }
    }

    pub fn from_symbol(c: &str) -> Option<Self> {
        match c {
            "F" => Some(EntryKind::File),
            "/" => Some(EntryKind::Directory),
            "@" => Some(EntryKind::Link),
            "B" => Some(EntryKind::BlockDevice),
            "C" => Some(EntryKind::CharDevice),
            "|" => Some(EntryKind::Fifo),
            "=" => Some(EntryKind::Socket),
            ">" => Some(EntryKind::Door),
            "P" => Some(EntryKind::EventPort),
            _ => None,
        }
    }
}

/// One line of a dataset diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub change: ChangeKind,
    pub entry: EntryKind,
    /// Seconds since the Unix epoch (change time of the inode).
    pub timestamp: i64,
    pub path: String,
    /// Destination path, set for `ChangeKind::Renamed` only.
    pub new_path: Option<String>,
}

/// Result of a pool health query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHealth {
    pub healthy: bool,
    /// Tool report, shown to the operator as-is.
    pub report: String,
}

/// Scrub progress as reported by the pool status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubState {
    InProgress,
    Finished,
    Canceled,
    /// Status did not mention any scrub state we understand; carries the report.
    Unknown(String),
}

/// How a snapshot is streamed to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Replicate the whole source hierarchy up to the snapshot.
    Full,
    /// Replicate all intermediate snapshots from `from` (exclusive) up to the snapshot.
    Incremental { from: String },
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Full => write!(f, "full"),
            TransferMode::Incremental { from } => write!(f, "incremental from {}", from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_pool: String,
    pub dest_pool: String,
    pub snapshot: String,
    pub mode: TransferMode,
}

/// Transport primitives over a set of pools.
pub trait PoolOps {
    /// Recursive snapshot `<pool>@<name>` over every dataset of the pool.
    fn create_snapshot(&self, pool: &str, name: &str) -> ZfsResult<()>;

    /// Recursive rename `<pool>@<from>` -> `<pool>@<to>`.
    fn rename_snapshot(&self, pool: &str, from: &str, to: &str) -> ZfsResult<()>;

    /// Recursive destroy of `<pool>@<name>`.
    fn destroy_snapshot(&self, pool: &str, name: &str) -> ZfsResult<()>;

    /// Snapshot names of the pool's root dataset (depth 1), oldest first by
    /// creation time.
    fn list_snapshots(&self, pool: &str) -> ZfsResult<Vec<String>>;

    /// All datasets of the pool, root dataset included, in the order the
    /// tool reports them.
    fn list_datasets(&self, pool: &str) -> ZfsResult<Vec<String>>;

    /// Ok if `<dataset>@<snapshot>` exists, `ZfsError::NotFound` if it does not.
    fn check_snapshot(&self, dataset: &str, snapshot: &str) -> ZfsResult<()>;

    /// Changes between two snapshots of one dataset, in emission order.
    fn diff(&self, dataset: &str, from: &str, to: &str) -> ZfsResult<Vec<ChangeRecord>>;

    /// Stream a snapshot from the source pool into the destination pool.
    /// A successful return says nothing about completeness on the destination.
    fn send_receive(&self, req: &TransferRequest) -> ZfsResult<()>;

    fn pool_health(&self, pool: &str) -> ZfsResult<PoolHealth>;

    fn is_imported(&self, pool: &str) -> ZfsResult<bool>;

    fn import_pool(&self, pool: &str) -> ZfsResult<()>;

    fn export_pool(&self, pool: &str) -> ZfsResult<()>;

    fn start_scrub(&self, pool: &str) -> ZfsResult<()>;

    fn scrub_state(&self, pool: &str) -> ZfsResult<ScrubState>;
}
