//! Diff engine: change set between two snapshots of every dataset of a pool.
//!
//! Rules:
//! - datasets are visited in the order the pool reports them;
//! - a dataset lacking the previous snapshot gets a warning body instead of
//!   a diff, and the remaining datasets are still diffed;
//! - any other tool error aborts the whole diff;
//! - datasets without changes are omitted, so an empty set means
//!   "nothing to approve".

use chrono::{DateTime, Local};
use log::{debug, warn};

use crate::error::{ZfsError, ZfsResult};
use crate::zfs::{ChangeKind, ChangeRecord, PoolOps};

pub const MISSING_BASELINE_WARNING: &str =
    "Warning: This dataset did not have the previous snapshot. Is it a new dataset?";

pub const NO_APPROVED_BASELINE_WARNING: &str =
    "Warning: No previously approved snapshot exists. Everything on the pool will be backed up.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffBody {
    Changes(Vec<ChangeRecord>),
    Warning(String),
}

impl DiffBody {
    fn is_empty(&self) -> bool {
        match self {
            DiffBody::Changes(c) => c.is_empty(),
            DiffBody::Warning(w) => w.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDiff {
    pub dataset: String,
    pub body: DiffBody,
}

/// Dataset name -> diff body, in dataset enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSet {
    entries: Vec<DatasetDiff>,
}

impl DiffSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set used when the source pool has never had an approved snapshot.
    pub fn no_baseline(pool: &str) -> Self {
        let mut set = Self::new();
        set.insert(pool, DiffBody::Warning(NO_APPROVED_BASELINE_WARNING.to_string()));
        set
    }

    /// Add a dataset body; empty bodies are dropped.
    pub fn insert(&mut self, dataset: impl Into<String>, body: DiffBody) {
        if body.is_empty() {
            return;
        }
        let dataset = dataset.into();
        match self.entries.iter_mut().find(|e| e.dataset == dataset) {
            Some(e) => e.body = body,
            None => self.entries.push(DatasetDiff { dataset, body }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, dataset: &str) -> Option<&DiffBody> {
        self.entries
            .iter()
            .find(|e| e.dataset == dataset)
            .map(|e| &e.body)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetDiff> {
        self.entries.iter()
    }

    pub fn datasets(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.dataset.as_str()).collect()
    }

    /// Total change records over all datasets (warnings not counted).
    pub fn change_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match &e.body {
                DiffBody::Changes(c) => c.len(),
                DiffBody::Warning(_) => 0,
            })
            .sum()
    }
}

/// Compute the diff between `prev` and `new` on every dataset of `pool`.
pub fn compute_diff(pools: &dyn PoolOps, pool: &str, prev: &str, new: &str) -> ZfsResult<DiffSet> {
    let mut set = DiffSet::new();
    for dataset in pools.list_datasets(pool)? {
        match pools.check_snapshot(&dataset, prev) {
            Ok(()) => {}
            Err(ZfsError::NotFound { .. }) => {
                warn!("diff: {}@{} does not exist", dataset, prev);
                set.insert(dataset, DiffBody::Warning(MISSING_BASELINE_WARNING.to_string()));
                continue;
            }
            Err(e) => return Err(e),
        }

        let changes = pools.diff(&dataset, prev, new)?;
        debug!("diff: {} -> {} change(s)", dataset, changes.len());
        set.insert(dataset, DiffBody::Changes(changes));
    }
    Ok(set)
}

fn format_timestamp(secs: i64) -> String {
    match DateTime::from_timestamp(secs, 0) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => secs.to_string(),
    }
}

pub fn render_record(rec: &ChangeRecord) -> String {
    let path = match (&rec.change, &rec.new_path) {
        (ChangeKind::Renamed, Some(to)) => format!("{} -> {}", rec.path, to),
        _ => rec.path.clone(),
    };
    format!(
        "{}\t{}\t{}\t{}",
        rec.change.symbol(),
        rec.entry.symbol(),
        format_timestamp(rec.timestamp),
        path
    )
}

/// Human-readable text: dataset header, body lines, blank line between datasets.
pub fn render_text(set: &DiffSet) -> String {
    let mut out = String::new();
    for (i, e) in set.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&e.dataset);
        out.push('\n');
        match &e.body {
            DiffBody::Changes(changes) => {
                for rec in changes {
                    out.push_str(&render_record(rec));
                    out.push('\n');
                }
            }
            DiffBody::Warning(w) => {
                out.push_str(w);
                out.push('\n');
            }
        }
    }
    out
}
