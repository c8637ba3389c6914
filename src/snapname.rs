//! Snapshot naming and discovery.
//!
//! Name format: `<target>_<YYYY-MM-DD>[_<seq>]`.
//! Order: calendar date first, then sequence; a missing sequence counts as 0,
//! so `t_2024-01-01` < `t_2024-01-01_1` < `t_2024-01-01_2`.
//!
//! Sequences are per target per day. A new name takes the highest sequence
//! already used today by that target plus one, or 1 for the first snapshot
//! of the day. Concurrent runs are excluded by the run lock only.

use chrono::NaiveDate;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{ZfsError, ZfsResult};
use crate::zfs::PoolOps;

const DATE_FMT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotName {
    pub target: String,
    pub date: NaiveDate,
    pub seq: Option<u32>,
}

impl SnapshotName {
    pub fn new(target: impl Into<String>, date: NaiveDate, seq: Option<u32>) -> Self {
        Self {
            target: target.into(),
            date,
            seq,
        }
    }

    /// Parse `name` as a snapshot of `target`; None if it does not match exactly.
    pub fn parse_for(target: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(target)?.strip_prefix('_')?;
        // date is always 10 chars: YYYY-MM-DD
        if rest.len() < 10 || !rest.is_char_boundary(10) {
            return None;
        }
        let (date_str, tail) = rest.split_at(10);
        if !is_date_shape(date_str) {
            return None;
        }
        let date = NaiveDate::parse_from_str(date_str, DATE_FMT).ok()?;
        let seq = if tail.is_empty() {
            None
        } else {
            let digits = tail.strip_prefix('_')?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(digits.parse::<u32>().ok()?)
        };
        Some(Self::new(target, date, seq))
    }

    /// Parse against any of the registered target names.
    pub fn parse_any<S: AsRef<str>>(targets: &[S], name: &str) -> Option<Self> {
        targets
            .iter()
            .find_map(|t| Self::parse_for(t.as_ref(), name))
    }

    /// Effective sequence used for ordering.
    pub fn seq_or_zero(&self) -> u32 {
        self.seq.unwrap_or(0)
    }

    /// (date, sequence-with-missing-as-0).
    pub fn sort_key(&self) -> (NaiveDate, u32) {
        (self.date, self.seq_or_zero())
    }
}

// YYYY-MM-DD with ASCII digits only (chrono alone would accept e.g. "+2024-1-01")
fn is_date_shape(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.target, self.date.format(DATE_FMT))?;
        if let Some(seq) = self.seq {
            write!(f, "_{}", seq)?;
        }
        Ok(())
    }
}

impl Ord for SnapshotName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            // ties only between "no seq" and "_0", or between different targets
            .then_with(|| self.seq.is_some().cmp(&other.seq.is_some()))
            .then_with(|| self.target.cmp(&other.target))
    }
}

impl PartialOrd for SnapshotName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// All snapshots of `pool` belonging to any of `targets`, oldest first by the
/// pool's creation-time order (not lexical order).
pub fn all_matching<S: AsRef<str>>(
    pools: &dyn PoolOps,
    pool: &str,
    targets: &[S],
) -> ZfsResult<Vec<SnapshotName>> {
    let names = pools.list_snapshots(pool)?;
    Ok(names
        .iter()
        .filter_map(|n| SnapshotName::parse_any(targets, n))
        .collect())
}

/// Highest snapshot of `pool` by (date, seq) among `targets`.
///
/// Equal keys (same date and sequence on two targets) resolve to the one
/// created last: the sort is stable over creation order.
pub fn latest_matching<S: AsRef<str>>(
    pools: &dyn PoolOps,
    pool: &str,
    targets: &[S],
) -> ZfsResult<Option<SnapshotName>> {
    let mut all = all_matching(pools, pool, targets)?;
    all.sort_by_key(SnapshotName::sort_key);
    Ok(all.pop())
}

/// Final name for a new snapshot of `target` on `source_pool` taken on `today`.
pub fn next_name(
    pools: &dyn PoolOps,
    source_pool: &str,
    target: &str,
    today: NaiveDate,
) -> ZfsResult<SnapshotName> {
    let max_today = all_matching(pools, source_pool, &[target])?
        .into_iter()
        .filter(|s| s.date == today)
        .map(|s| s.seq_or_zero())
        .max();
    let seq = match max_today {
        Some(n) => n.checked_add(1).ok_or_else(|| {
            ZfsError::fatal(
                format!("next snapshot name for {}@{}", source_pool, target),
                format!("sequence for {} is exhausted", today),
            )
        })?,
        None => 1,
    };
    Ok(SnapshotName::new(target, today, Some(seq)))
}
