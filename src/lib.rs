// Transport layer
pub mod error;
pub mod zfs;    // src/zfs/{mod,cli}.rs
pub mod volume;

// Core
pub mod snapname;
pub mod diff;
pub mod approve; // src/approve/{mod,console,mail}.rs
pub mod backup;
pub mod scrub;
pub mod decommission;
pub mod run;

// Ambient
pub mod config;
pub mod lock;
pub mod metrics;
pub mod cli;

pub use approve::{decide, ApprovalDecision, Approver, Verdict};
pub use backup::{BackupOptions, BackupReport, Orchestrator, TargetOutcome, TEMP_SNAPSHOT};
pub use config::{BackupTarget, Registry, RunConfig};
pub use diff::{compute_diff, DiffBody, DiffSet};
pub use error::{ZfsError, ZfsResult};
pub use run::{Coordinator, Operations, RunReport, RunRequest};
pub use scrub::{ScrubReport, ScrubStatus, ScrubSupervisor};
pub use snapname::SnapshotName;
pub use volume::VolumeOps;
pub use zfs::PoolOps;
