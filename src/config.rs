//! Registry document and run configuration.
//!
//! Registry (JSON, kebab-case keys):
//! ```json
//! {
//!   "pool-to-backup": "tank",
//!   "approve-method": "mail",
//!   "backup-disks": [
//!     {"zpool": "backupA", "id": "ata-XYZ-part1", "luks": "luks-ata-XYZ-part1",
//!      "luks-keyfile": "/keys/ata-XYZ-part1.key"}
//!   ],
//!   "approve-method-mail-settings": {
//!     "sender-name": "backup robot", "recipient": "me@example.org",
//!     "subject": "Backup approval", "maildir": "/var/mail/backup", "timeout": 86400
//!   },
//!   "scrub": {"poll-interval": 60, "first-check-delay": 60}
//! }
//! ```
//! Load and save always work on the whole document.
//!
//! RunConfig is the explicit value handed to every component; it is built
//! from the registry, then ENV, then CLI overrides (`with_*` setters).
//!
//! ENV:
//!   ZR_SCRUB_POLL_SECS        : scrub status poll interval (default 60)
//!   ZR_SCRUB_FIRST_CHECK_SECS : delay before the first scrub status check (default 60)
//!   ZR_MAIL_POLL_SECS         : inbox poll interval while waiting for approval (default 10)
//!   ZR_APPROVE_METHOD         : approval strategy name (overrides the registry)

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "backup-config.json";
pub const DEFAULT_APPROVE_METHOD: &str = "console";

/// A registered backup destination. Identity is the pool name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupTarget {
    /// Pool name on the backup disk; also the snapshot name prefix.
    pub zpool: String,
    /// Partition identifier under /dev/disk/by-id.
    pub id: String,
    /// Name of the mapped encryption container.
    pub luks: String,
    /// Path of the container key file.
    pub luks_keyfile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MailSettings {
    pub sender_name: String,
    pub recipient: String,
    pub subject: String,
    /// Maildir receiving the replies (cur/ + new/).
    pub maildir: PathBuf,
    /// Seconds to wait for a reply.
    pub timeout: u64,
    /// Seconds between inbox checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScrubSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_check_delay: Option<u64>,
}

/// Persistent registry of targets and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Registry {
    pub pool_to_backup: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_method: Option<String>,
    #[serde(default)]
    pub backup_disks: Vec<BackupTarget>,
    #[serde(
        default,
        rename = "approve-method-mail-settings",
        skip_serializing_if = "Option::is_none"
    )]
    pub mail: Option<MailSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrub: Option<ScrubSettings>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read registry {}", path.display()))?;
        let reg: Registry = serde_json::from_str(&text)
            .with_context(|| format!("parse registry {}", path.display()))?;
        reg.validate()
            .with_context(|| format!("validate registry {}", path.display()))?;
        Ok(reg)
    }

    /// Persist the whole document (write to a sibling temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self).context("serialize registry")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text + "\n").with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_to_backup.trim().is_empty() {
            return Err(anyhow!("pool-to-backup is empty"));
        }
        let mut seen = HashSet::new();
        for t in &self.backup_disks {
            if t.zpool == self.pool_to_backup {
                return Err(anyhow!("backup pool '{}' equals pool-to-backup", t.zpool));
            }
            if !seen.insert(t.zpool.as_str()) {
                return Err(anyhow!("backup pool '{}' registered twice", t.zpool));
            }
        }
        Ok(())
    }

    pub fn target(&self, pool: &str) -> Option<&BackupTarget> {
        self.backup_disks.iter().find(|t| t.zpool == pool)
    }

    /// Pool names of all registered targets (snapshot name prefixes).
    pub fn target_names(&self) -> Vec<String> {
        self.backup_disks.iter().map(|t| t.zpool.clone()).collect()
    }

    /// Drop a target from the in-memory document; true if it was present.
    pub fn remove_target(&mut self, pool: &str) -> bool {
        let before = self.backup_disks.len();
        self.backup_disks.retain(|t| t.zpool != pool);
        self.backup_disks.len() != before
    }
}

/// Configuration of one run, passed explicitly to the components.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub registry: Registry,
    /// Approval strategy name (see `approve::STRATEGIES`).
    pub approve_method: String,
    pub scrub_poll_interval: Duration,
    pub scrub_first_check_delay: Duration,
    pub mail_poll_interval: Duration,
    /// Directory for temporary diff files handed to an external viewer.
    pub temp_dir: PathBuf,
}

impl RunConfig {
    pub fn from_registry(registry: Registry) -> Self {
        let approve_method = registry
            .approve_method
            .clone()
            .unwrap_or_else(|| DEFAULT_APPROVE_METHOD.to_string());
        let scrub = registry.scrub.clone().unwrap_or_default();
        let mail_poll = registry
            .mail
            .as_ref()
            .and_then(|m| m.poll_interval)
            .unwrap_or(10);
        Self {
            approve_method,
            scrub_poll_interval: Duration::from_secs(scrub.poll_interval.unwrap_or(60)),
            scrub_first_check_delay: Duration::from_secs(scrub.first_check_delay.unwrap_or(60)),
            mail_poll_interval: Duration::from_secs(mail_poll),
            temp_dir: std::env::temp_dir(),
            registry,
        }
    }

    /// Registry values overridden by environment variables.
    pub fn from_registry_and_env(registry: Registry) -> Self {
        let mut cfg = Self::from_registry(registry);

        if let Some(n) = env_u64("ZR_SCRUB_POLL_SECS") {
            cfg.scrub_poll_interval = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("ZR_SCRUB_FIRST_CHECK_SECS") {
            cfg.scrub_first_check_delay = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("ZR_MAIL_POLL_SECS") {
            cfg.mail_poll_interval = Duration::from_secs(n);
        }
        if let Ok(v) = std::env::var("ZR_APPROVE_METHOD") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.approve_method = s.to_string();
            }
        }
        cfg
    }

    pub fn source_pool(&self) -> &str {
        &self.registry.pool_to_backup
    }

    pub fn with_approve_method<S: Into<String>>(mut self, method: Option<S>) -> Self {
        if let Some(m) = method {
            self.approve_method = m.into();
        }
        self
    }

    pub fn with_scrub_poll_interval(mut self, d: Duration) -> Self {
        self.scrub_poll_interval = d;
        self
    }

    pub fn with_scrub_first_check_delay(mut self, d: Duration) -> Self {
        self.scrub_first_check_delay = d;
        self
    }

    pub fn with_mail_poll_interval(mut self, d: Duration) -> Self {
        self.mail_poll_interval = d;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RunConfig {{ \
             source: {}, \
             targets: [{}], \
             approve_method: {}, \
             scrub_poll: {}s, \
             scrub_first_check: {}s, \
             mail_poll: {}s \
             }}",
            self.registry.pool_to_backup,
            self.registry.target_names().join(", "),
            self.approve_method,
            self.scrub_poll_interval.as_secs(),
            self.scrub_first_check_delay.as_secs(),
            self.mail_poll_interval.as_secs(),
        )
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}
