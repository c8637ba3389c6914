//! Approval gate.
//!
//! A strategy turns a non-empty `DiffSet` into a verdict. Strategies are
//! picked by name at run start (`STRATEGIES`), hold no state between
//! invocations and never see an empty diff: `decide` approves an empty set
//! without calling any strategy.

use anyhow::{anyhow, Result};
use log::info;
use std::fmt;
use std::io;

use crate::config::RunConfig;
use crate::diff::DiffSet;
use crate::metrics::record_approval;

pub mod console;
pub mod mail;

pub use console::ConsoleApprover;
pub use mail::{Inbox, InboxMessage, MailApprover, MailTransport, Maildir, Sendmail};

/// Registered strategy names.
pub const STRATEGIES: &[&str] = &["console", "mail"];

/// Strategy label used when no approval was needed.
pub const NO_DIFF: &str = "no-diff";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Declined,
    /// No answer before the strategy's deadline. Counts as not approved.
    TimedOut,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Approved => write!(f, "approved"),
            Verdict::Declined => write!(f, "declined"),
            Verdict::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub verdict: Verdict,
    pub strategy: &'static str,
}

impl ApprovalDecision {
    pub fn approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

pub trait Approver {
    fn name(&self) -> &'static str;

    /// Present `diff` to a reviewer and wait for the verdict. `diff` is never empty.
    fn approve(&mut self, diff: &DiffSet) -> Result<Verdict>;
}

/// Empty diff => approved without asking; otherwise ask `approver` once.
pub fn decide(approver: &mut dyn Approver, diff: &DiffSet) -> Result<ApprovalDecision> {
    if diff.is_empty() {
        return Ok(ApprovalDecision {
            verdict: Verdict::Approved,
            strategy: NO_DIFF,
        });
    }
    info!(
        "approval: {} dataset(s) changed, asking via '{}'",
        diff.len(),
        approver.name()
    );
    let verdict = approver.approve(diff)?;
    record_approval(verdict == Verdict::Approved);
    info!("approval: {} ({})", verdict, approver.name());
    Ok(ApprovalDecision {
        verdict,
        strategy: approver.name(),
    })
}

/// Build the strategy registered under `name` for this run.
pub fn build_approver(name: &str, cfg: &RunConfig) -> Result<Box<dyn Approver>> {
    match name {
        "console" => Ok(Box::new(ConsoleApprover::new(
            io::BufReader::new(io::stdin()),
            io::stdout(),
            cfg.temp_dir.clone(),
        ))),
        "mail" => {
            let ms = cfg
                .registry
                .mail
                .as_ref()
                .ok_or_else(|| anyhow!("approve method 'mail' needs approve-method-mail-settings"))?;
            Ok(Box::new(MailApprover::new(
                Sendmail::new(&ms.sender_name, &ms.recipient),
                Maildir::new(&ms.maildir),
                &ms.subject,
                std::time::Duration::from_secs(ms.timeout),
                cfg.mail_poll_interval,
            )))
        }
        other => Err(anyhow!(
            "unknown approve method '{}' (known: {})",
            other,
            STRATEGIES.join(", ")
        )),
    }
}
