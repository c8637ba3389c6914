use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, info};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use crate::approve::{build_approver, Approver};
use crate::config::{Registry, RunConfig, DEFAULT_CONFIG_FILE};
use crate::lock::try_acquire_run_lock;
use crate::run::{Coordinator, Operations, RunReport, RunRequest};
use crate::volume::LuksVolumes;
use crate::zfs::ZfsCli;

/// Exit status when another instance holds the run lock.
pub const EXIT_LOCKED: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "zrotate",
    version,
    about = "Rotating, encrypted, approval-gated ZFS backups to removable disks",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Registry file.
    #[arg(short = 'c', long = "config-file", default_value = DEFAULT_CONFIG_FILE)]
    config_file: PathBuf,

    /// Restrict the run to these backup pools (default: every present disk).
    #[arg(short = 'd', long = "disks", num_args = 1..)]
    disks: Vec<String>,

    #[arg(short = 'b', long)]
    backup: bool,

    /// Scrub after backing up; disks that failed the backup are skipped.
    #[arg(short = 's', long)]
    scrub: bool,

    /// Approval strategy override.
    #[arg(short = 'a', long = "approve-method", value_parser = ["console", "mail"])]
    approve_method: Option<String>,

    #[arg(short = 'i', long)]
    import: bool,

    #[arg(short = 'e', long)]
    export: bool,

    /// Erase the disks' encryption headers, then remove them.
    #[arg(long)]
    destroy: bool,

    /// Delete the disks' snapshots on the source and drop them from the registry.
    #[arg(long)]
    remove: bool,

    /// Print the configured mail sender name and exit.
    #[arg(long = "print-mail-sender")]
    print_mail_sender: bool,
}

impl Cli {
    fn operations(&self) -> Operations {
        Operations {
            import: self.import,
            export: self.export,
            backup: self.backup,
            scrub: self.scrub,
            destroy: self.destroy,
            remove: self.remove,
        }
    }
}

/// Typed "YES" on stdin; anything else (or EOF) is a no.
fn confirm_stdin(question: &str) -> bool {
    print!("{}", question);
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => line.trim_end_matches(['\r', '\n']) == "YES",
        Err(_) => false,
    }
}

/// End-of-run summary, one line per non-empty group.
pub fn summary_lines(report: &RunReport) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(b) = &report.backup {
        let ok = b.backed_up();
        if !ok.is_empty() {
            lines.push(format!("Backed up: {}", ok.join(" ")));
        }
        let omitted: Vec<String> = b
            .omitted()
            .into_iter()
            .map(|(pool, verdict)| format!("{} ({})", pool, verdict))
            .collect();
        if !omitted.is_empty() {
            lines.push(format!("Omitted (declined/timed out): {}", omitted.join(" ")));
        }
    }
    if let Some(r) = &report.removed {
        if !r.removed.is_empty() {
            lines.push(format!("Removed from registry: {}", r.removed.join(" ")));
        }
        if !r.kept.is_empty() {
            lines.push(format!("Kept in registry: {}", r.kept.join(" ")));
        }
    }
    let errors = report.error_set();
    if !errors.is_empty() {
        lines.push(format!(
            "There were errors on the following disk(s): {}",
            errors.join(" ")
        ));
    }
    lines
}

fn print_summary(report: &RunReport) {
    for line in summary_lines(report) {
        println!("{}", line);
    }
}

/// Parse arguments, take the run lock and execute. Returns the exit status.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    // Read-only and called by mail filters while a run waits for a reply: no lock.
    if cli.print_mail_sender {
        let registry = Registry::load(&cli.config_file)
            .with_context(|| format!("load registry {}", cli.config_file.display()))?;
        let mail = registry
            .mail
            .as_ref()
            .ok_or_else(|| anyhow!("no approve-method-mail-settings in {}", cli.config_file.display()))?;
        println!("{}", mail.sender_name);
        return Ok(0);
    }

    let _lock = try_acquire_run_lock(&cli.config_file)?;

    let registry = Registry::load(&cli.config_file)
        .with_context(|| format!("load registry {}", cli.config_file.display()))?;

    let ops = cli.operations();
    if !ops.any() {
        return Err(anyhow!("no operation given (use -b, -s, -i, -e, --remove or --destroy)"));
    }

    let mut cfg = RunConfig::from_registry_and_env(registry).with_approve_method(cli.approve_method.clone());
    debug!("{}", cfg);

    let mut approver: Option<Box<dyn Approver>> = if ops.backup {
        Some(build_approver(&cfg.approve_method, &cfg)?)
    } else {
        None
    };

    let pools = ZfsCli::new();
    let volumes = LuksVolumes::new();
    let req = RunRequest {
        selected: cli.disks.clone(),
        ops,
    };

    let report = {
        let mut coord = Coordinator::new(&pools, &volumes, &mut cfg).with_registry_path(&cli.config_file);
        let approver: Option<&mut dyn Approver> = approver.as_deref_mut().map(|a| a as &mut dyn Approver);
        coord.execute(&req, approver, &mut confirm_stdin)?
    };

    if report.present.is_empty() && !ops.remove {
        println!("No backup disk present.");
        return Ok(0);
    }

    print_summary(&report);
    if report.is_success() {
        info!("run finished without errors");
        Ok(0)
    } else {
        Ok(1)
    }
}
