//! Interactive approval on a terminal.
//!
//! Flow:
//! 1. ask for an optional viewer command;
//! 2. empty answer => print the diff; otherwise write it to a temporary file
//!    and run `<viewer...> <file>` (the file is removed even if the viewer fails);
//! 3. only the literal `YES` approves.

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Command;

use super::{Approver, Verdict};
use crate::diff::{render_text, DiffSet};

pub const CONFIRM_TOKEN: &str = "YES";

pub struct ConsoleApprover<R, W> {
    input: R,
    output: W,
    temp_dir: PathBuf,
}

impl<R: BufRead, W: Write> ConsoleApprover<R, W> {
    pub fn new(input: R, output: W, temp_dir: PathBuf) -> Self {
        Self {
            input,
            output,
            temp_dir,
        }
    }

    fn prompt(&mut self, text: &str) -> Result<Option<String>> {
        write!(self.output, "{}", text)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        Ok(Some(line))
    }

    fn show_in_viewer(&mut self, viewer: &str, text: &str) -> Result<()> {
        let mut parts = viewer.split_whitespace();
        let program = parts.next().ok_or_else(|| anyhow!("empty viewer command"))?;
        // Removed on drop, whatever the viewer does.
        let mut file = tempfile::Builder::new()
            .prefix("zrotate-")
            .suffix(".diff")
            .tempfile_in(&self.temp_dir)
            .with_context(|| format!("create temporary diff file in {}", self.temp_dir.display()))?;
        let path = file.path().to_path_buf();
        file.write_all(text.as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("write {}", path.display()))?;
        debug!("diff written to {}", path.display());
        writeln!(self.output, "    diff written to {}", path.display())?;

        let status = Command::new(program)
            .args(parts)
            .arg(&path)
            .status()
            .with_context(|| format!("run viewer \"{}\"", viewer))?;
        if !status.success() {
            return Err(anyhow!("viewer \"{}\" exited with {}", viewer, status));
        }
        Ok(())
    }
}

impl<R: BufRead, W: Write> Approver for ConsoleApprover<R, W> {
    fn name(&self) -> &'static str {
        "console"
    }

    fn approve(&mut self, diff: &DiffSet) -> Result<Verdict> {
        let text = render_text(diff);

        let viewer = self
            .prompt("    Specify a viewer to use or leave empty to print to console: ")?
            .unwrap_or_default();
        let viewer = viewer.trim();
        if viewer.is_empty() {
            writeln!(self.output, "{}", text)?;
        } else {
            self.show_in_viewer(viewer, &text)?;
        }

        let answer = self.prompt("    Are the changes ok? Type \"YES\": ")?;
        Ok(match answer.as_deref() {
            Some(CONFIRM_TOKEN) => Verdict::Approved,
            _ => Verdict::Declined,
        })
    }
}
