//! Approval by mail.
//!
//! Protocol:
//! - a single-use 16 char token tags the outgoing subject: `<subject>: <token>`;
//! - the inbox is polled for messages whose subject carries the token;
//! - the first non-blank line of a reply decides: `yes` approves, `no`
//!   declines (both case-insensitive), anything else is logged and ignored;
//! - every matching reply is deleted once read;
//! - no decisive reply before the timeout => `Verdict::TimedOut`.
//!
//! Delivery and mailbox mechanics sit behind `MailTransport` / `Inbox`;
//! `Sendmail` and `Maildir` are the stock adapters.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::{Approver, Verdict};
use crate::diff::{render_text, DiffSet};

pub const TOKEN_LEN: usize = 16;

const GREETING: &str = "Hello,
I am the little backup robot. I have detected changes and am eager to perform a backup right away!
But I must wait until my human approves the changes...

Approve by replying \"yes\" (without the quotes).
Deny by replying \"no\" (also without the quotes).

The changes:

";

pub trait MailTransport {
    fn send(&self, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    /// Inbox-specific handle used for deletion.
    pub id: String,
    pub from: Option<String>,
    pub subject: String,
    /// Plain-text reply body.
    pub body: String,
}

pub trait Inbox {
    /// Messages whose subject contains `token`.
    fn find(&mut self, token: &str) -> Result<Vec<InboxMessage>>;

    fn delete(&mut self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Yes,
    No,
    Invalid,
}

/// Classify a reply body by its first non-blank line.
pub fn parse_reply(body: &str) -> Reply {
    match body.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(l) if l.eq_ignore_ascii_case("yes") => Reply::Yes,
        Some(l) if l.eq_ignore_ascii_case("no") => Reply::No,
        _ => Reply::Invalid,
    }
}

pub fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub struct MailApprover<T, I> {
    transport: T,
    inbox: I,
    subject: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl<T: MailTransport, I: Inbox> MailApprover<T, I> {
    pub fn new(
        transport: T,
        inbox: I,
        subject: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            inbox,
            subject: subject.into(),
            timeout,
            poll_interval,
        }
    }

    pub fn inbox(&self) -> &I {
        &self.inbox
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// One inbox pass: read, delete, and return the first decisive verdict.
    fn poll_once(&mut self, token: &str) -> Result<Option<Verdict>> {
        let mut verdict = None;
        for msg in self.inbox.find(token)? {
            let from = msg.from.as_deref().unwrap_or("(unknown sender)");
            match parse_reply(&msg.body) {
                Reply::Yes if verdict.is_none() => {
                    info!("mail approval: reply from {}: approved", from);
                    verdict = Some(Verdict::Approved);
                }
                Reply::No if verdict.is_none() => {
                    info!("mail approval: reply from {}: declined", from);
                    verdict = Some(Verdict::Declined);
                }
                Reply::Invalid => {
                    warn!(
                        "mail approval: invalid reply from {}, still waiting:\n{}",
                        from,
                        msg.body.trim_end()
                    );
                }
                _ => debug!("mail approval: ignoring later reply from {}", from),
            }
            self.inbox
                .delete(&msg.id)
                .with_context(|| format!("delete reply {}", msg.id))?;
        }
        Ok(verdict)
    }
}

impl<T: MailTransport, I: Inbox> Approver for MailApprover<T, I> {
    fn name(&self) -> &'static str {
        "mail"
    }

    fn approve(&mut self, diff: &DiffSet) -> Result<Verdict> {
        let token = new_token();
        let subject = format!("{}: {}", self.subject, token);
        let body = format!("{}{}", GREETING, render_text(diff));
        self.transport
            .send(&subject, &body)
            .context("send approval request")?;
        info!(
            "mail approval: request sent, waiting up to {}s for a reply",
            self.timeout.as_secs()
        );

        let start = Instant::now();
        while start.elapsed() < self.timeout {
            if let Some(v) = self.poll_once(&token)? {
                return Ok(v);
            }
            let left = self.timeout.saturating_sub(start.elapsed());
            std::thread::sleep(self.poll_interval.min(left));
        }
        info!("mail approval: timeout, no decisive reply");
        Ok(Verdict::TimedOut)
    }
}

// -------------------- sendmail --------------------

/// Outbound mail through the local `sendmail` binary.
#[derive(Debug, Clone)]
pub struct Sendmail {
    bin: String,
    sender_name: String,
    recipient: String,
}

impl Sendmail {
    pub fn new(sender_name: &str, recipient: &str) -> Self {
        Self {
            bin: "sendmail".to_string(),
            sender_name: sender_name.to_string(),
            recipient: recipient.to_string(),
        }
    }

    pub fn with_binary(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }
}

impl MailTransport for Sendmail {
    fn send(&self, subject: &str, body: &str) -> Result<()> {
        let cmdline = format!("{} -F {} {}", self.bin, self.sender_name, self.recipient);
        let mut child = Command::new(&self.bin)
            .args(["-F", &self.sender_name, &self.recipient])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn \"{}\"", cmdline))?;
        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| anyhow!("sendmail stdin not captured"))?;
            write!(stdin, "Subject: {}\n\n{}", subject, body)?;
        }
        let out = child
            .wait_with_output()
            .with_context(|| format!("wait \"{}\"", cmdline))?;
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

// -------------------- maildir --------------------

/// Replies delivered into a Maildir (`new/` and `cur/`) by the local MDA.
#[derive(Debug, Clone)]
pub struct Maildir {
    root: PathBuf,
}

impl Maildir {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn message_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for sub in ["new", "cur"] {
            let dir = self.root.join(sub);
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
                let path = entry?.path();
                if path.is_file() {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Inbox for Maildir {
    fn find(&mut self, token: &str) -> Result<Vec<InboxMessage>> {
        let mut found = Vec::new();
        for path in self.message_files()? {
            let raw = match fs::read(&path) {
                Ok(b) => String::from_utf8_lossy(&b).into_owned(),
                // delivered and removed between listing and reading
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
            };
            let mail = parse_message(&raw);
            if !mail.subject.contains(token) {
                continue;
            }
            found.push(InboxMessage {
                id: path.to_string_lossy().into_owned(),
                from: mail.from,
                subject: mail.subject,
                body: mail.body,
            });
        }
        Ok(found)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        fs::remove_file(id).with_context(|| format!("remove {}", id))
    }
}

// -------------------- RFC 822 subset --------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    pub from: Option<String>,
    pub subject: String,
    /// First text/plain body (the whole body for non-multipart mail).
    pub body: String,
}

fn split_head_body(raw: &str) -> (&str, &str) {
    split_at_blank_line(raw.trim_start_matches(['\r', '\n']))
}

fn split_at_blank_line(raw: &str) -> (&str, &str) {
    for sep in ["\r\n\r\n", "\n\n"] {
        if let Some(i) = raw.find(sep) {
            return (&raw[..i], &raw[i + sep.len()..]);
        }
    }
    (raw, "")
}

/// A body part as it follows its delimiter line. Only the delimiter's own
/// line break is dropped; a blank line right after it means no headers.
fn split_part(part: &str) -> (&str, &str) {
    let part = part
        .strip_prefix("\r\n")
        .or_else(|| part.strip_prefix('\n'))
        .unwrap_or(part);
    for nl in ["\r\n", "\n"] {
        if let Some(body) = part.strip_prefix(nl) {
            return ("", body);
        }
    }
    split_at_blank_line(part)
}

/// Header name (lower-cased) -> value, folded lines joined.
fn parse_headers(head: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some(last) = out.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            out.push((k.trim().to_ascii_lowercase(), v.trim().to_string()));
        }
    }
    out
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        if k.trim().eq_ignore_ascii_case("boundary") {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// First text/plain leaf of an entity.
fn text_plain(headers: &[(String, String)], body: &str) -> Option<String> {
    let ctype = header(headers, "content-type").unwrap_or("text/plain");
    let lower = ctype.to_ascii_lowercase();
    if lower.starts_with("multipart/") {
        let boundary = boundary_of(ctype)?;
        let delim = format!("--{}", boundary);
        for part in body.split(delim.as_str()).skip(1) {
            if part.starts_with("--") {
                break;
            }
            let (ph, pb) = split_part(part);
            if let Some(t) = text_plain(&parse_headers(ph), pb) {
                return Some(t);
            }
        }
        None
    } else if lower.starts_with("text/plain") {
        Some(body.to_string())
    } else {
        None
    }
}

pub fn parse_message(raw: &str) -> ParsedMail {
    let (head, body) = split_head_body(raw);
    let headers = parse_headers(head);
    ParsedMail {
        from: header(&headers, "from").map(str::to_string),
        subject: header(&headers, "subject").unwrap_or_default().to_string(),
        body: text_plain(&headers, body).unwrap_or_default(),
    }
}
