mod common;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use common::{modified, unique_root, FixedApprover};
use zrotate::approve::mail::{Inbox, InboxMessage, MailApprover, MailTransport, Maildir};
use zrotate::approve::{build_approver, decide, Approver, ConsoleApprover, Verdict, NO_DIFF};
use zrotate::config::{Registry, RunConfig};
use zrotate::diff::{DiffBody, DiffSet};

fn one_change() -> DiffSet {
    let mut set = DiffSet::new();
    set.insert("tank/home", DiffBody::Changes(vec![modified("/tank/home/a.txt")]));
    set
}

fn console(input: &str, temp_dir: PathBuf) -> ConsoleApprover<Cursor<Vec<u8>>, Vec<u8>> {
    ConsoleApprover::new(Cursor::new(input.as_bytes().to_vec()), Vec::new(), temp_dir)
}

fn console_to<'o>(input: &str, out: &'o mut Vec<u8>, temp_dir: PathBuf) -> ConsoleApprover<Cursor<Vec<u8>>, &'o mut Vec<u8>> {
    ConsoleApprover::new(Cursor::new(input.as_bytes().to_vec()), out, temp_dir)
}

// ----- gate -----

#[test]
fn empty_diff_is_approved_without_asking() -> Result<()> {
    let mut approver = FixedApprover::new(Verdict::Declined);
    let d = decide(&mut approver, &DiffSet::new())?;
    assert!(d.approved());
    assert_eq!(d.strategy, NO_DIFF);
    assert_eq!(approver.calls, 0);
    Ok(())
}

#[test]
fn non_empty_diff_asks_exactly_once() -> Result<()> {
    let mut approver = FixedApprover::new(Verdict::TimedOut);
    let d = decide(&mut approver, &one_change())?;
    assert!(!d.approved());
    assert_eq!(d.verdict, Verdict::TimedOut);
    assert_eq!(d.strategy, "fixed");
    assert_eq!(approver.calls, 1);
    Ok(())
}

#[test]
fn strategies_are_picked_by_name() -> Result<()> {
    let registry: Registry = serde_json::from_str(r#"{"pool-to-backup": "tank", "backup-disks": []}"#)?;
    let cfg = RunConfig::from_registry(registry);
    assert_eq!(build_approver("console", &cfg)?.name(), "console");
    // mail needs its settings section
    assert!(build_approver("mail", &cfg).is_err());
    assert!(build_approver("carrier-pigeon", &cfg).is_err());
    Ok(())
}

// ----- console -----

#[test]
fn console_only_literal_yes_approves() -> Result<()> {
    let dir = unique_root("console");
    fs::create_dir_all(&dir)?;

    let mut a = console("\nYES\n", dir.clone());
    assert_eq!(a.approve(&one_change())?, Verdict::Approved);

    for answer in ["\nyes\n", "\nYES please\n", "\n\n", "\n"] {
        let mut a = console(answer, dir.clone());
        assert_eq!(a.approve(&one_change())?, Verdict::Declined, "answer {answer:?}");
    }
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn console_prints_diff_when_no_viewer() -> Result<()> {
    let dir = unique_root("console-print");
    fs::create_dir_all(&dir)?;
    let mut buf = Vec::new();
    console_to("\nno\n", &mut buf, dir.clone()).approve(&one_change())?;
    let out = String::from_utf8(buf)?;
    assert!(out.contains("tank/home\n"));
    assert!(out.contains("/tank/home/a.txt"));
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn console_viewer_gets_temp_file_which_is_removed() -> Result<()> {
    let dir = unique_root("console-viewer");
    fs::create_dir_all(&dir)?;

    let mut a = console("true\nYES\n", dir.clone());
    assert_eq!(a.approve(&one_change())?, Verdict::Approved);
    assert_eq!(fs::read_dir(&dir)?.count(), 0);

    // failing viewer: error for this target, file still removed
    let mut a = console("false\nYES\n", dir.clone());
    assert!(a.approve(&one_change()).is_err());
    assert_eq!(fs::read_dir(&dir)?.count(), 0);

    // the viewer sees the rendered diff; files already in the directory survive
    fs::write(dir.join("zrotate-keep.diff"), "keep")?;
    let mut a = console("grep -q /tank/home/a.txt\nYES\n", dir.clone());
    assert_eq!(a.approve(&one_change())?, Verdict::Approved);
    assert_eq!(fs::read_dir(&dir)?.count(), 1);
    assert_eq!(fs::read_to_string(dir.join("zrotate-keep.diff"))?, "keep");

    fs::remove_dir_all(&dir)?;
    Ok(())
}

// ----- mail -----

#[derive(Default)]
struct Outbox {
    sent: RefCell<Vec<(String, String)>>,
}

impl MailTransport for &Outbox {
    fn send(&self, subject: &str, body: &str) -> Result<()> {
        self.sent.borrow_mut().push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Each poll returns the next batch of reply bodies, tagged with the token.
#[derive(Default)]
struct ScriptedInbox {
    polls: VecDeque<Vec<&'static str>>,
    deleted: Vec<String>,
    next_id: usize,
}

impl Inbox for ScriptedInbox {
    fn find(&mut self, token: &str) -> Result<Vec<InboxMessage>> {
        let batch = self.polls.pop_front().unwrap_or_default();
        let mut out = Vec::new();
        for body in batch {
            self.next_id += 1;
            out.push(InboxMessage {
                id: format!("m{}", self.next_id),
                from: Some("admin@example.org".to_string()),
                subject: format!("Re: Backup: {token}"),
                body: body.to_string(),
            });
        }
        Ok(out)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.deleted.push(id.to_string());
        Ok(())
    }
}

fn mail_with<'a>(outbox: &'a Outbox, polls: Vec<Vec<&'static str>>, timeout_ms: u64) -> MailApprover<&'a Outbox, ScriptedInbox> {
    MailApprover::new(
        outbox,
        ScriptedInbox {
            polls: polls.into(),
            ..ScriptedInbox::default()
        },
        "Backup",
        Duration::from_millis(timeout_ms),
        Duration::from_millis(5),
    )
}

#[test]
fn mail_request_carries_token_and_diff() -> Result<()> {
    let outbox = Outbox::default();
    let mut a = mail_with(&outbox, vec![vec!["yes"]], 2_000);
    assert_eq!(a.approve(&one_change())?, Verdict::Approved);

    let sent = outbox.sent.borrow();
    assert_eq!(sent.len(), 1);
    let (subject, body) = &sent[0];
    let token = subject.strip_prefix("Backup: ").expect("subject prefix");
    assert_eq!(token.len(), 16);
    assert!(body.contains("replying \"yes\""));
    assert!(body.contains("/tank/home/a.txt"));
    Ok(())
}

#[test]
fn mail_invalid_replies_are_ignored_and_deleted() -> Result<()> {
    let outbox = Outbox::default();
    let mut a = mail_with(&outbox, vec![vec!["maybe?"], vec![], vec!["No", "yes"]], 2_000);
    assert_eq!(a.approve(&one_change())?, Verdict::Declined);
    // all three read messages are gone, including the later "yes"
    assert_eq!(a.inbox().deleted, ["m1", "m2", "m3"]);
    Ok(())
}

#[test]
fn mail_without_reply_times_out() -> Result<()> {
    let outbox = Outbox::default();
    let mut a = mail_with(&outbox, vec![], 40);
    assert_eq!(a.approve(&one_change())?, Verdict::TimedOut);
    Ok(())
}

/// Delivers the reply straight into a Maildir when the request goes out.
struct Autoresponder {
    maildir: PathBuf,
    reply: &'static str,
}

impl MailTransport for Autoresponder {
    fn send(&self, subject: &str, _body: &str) -> Result<()> {
        let raw = format!(
            "From: admin@example.org\nSubject: Re: {subject}\nContent-Type: text/plain\n\n{}\n\n> quoted request\n",
            self.reply
        );
        fs::write(self.maildir.join("new").join("1700000000.reply"), raw)?;
        Ok(())
    }
}

#[test]
fn maildir_reply_round_trip() -> Result<()> {
    let root = unique_root("maildir");
    for sub in ["new", "cur", "tmp"] {
        fs::create_dir_all(root.join(sub))?;
    }
    // unrelated mail stays put
    fs::write(root.join("cur").join("other"), "Subject: hello\n\nyes\n")?;

    let mut a = MailApprover::new(
        Autoresponder {
            maildir: root.clone(),
            reply: "  YES",
        },
        Maildir::new(&root),
        "Backup",
        Duration::from_secs(2),
        Duration::from_millis(5),
    );
    assert_eq!(a.approve(&one_change())?, Verdict::Approved);
    assert_eq!(fs::read_dir(root.join("new"))?.count(), 0);
    assert!(root.join("cur").join("other").exists());

    fs::remove_dir_all(&root)?;
    Ok(())
}
