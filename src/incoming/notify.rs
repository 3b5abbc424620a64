use crate::incoming::config::NotifyConfig;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorNote {
    pub subject: String,
    pub body: String,
    pub reply_to: Option<String>,
    pub env_block: Vec<String>,
}

pub trait OperatorNotifier {
    fn notify(&self, note: &OperatorNote) -> Result<()>;
}

/// Logs notes and delivers nothing.
pub struct LogNotifier;

impl OperatorNotifier for LogNotifier {
    fn notify(&self, note: &OperatorNote) -> Result<()> {
        tracing::info!(subject = %note.subject, "operator note (no report address configured)");
        Ok(())
    }
}

pub struct SendmailNotifier {
    bin: PathBuf,
    to: String,
}

fn resolve_sendmail_bin(bin: &Path) -> Result<PathBuf> {
    if bin.exists() {
        return Ok(bin.to_path_buf());
    }
    let found = which::which("sendmail").context("sendmail not found at configured path or in PATH")?;
    Ok(found)
}

impl SendmailNotifier {
    pub fn new(bin: &Path, to: impl Into<String>) -> Result<Self> {
        Ok(Self {
            bin: resolve_sendmail_bin(bin)?,
            to: to.into(),
        })
    }

    fn compose(&self, note: &OperatorNote) -> String {
        let mut out = String::new();
        out.push_str(&format!("To: {}\n", self.to));
        out.push_str(&format!("From: {}\n", self.to));
        out.push_str(&format!("Subject: {}\n", single_line(&note.subject)));
        out.push_str(&format!("Date: {}\n", chrono::Local::now().to_rfc2822()));
        if let Some(reply_to) = &note.reply_to {
            out.push_str(&format!("Reply-To: {}\n", single_line(reply_to)));
        }
        out.push('\n');
        out.push_str(&note.body);
        out.push('\n');
        out.push_str("---------------------------------------\n");
        for line in &note.env_block {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("---------------------------------------\n");
        out
    }
}

/// Header values must not smuggle extra headers.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

impl OperatorNotifier for SendmailNotifier {
    fn notify(&self, note: &OperatorNote) -> Result<()> {
        let message = self.compose(note);
        let mut child = Command::new(&self.bin)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run `{} -t`", self.bin.display()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes())?;
        }
        let out = child.wait_with_output()?;
        if !out.status.success() {
            anyhow::bail!(
                "sendmail exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

pub fn from_config(cfg: &NotifyConfig) -> Box<dyn OperatorNotifier> {
    let Some(to) = cfg.report_email.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Box::new(LogNotifier);
    };
    match SendmailNotifier::new(&cfg.sendmail_bin, to) {
        Ok(notifier) => Box::new(notifier),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "operator mail disabled");
            Box::new(LogNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn note() -> OperatorNote {
        OperatorNote {
            subject: "IFArchive Upload game.z5\nBcc: evil@example.com".to_string(),
            body: "1 file totalling 0.01 kb uploaded successfully".to_string(),
            reply_to: Some("Zarf <zarf@example.com>".to_string()),
            env_block: vec!["REMOTE_ADDR: 192.0.2.1".to_string()],
        }
    }

    #[test]
    fn compose_keeps_headers_on_one_line() {
        let notifier = SendmailNotifier {
            bin: PathBuf::from("/bin/true"),
            to: "webuploader@ifarchive.org".to_string(),
        };
        let message = notifier.compose(&note());
        assert!(message.contains("Subject: IFArchive Upload game.z5 Bcc: evil@example.com\n"));
        assert!(message.contains("Reply-To: Zarf <zarf@example.com>\n"));
        assert!(message.contains("REMOTE_ADDR: 192.0.2.1\n"));
        assert!(!message.contains("\nBcc:"));
    }

    #[cfg(unix)]
    #[test]
    fn sendmail_receives_message_on_stdin() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempdir().expect("tempdir");
        let sink = tmp.path().join("mail.txt");
        let bin = tmp.path().join("sendmail");
        fs::write(
            &bin,
            format!("#!/bin/sh\ncat > '{}'\n", sink.display()),
        )
        .expect("write fake sendmail");
        let mut perms = fs::metadata(&bin).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&bin, perms).expect("chmod");

        let notifier = SendmailNotifier::new(&bin, "ops@example.com").expect("notifier");
        notifier.notify(&note()).expect("notify");

        let mail = fs::read_to_string(&sink).expect("read mail");
        assert!(mail.starts_with("To: ops@example.com\n"));
        assert!(mail.contains("uploaded successfully"));
    }

    #[test]
    fn no_address_means_log_only() {
        let cfg = NotifyConfig::default();
        assert!(from_config(&cfg).notify(&note()).is_ok());
    }
}
