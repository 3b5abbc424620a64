use crate::error::{IntakeError, IntakeErrorCode};
use crate::ifdb::client::{CatalogClient, CatalogReply};
use crate::incoming::config::ArchiveConfig;
use crate::incoming::digest::file_content_hash;
use crate::incoming::fingerprint::{FingerprintEntry, FingerprintIndex};
use crate::incoming::util::{epoch_now, is_word_token};
use anyhow::Result;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// Asks the operator for an identifier the index does not know.
pub trait IdPrompt {
    /// `None` when the operator entered nothing.
    fn ask(&mut self, basename: &str) -> Result<Option<String>>;
}

pub struct StdinPrompt;

impl IdPrompt for StdinPrompt {
    fn ask(&mut self, basename: &str) -> Result<Option<String>> {
        let mut stdout = io::stdout();
        write!(stdout, "IFDB ID for {basename}: ")?;
        stdout.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim();
        Ok((!answer.is_empty()).then(|| answer.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Updated { id: String },
    Rejected { line: String },
    Unexpected { body: String },
    RemoteFailed { error: String },
    NoIdentifier,
    NotRegularFile,
    Skipped,
    InvalidIdentifier { id: String },
    LocalFailure { error: String },
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// One outcome line for the operator.
pub struct OutcomeLine<'a> {
    pub file: &'a Path,
    pub outcome: &'a ReconcileOutcome,
}

impl fmt::Display for OutcomeLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.file.display();
        match self.outcome {
            ReconcileOutcome::Updated { id } => write!(f, "IFDB updated for {file} (ID {id})"),
            ReconcileOutcome::Rejected { line } => write!(f, "IFDB update for {file} failed. {line}"),
            ReconcileOutcome::Unexpected { body } => {
                write!(f, "IFDB update for {file} failed unexpectedly: {body}")
            }
            ReconcileOutcome::RemoteFailed { error } => {
                write!(f, "IFDB update for {file} failed: {error}")
            }
            ReconcileOutcome::NoIdentifier => write!(f, "no identifier found for {file}"),
            ReconcileOutcome::NotRegularFile => write!(f, "not a regular file: {file}"),
            ReconcileOutcome::Skipped => write!(f, "skipped {file}: no identifier entered"),
            ReconcileOutcome::InvalidIdentifier { id } => {
                write!(f, "skipped {file}: identifier {id:?} isn't alphanumeric")
            }
            ReconcileOutcome::LocalFailure { error } => write!(f, "could not reconcile {file}: {error}"),
        }
    }
}

/// Path as published: `canonical` with `public_root` removed, keeping the
/// leading `/`. Paths outside the root are returned unchanged.
pub fn archive_relative_path(canonical: &Path, public_root: &Path) -> String {
    match canonical.strip_prefix(public_root) {
        Ok(rest) => format!("/{}", rest.display()),
        Err(_) => canonical.display().to_string(),
    }
}

pub struct Reconciler<'a> {
    cfg: &'a ArchiveConfig,
    index: &'a FingerprintIndex,
    client: &'a dyn CatalogClient,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        cfg: &'a ArchiveConfig,
        index: &'a FingerprintIndex,
        client: &'a dyn CatalogClient,
    ) -> Self {
        Self { cfg, index, client }
    }

    /// Each file is handled on its own; one failure never stops the rest.
    pub fn reconcile(
        &self,
        files: &[PathBuf],
        prompt: Option<&mut dyn IdPrompt>,
    ) -> Vec<(PathBuf, ReconcileOutcome)> {
        self.reconcile_with(files, prompt, |_, _| {})
    }

    /// Like [`Reconciler::reconcile`], calling `observe` as soon as each file
    /// is done.
    pub fn reconcile_with(
        &self,
        files: &[PathBuf],
        mut prompt: Option<&mut dyn IdPrompt>,
        mut observe: impl FnMut(&Path, &ReconcileOutcome),
    ) -> Vec<(PathBuf, ReconcileOutcome)> {
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            let outcome = self.reconcile_one(file, prompt.as_deref_mut());
            observe(file, &outcome);
            out.push((file.clone(), outcome));
        }
        out
    }

    fn reconcile_one<'p>(
        &self,
        file: &Path,
        prompt: Option<&mut (dyn IdPrompt + 'p)>,
    ) -> ReconcileOutcome {
        let canonical = match fs::canonicalize(file) {
            Ok(path) if path.is_file() => path,
            _ => return ReconcileOutcome::NotRegularFile,
        };

        let hash = match file_content_hash(&canonical) {
            Ok(hash) => hash,
            Err(err) => return local_failure(file, err),
        };

        let id = match self.index.get(&hash) {
            Ok(Some(entry)) => entry.id,
            Ok(None) => {
                let Some(prompt) = prompt else {
                    return ReconcileOutcome::NoIdentifier;
                };
                let basename = canonical
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match prompt.ask(&basename) {
                    Ok(Some(id)) => {
                        if !is_word_token(&id) {
                            return ReconcileOutcome::InvalidIdentifier { id };
                        }
                        if let Err(err) = self.remember(&hash, &id) {
                            return local_failure(file, err);
                        }
                        id
                    }
                    Ok(None) => return ReconcileOutcome::Skipped,
                    Err(err) => return local_failure(file, err),
                }
            }
            Err(err) => return local_failure(file, err),
        };

        let path = archive_relative_path(&canonical, &self.cfg.ifdb.public_root);
        match self.client.commit(&id, &path) {
            Ok(CatalogReply::Ok) => {
                tracing::info!(file = %file.display(), id = %id, path = %path, "IFDB updated");
                ReconcileOutcome::Updated { id }
            }
            Ok(CatalogReply::Rejected(rejection)) => {
                let err = IntakeError::Remote(rejection.line.clone());
                tracing::warn!(
                    code = err.code().as_str(),
                    kind = ?rejection.kind,
                    file = %file.display(),
                    "{err}"
                );
                ReconcileOutcome::Rejected {
                    line: rejection.line,
                }
            }
            Ok(CatalogReply::Unexpected(body)) => {
                let err = IntakeError::Remote(format!("unexpected reply: {body}"));
                tracing::warn!(code = err.code().as_str(), file = %file.display(), "{err}");
                ReconcileOutcome::Unexpected { body }
            }
            Err(err) => {
                let error = format!("{err:#}");
                tracing::warn!(
                    code = IntakeErrorCode::E105Remote.as_str(),
                    file = %file.display(),
                    id = %id,
                    path = %path,
                    error = %error,
                    "IFDB call failed"
                );
                ReconcileOutcome::RemoteFailed { error }
            }
        }
    }

    fn remember(&self, hash: &str, id: &str) -> Result<()> {
        let entry = FingerprintEntry {
            id: id.to_string(),
            time: epoch_now()?.as_secs_f64(),
        };
        self.index.put(hash, entry)
    }
}

fn local_failure(file: &Path, err: anyhow::Error) -> ReconcileOutcome {
    let error = format!("{err:#}");
    tracing::error!(file = %file.display(), error = %error, "reconcile failed locally");
    ReconcileOutcome::LocalFailure { error }
}
