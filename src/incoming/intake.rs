use crate::error::IntakeError;
use crate::incoming::admission::{Admission, check_capacity};
use crate::incoming::config::ArchiveConfig;
use crate::incoming::fingerprint::{FingerprintEntry, FingerprintIndex};
use crate::incoming::form::{RequestContext, UploadForm};
use crate::incoming::landing::{LandedFile, LandingArea};
use crate::incoming::ledger::{UploadLedger, UploadRecord};
use crate::incoming::notify::{OperatorNote, OperatorNotifier};
use crate::incoming::page::{AcceptedEntry, Page, RETRY_LATER};
use crate::incoming::sanitize::{sanitize, strip_dirs};
use crate::incoming::util::{epoch_now, is_word_token, plural};

pub const TOS_REQUIRED: &str =
    "You must agree to the Terms of Use in order to upload files to the Archive.";
pub const RIGHTS_REQUIRED: &str =
    "Please select whichever of the \"Right to use\" options applies to your upload.";
pub const AREA_FULL: &str = "There are already too many files in the upload area, preventing \
your files from being uploaded. We apologize for the inconvenience.";
pub const NOTHING_RECEIVED: &str = "No files were received.";

const ADMIN_URL: &str = "https://upload.ifarchive.org/admin/incoming";

/// Submitter-supplied fields of one request, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub name: String,
    pub email: String,
    pub directory: Option<String>,
    pub description: Option<String>,
    pub rights: String,
    pub external_id: Option<String>,
}

impl Submission {
    pub fn from_form(form: &UploadForm) -> Result<Self, IntakeError> {
        if form.first("tos").is_none() {
            return Err(IntakeError::Validation(TOS_REQUIRED.to_string()));
        }
        let Some(rights) = form.first("rights") else {
            return Err(IntakeError::Validation(RIGHTS_REQUIRED.to_string()));
        };

        // tuid is accepted for compatibility and otherwise unused
        let _ = word_field(form, "tuid");

        Ok(Self {
            name: form.first("name").unwrap_or("Anonymous").to_string(),
            email: form.first("email").unwrap_or("???").to_string(),
            directory: form.first("directory").map(str::to_string),
            description: form.first("filedesc").map(str::to_string),
            rights: rights.to_string(),
            external_id: word_field(form, "ifdbid"),
        })
    }
}

/// A `\w+` field; anything else is logged and dropped.
fn word_field(form: &UploadForm, name: &str) -> Option<String> {
    let value = form.first(name)?;
    if is_word_token(value) {
        Some(value.to_string())
    } else {
        tracing::error!(field = name, value, "identifier isn't alphanumeric; ignoring");
        None
    }
}

struct AcceptedFile {
    landed: LandedFile,
    original: String,
}

impl AcceptedFile {
    fn renamed(&self) -> bool {
        self.landed.basename != self.original
    }
}

/// Handle one submission end to end and return the page to show.
pub fn handle(
    cfg: &ArchiveConfig,
    ctx: &RequestContext,
    form: &UploadForm,
    notifier: &dyn OperatorNotifier,
) -> Page {
    let incoming = &cfg.paths.incoming_dir;

    if !form.has_files() {
        let uploads_enabled = match check_capacity(incoming, cfg.intake.max_incoming_bytes) {
            Ok(admission) => admission.admits(),
            Err(err) => {
                tracing::error!(
                    error = %format!("{err:#}"),
                    remote_addr = %ctx.remote_addr,
                    user_agent = %ctx.user_agent,
                    "occupancy scan failed"
                );
                false
            }
        };
        return Page::Form {
            post_url: ctx.post_url.clone(),
            uploads_enabled,
        };
    }

    let submission = match Submission::from_form(form) {
        Ok(submission) => submission,
        Err(err) => return reject(ctx, err),
    };

    match check_capacity(incoming, cfg.intake.max_incoming_bytes) {
        Ok(Admission::Admit { .. }) => {}
        Ok(Admission::Reject { occupancy, ceiling }) => {
            let note = OperatorNote {
                subject: "IFArchive Upload: upload area full".to_string(),
                body: AREA_FULL.to_string(),
                reply_to: None,
                env_block: ctx.env_block(),
            };
            send(notifier, &note);
            return reject(ctx, IntakeError::Capacity { occupancy, ceiling });
        }
        Err(err) => {
            tracing::error!(
                error = %format!("{err:#}"),
                remote_addr = %ctx.remote_addr,
                user_agent = %ctx.user_agent,
                "occupancy scan failed"
            );
            return Page::error(RETRY_LATER);
        }
    }

    let landing = LandingArea::new(incoming, cfg.intake.incoming_dir_mode);
    let ledger = match UploadLedger::open(&cfg.paths.ledger_db) {
        Ok(ledger) => Some(ledger),
        Err(err) => {
            log_persistence(ctx, &IntakeError::Persistence(err.to_string()));
            None
        }
    };

    let mut accepted = Vec::new();
    let mut failed = Vec::new();
    for part in form.file_parts() {
        let Some(raw_name) = part.filename.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };
        let original = strip_dirs(raw_name).to_string();
        let basename = sanitize(raw_name, cfg.intake.filename_policy);
        let uploaded_at = epoch_now().unwrap_or_default();

        let landed = match landing.land(&basename, &part.content, uploaded_at) {
            Ok(landed) => landed,
            Err(err) => {
                tracing::error!(
                    code = err.code().as_str(),
                    error = %err,
                    remote_addr = %ctx.remote_addr,
                    user_agent = %ctx.user_agent,
                    "upload failed"
                );
                failed.push(original);
                continue;
            }
        };

        let file = AcceptedFile { landed, original };
        if file.renamed() {
            tracing::info!(
                "UPLOAD {} ORIGINAL NAME {} ({})",
                file.landed.landed_name(),
                file.original,
                ctx.remote_addr
            );
        } else {
            tracing::info!("UPLOAD {} ({})", file.landed.landed_name(), ctx.remote_addr);
        }

        if let Some(ledger) = &ledger {
            let record = ledger_record(&submission, ctx, &file, uploaded_at.as_secs_f64());
            if let Err(err) = ledger.append(&record) {
                log_persistence(ctx, &IntakeError::Persistence(err.to_string()));
            }
        }

        if let Some(id) = &submission.external_id {
            let entry = FingerprintEntry {
                id: id.clone(),
                time: uploaded_at.as_secs_f64(),
            };
            let stored = FingerprintIndex::open(&cfg.paths.index_file, cfg.intake.index_file_mode)
                .and_then(|index| index.put(&file.landed.content_hash, entry));
            if let Err(err) = stored {
                log_persistence(ctx, &IntakeError::Persistence(format!("{err:#}")));
            }
        }

        accepted.push(file);
    }

    if accepted.is_empty() {
        if failed.is_empty() {
            return Page::error(NOTHING_RECEIVED);
        }
        return Page::error(RETRY_LATER);
    }

    send(notifier, &compose_report(&submission, ctx, &accepted));

    Page::Accepted {
        files: accepted
            .iter()
            .map(|file| AcceptedEntry {
                display_name: display_name(file),
                size_bytes: file.landed.size_bytes,
            })
            .collect(),
        failed,
    }
}

fn reject(ctx: &RequestContext, err: IntakeError) -> Page {
    tracing::warn!(
        code = err.code().as_str(),
        error = %err,
        remote_addr = %ctx.remote_addr,
        user_agent = %ctx.user_agent,
        "upload rejected"
    );
    match err {
        IntakeError::Validation(message) => Page::error(message),
        IntakeError::Capacity { .. } => Page::error(AREA_FULL),
        _ => Page::error(RETRY_LATER),
    }
}

fn log_persistence(ctx: &RequestContext, err: &IntakeError) {
    tracing::error!(
        code = err.code().as_str(),
        error = %err,
        remote_addr = %ctx.remote_addr,
        user_agent = %ctx.user_agent,
        "upload recorded incompletely"
    );
}

fn send(notifier: &dyn OperatorNotifier, note: &OperatorNote) {
    if let Err(err) = notifier.notify(note) {
        tracing::error!(error = %format!("{err:#}"), subject = %note.subject, "operator notice failed");
    }
}

fn display_name(file: &AcceptedFile) -> String {
    if file.renamed() {
        format!("{} (originally {})", file.landed.basename, file.original)
    } else {
        file.landed.basename.clone()
    }
}

fn ledger_record(
    submission: &Submission,
    ctx: &RequestContext,
    file: &AcceptedFile,
    upload_time: f64,
) -> UploadRecord {
    UploadRecord {
        upload_time,
        content_hash: file.landed.content_hash.clone(),
        size_bytes: file.landed.size_bytes,
        landed_filename: file.landed.landed_name(),
        original_filename: file.original.clone(),
        submitter_name: submission.name.clone(),
        submitter_email: submission.email.clone(),
        submitter_address: ctx.remote_addr.clone(),
        submitter_agent: ctx.user_agent.clone(),
        permission_claim: submission.rights.clone(),
        suggested_directory: submission.directory.clone(),
        external_id: submission.external_id.clone(),
        description: submission.description.clone(),
    }
}

fn kb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1024.0)
}

fn compose_report(
    submission: &Submission,
    ctx: &RequestContext,
    accepted: &[AcceptedFile],
) -> OperatorNote {
    let total = accepted.iter().map(|f| f.landed.size_bytes).sum::<u64>();
    let mut body = format!(
        "{} {} totalling {} kb uploaded successfully:\n\n",
        accepted.len(),
        plural("file", accepted.len()),
        kb(total)
    );
    for file in accepted {
        let name = if file.renamed() {
            format!("{} (originally {})", file.landed.landed_name(), file.original)
        } else {
            file.landed.landed_name()
        };
        body.push_str(&format!("  * {name} ({} kb)\n", kb(file.landed.size_bytes)));
    }
    body.push_str(&format!(
        "\nUploaded by {} <{}>\n\n",
        submission.name, submission.email
    ));
    if let Some(about) = &submission.description {
        body.push_str(&about.replace('\r', ""));
        body.push('\n');
    }
    if let Some(dir) = &submission.directory {
        body.push_str(&format!("Suggested directory: if-archive/{dir}\n"));
    }
    body.push_str(&format!("Permission from: {}\n", submission.rights));
    if let Some(id) = &submission.external_id {
        body.push_str(&format!("IFDB ID: {id}\n"));
    }
    body.push_str(&format!("\n\n{ADMIN_URL}\n"));

    let names = accepted
        .iter()
        .map(|f| f.landed.landed_name())
        .collect::<Vec<_>>()
        .join(" ");
    OperatorNote {
        subject: format!("IFArchive Upload {names}"),
        body,
        reply_to: (submission.email != "???")
            .then(|| format!("{} <{}>", submission.name, submission.email)),
        env_block: ctx.env_block(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incoming::digest::content_hash;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct RecordingNotifier {
        notes: RefCell<Vec<OperatorNote>>,
    }

    impl OperatorNotifier for RecordingNotifier {
        fn notify(&self, note: &OperatorNote) -> anyhow::Result<()> {
            self.notes.borrow_mut().push(note.clone());
            Ok(())
        }
    }

    fn setup() -> (TempDir, ArchiveConfig) {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = ArchiveConfig::default();
        cfg.paths.incoming_dir = tmp.path().join("incoming");
        cfg.paths.ledger_db = tmp.path().join("uploads.db");
        cfg.paths.index_file = tmp.path().join("ifids.json");
        cfg.paths.log_file = None;
        cfg.paths.template_dir = None;
        (tmp, cfg)
    }

    fn ctx() -> RequestContext {
        RequestContext {
            remote_addr: "192.0.2.7".to_string(),
            user_agent: "test-agent".to_string(),
            post_url: "/cgi-bin/upload".to_string(),
            ..RequestContext::default()
        }
    }

    fn consenting() -> UploadForm {
        UploadForm::default()
            .with_field("tos", "on")
            .with_field("rights", "author")
    }

    fn landed_names(dir: &Path) -> Vec<String> {
        let mut names = fs::read_dir(dir)
            .expect("read incoming")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn accepted_upload_is_landed_and_ledgered() {
        let (_tmp, cfg) = setup();
        let notifier = RecordingNotifier::default();
        let form = consenting()
            .with_field("name", "Zarf")
            .with_field("filedesc", "A game.\r\nWith lines.")
            .with_field("directory", "games/zcode")
            .with_file(1, "Game Ünïcode.z5", "ZCODE!");

        let page = handle(&cfg, &ctx(), &form, &notifier);

        assert_eq!(
            page,
            Page::Accepted {
                files: vec![AcceptedEntry {
                    display_name: "Game Ünïcode.z5".to_string(),
                    size_bytes: 6,
                }],
                failed: Vec::new(),
            }
        );
        assert_eq!(
            fs::read(cfg.paths.incoming_dir.join("Game Ünïcode.z5")).expect("landed"),
            b"ZCODE!"
        );

        let ledger = UploadLedger::open(&cfg.paths.ledger_db).expect("ledger");
        let rows = ledger.recent(10).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_hash, content_hash(b"ZCODE!"));
        assert_eq!(rows[0].submitter_name, "Zarf");
        assert_eq!(rows[0].submitter_email, "???");
        assert_eq!(rows[0].submitter_address, "192.0.2.7");
        assert_eq!(rows[0].permission_claim, "author");
        assert_eq!(rows[0].external_id, None);

        let notes = notifier.notes.borrow();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].subject, "IFArchive Upload Game Ünïcode.z5");
        assert!(notes[0].body.starts_with("1 file totalling 0.01 kb uploaded successfully:"));
        assert!(notes[0].body.contains("A game.\nWith lines.\n"));
        assert!(notes[0].body.contains("Suggested directory: if-archive/games/zcode\n"));
        assert!(notes[0].body.contains("Permission from: author\n"));
        assert_eq!(notes[0].reply_to, None);
    }

    #[test]
    fn same_name_lands_beside_existing_file() {
        let (_tmp, cfg) = setup();
        fs::create_dir_all(&cfg.paths.incoming_dir).expect("mkdir");
        fs::write(cfg.paths.incoming_dir.join("game.z5"), "OLD").expect("seed");

        let form = consenting().with_file(1, "game.z5", "NEW");
        handle(&cfg, &ctx(), &form, &RecordingNotifier::default());

        let names = landed_names(&cfg.paths.incoming_dir);
        assert_eq!(names.len(), 2);
        assert_eq!(
            fs::read(cfg.paths.incoming_dir.join("game.z5")).expect("old"),
            b"OLD"
        );
        let suffixed = names.iter().find(|n| *n != "game.z5").expect("suffixed");
        let stamp = suffixed.strip_prefix("game.z5.").expect("suffix");
        assert!(stamp.split('.').all(|p| p.chars().all(|c| c.is_ascii_digit())));
        assert_eq!(
            fs::read(cfg.paths.incoming_dir.join(suffixed)).expect("new"),
            b"NEW"
        );
    }

    #[test]
    fn missing_consent_writes_nothing() {
        let (_tmp, cfg) = setup();
        let form = UploadForm::default()
            .with_field("rights", "author")
            .with_file(1, "game.z5", "ZCODE");

        let page = handle(&cfg, &ctx(), &form, &RecordingNotifier::default());

        assert_eq!(page, Page::error(TOS_REQUIRED));
        assert!(!cfg.paths.incoming_dir.exists());
        assert!(!cfg.paths.ledger_db.exists());
    }

    #[test]
    fn missing_rights_is_checked_after_consent() {
        let form = UploadForm::default().with_field("tos", "on");
        let err = Submission::from_form(&form).expect_err("rights required");
        assert_eq!(err.to_string(), format!("validation failed: {RIGHTS_REQUIRED}"));
    }

    #[test]
    fn full_area_rejects_and_tells_operator() {
        let (_tmp, mut cfg) = setup();
        cfg.intake.max_incoming_bytes = 4;
        fs::create_dir_all(&cfg.paths.incoming_dir).expect("mkdir");
        fs::write(cfg.paths.incoming_dir.join("big.bin"), "12345").expect("seed");
        let notifier = RecordingNotifier::default();

        let page = handle(
            &cfg,
            &ctx(),
            &consenting().with_file(1, "x.z5", "x"),
            &notifier,
        );

        assert_eq!(page, Page::error(AREA_FULL));
        assert_eq!(landed_names(&cfg.paths.incoming_dir), vec!["big.bin"]);
        assert_eq!(notifier.notes.borrow().len(), 1);
        assert_eq!(notifier.notes.borrow()[0].body, AREA_FULL);
    }

    #[test]
    fn form_is_shown_without_files() {
        let (_tmp, cfg) = setup();
        let page = handle(&cfg, &ctx(), &UploadForm::default(), &FailingNotifier);
        assert_eq!(
            page,
            Page::Form {
                post_url: "/cgi-bin/upload".to_string(),
                uploads_enabled: true,
            }
        );
    }

    struct FailingNotifier;

    impl OperatorNotifier for FailingNotifier {
        fn notify(&self, _note: &OperatorNote) -> anyhow::Result<()> {
            anyhow::bail!("mail is down")
        }
    }

    #[test]
    fn external_id_is_indexed_by_content_hash() {
        let (_tmp, cfg) = setup();
        let form = consenting()
            .with_field("ifdbid", "abc123")
            .with_field("email", "zarf@example.com")
            .with_file(1, "../../etc/passwd", "abc");

        let page = handle(&cfg, &ctx(), &form, &FailingNotifier);

        let Page::Accepted { files, .. } = page else {
            panic!("expected accepted page");
        };
        assert_eq!(files[0].display_name, "passwd");
        let index = FingerprintIndex::open(&cfg.paths.index_file, 0o666).expect("index");
        let entry = index
            .get("900150983cd24fb0d6963f7d28e17f72")
            .expect("get")
            .expect("entry");
        assert_eq!(entry.id, "abc123");
    }

    #[test]
    fn invalid_external_id_is_dropped() {
        let (_tmp, cfg) = setup();
        let form = consenting()
            .with_field("ifdbid", "abc; rm -rf")
            .with_file(1, "a.z5", "abc");

        handle(&cfg, &ctx(), &form, &FailingNotifier);

        let index = FingerprintIndex::open(&cfg.paths.index_file, 0o666).expect("index");
        assert_eq!(index.len().expect("len"), 0);
        let rows = UploadLedger::open(&cfg.paths.ledger_db)
            .expect("ledger")
            .recent(1)
            .expect("rows");
        assert_eq!(rows[0].external_id, None);
    }

    #[test]
    fn ledger_failure_still_reports_success() {
        let (tmp, mut cfg) = setup();
        // a directory cannot be opened as a database
        cfg.paths.ledger_db = tmp.path().to_path_buf();

        let page = handle(&cfg, &ctx(), &consenting().with_file(1, "a.z5", "abc"), &FailingNotifier);

        assert!(matches!(page, Page::Accepted { .. }));
        assert!(cfg.paths.incoming_dir.join("a.z5").exists());
    }

    #[test]
    fn unreadable_incoming_area_shows_retry_page() {
        let (tmp, mut cfg) = setup();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").expect("seed");
        cfg.paths.incoming_dir = blocker.join("incoming");

        let page = handle(&cfg, &ctx(), &consenting().with_file(1, "a.z5", "abc"), &FailingNotifier);

        assert_eq!(page, Page::error(RETRY_LATER));
        assert!(!cfg.paths.ledger_db.exists());
    }

    #[test]
    fn failed_file_does_not_abort_siblings() {
        let (_tmp, cfg) = setup();
        let too_long = "x".repeat(300);
        let form = consenting()
            .with_file(1, &too_long, "abc")
            .with_file(2, "b.z5", "def");

        let page = handle(&cfg, &ctx(), &form, &FailingNotifier);

        assert_eq!(
            page,
            Page::Accepted {
                files: vec![AcceptedEntry {
                    display_name: "b.z5".to_string(),
                    size_bytes: 3,
                }],
                failed: vec![too_long],
            }
        );
        let ledger = UploadLedger::open(&cfg.paths.ledger_db).expect("ledger");
        assert_eq!(ledger.count().expect("count"), 1);
    }

    #[test]
    fn empty_file_parts_mean_nothing_received() {
        let (_tmp, cfg) = setup();
        let form = consenting().with_file(1, "", "abc");
        let page = handle(&cfg, &ctx(), &form, &FailingNotifier);
        assert_eq!(page, Page::error(NOTHING_RECEIVED));
    }
}
