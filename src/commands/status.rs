use anyhow::Result;

use crate::commands::CommandReport;
use crate::incoming::admission::{Admission, check_capacity};
use crate::incoming::config::ArchiveConfig;
use crate::incoming::fingerprint::FingerprintIndex;
use crate::incoming::ledger::UploadLedger;

const RECENT_ROWS: usize = 5;

pub fn run() -> Result<CommandReport> {
    let cfg = crate::commands::load_runtime()?;
    Ok(build_report(&cfg))
}

fn build_report(cfg: &ArchiveConfig) -> CommandReport {
    let mut report = CommandReport::new("status");

    report.detail(format!("incoming_dir={}", cfg.paths.incoming_dir.display()));
    report.detail(format!("ledger_db={}", cfg.paths.ledger_db.display()));
    report.detail(format!("index_file={}", cfg.paths.index_file.display()));
    report.detail(format!("filename_policy={:?}", cfg.intake.filename_policy));

    match check_capacity(&cfg.paths.incoming_dir, cfg.intake.max_incoming_bytes) {
        Ok(admission) => {
            report.detail(format!("occupancy_bytes={}", admission.occupancy()));
            report.detail(format!("ceiling_bytes={}", cfg.intake.max_incoming_bytes));
            let decision = match admission {
                Admission::Admit { .. } => "admit",
                Admission::Reject { .. } => "reject",
            };
            report.detail(format!("admission={decision}"));
        }
        Err(err) => report.issue(format!("occupancy scan failed: {err:#}")),
    }

    if !cfg.paths.incoming_dir.exists() {
        report.detail("incoming dir absent; created on first upload");
    }

    if cfg.paths.ledger_db.exists() {
        match UploadLedger::open(&cfg.paths.ledger_db) {
            Ok(ledger) => {
                match ledger.count() {
                    Ok(n) => report.detail(format!("ledger_rows={n}")),
                    Err(err) => report.issue(err.to_string()),
                }
                match ledger.recent(RECENT_ROWS) {
                    Ok(rows) => {
                        for row in rows {
                            report.detail(format!(
                                "recent: {} {} bytes md5={} from {} <{}>",
                                row.landed_filename,
                                row.size_bytes,
                                row.content_hash,
                                row.submitter_name,
                                row.submitter_email
                            ));
                        }
                    }
                    Err(err) => report.issue(err.to_string()),
                }
            }
            Err(err) => report.issue(err.to_string()),
        }
    } else {
        report.detail("ledger_rows=0 (no ledger yet)");
    }

    if cfg.paths.index_file.exists() {
        match FingerprintIndex::attach(&cfg.paths.index_file, cfg.intake.index_file_mode).len() {
            Ok(n) => report.detail(format!("index_entries={n}")),
            Err(err) => report.issue(format!("fingerprint index unreadable: {err:#}")),
        }
    } else {
        report.detail("index_entries=0 (no index yet)");
    }

    report
}
