use anyhow::Result;
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::ifdb::client::IfdbClient;
use crate::incoming::fingerprint::FingerprintIndex;
use crate::incoming::reconcile::{IdPrompt, OutcomeLine, Reconciler, StdinPrompt};

/// Outcome lines go straight to stdout as each file finishes unless `json`
/// is set, in which case they are collected into the report.
pub fn run(files: &[PathBuf], interactive: bool, json: bool) -> Result<CommandReport> {
    let cfg = crate::commands::load_runtime()?;
    let index = FingerprintIndex::open(&cfg.paths.index_file, cfg.intake.index_file_mode)?;
    let client = IfdbClient::new(&cfg.ifdb)?;

    let mut stdin_prompt = StdinPrompt;
    let prompt: Option<&mut dyn IdPrompt> = if interactive {
        Some(&mut stdin_prompt)
    } else {
        None
    };

    let mut report = CommandReport::new("reconcile");
    let outcomes =
        Reconciler::new(&cfg, &index, &client).reconcile_with(files, prompt, |file, outcome| {
            let line = OutcomeLine { file, outcome }.to_string();
            if json {
                report.detail(line);
            } else {
                println!("{line}");
            }
        });

    let unreconciled = outcomes.iter().filter(|(_, o)| !o.is_success()).count();
    if unreconciled > 0 {
        report.issue(format!(
            "{unreconciled} of {} files not reconciled",
            outcomes.len()
        ));
    }
    Ok(report)
}
