use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};

#[derive(Debug, Parser)]
#[command(name = "ifupload")]
#[command(about = "IF Archive upload intake and IFDB reconciliation")]
#[command(version)]
struct Cli {
    /// Print command reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Handle one upload request from the CGI environment and stdin
    Cgi,
    /// Report the archive path of landed files to IFDB
    Reconcile {
        /// Don't ask for an ID when none is stored
        #[arg(short = 'n', long, overrides_with = "interactive")]
        non_interactive: bool,
        /// Ask for an ID when none is stored [default]
        #[arg(short = 'i', long, overrides_with = "non_interactive")]
        interactive: bool,
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    /// Show incoming area occupancy and store sizes
    Status,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        for line in &report.details {
            println!("{line}");
        }
        for line in &report.issues {
            eprintln!("{line}");
        }
    }
    if !report.ok {
        anyhow::bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        // web servers run the binary bare
        None if std::env::var_os("GATEWAY_INTERFACE").is_some() => Command::Cgi,
        None => {
            Cli::command().print_help()?;
            return Ok(());
        }
    };

    match command {
        Command::Cgi => commands::upload_cgi::run(),
        Command::Reconcile {
            non_interactive,
            interactive: _,
            files,
        } => print_report(
            &commands::reconcile::run(&files, !non_interactive, cli.json)?,
            cli.json,
        ),
        Command::Status => print_report(&commands::status::run()?, cli.json),
    }
}
