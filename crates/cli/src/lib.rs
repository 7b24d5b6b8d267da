pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "leadroute",
    about = "Leadroute operator CLI",
    long_about = "Operate the lead assignment service: migrations, demo rules, config inspection, readiness checks and rule matching.",
    after_help = "Examples:\n  leadroute doctor --json\n  leadroute seed\n  leadroute match --funnel roofing --zip 90210"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo routing rules")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity and schema readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Explain which stored rules a lead would match, in assignment order")]
    Match {
        #[arg(long, help = "Funnel id of the hypothetical lead")]
        funnel: String,
        #[arg(long, default_value = "", help = "ZIP code of the hypothetical lead")]
        zip: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Match { funnel, zip } => commands::matching::run(&funnel, &zip),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
