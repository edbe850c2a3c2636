pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    about = "Courier operator CLI",
    long_about = "Inspect courier configuration and check relay readiness before starting the server.",
    after_help = "Examples:\n  courier doctor --json\n  courier config\n  courier --config ./courier.toml doctor"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a courier.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, webhook target, upstream key and registration readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Command::Config => commands::config::run(config_path),
        Command::Doctor { json } => commands::doctor::run(json, config_path),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
