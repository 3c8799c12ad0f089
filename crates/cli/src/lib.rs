pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nexus_core::config::LoadOptions;

#[derive(Debug, Parser)]
#[command(
    name = "nexus",
    about = "Nexus operator CLI",
    long_about = "Inspect Nexus configuration, apply ledger migrations, and check provider and registry readiness.",
    after_help = "Examples:\n  nexus doctor --json\n  nexus config\n  nexus registries --name default"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a nexus.toml file (defaults to ./nexus.toml or ./config/nexus.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending run ledger migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, provider and registry readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Print the tool registry snapshot as JSON")]
    Registries {
        #[arg(long, help = "Only print the named registry (open_source, cloud, default)")]
        name: Option<String>,
    },
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            ..LoadOptions::default()
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Config => commands::config::run(options),
        Command::Doctor { json } => commands::doctor::run(options, json),
        Command::Registries { name } => commands::registries::run(options, name.as_deref()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
