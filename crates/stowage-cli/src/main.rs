//! Stowage CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::{Backend, CliConfig, TOKEN_ENV};

#[derive(Debug, Parser)]
#[command(name = "stowage")]
#[command(author, version, about = "Cache directories in a remote object store", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(long, global = true, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Object store backend
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Cloud Storage endpoint
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Root directory for the filesystem backend
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut CliConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(root) = &self.root {
            config.root = Some(root.clone());
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = handlers::config_path(cli.config.clone())?;
    let mut config = CliConfig::load_from(&path)?;
    config.apply_env_token(std::env::var(TOKEN_ENV).ok());
    cli.apply(&mut config);

    match cli.command {
        Commands::Save {
            bucket,
            dir,
            key,
            allow_failure,
        } => handlers::save(&config, &bucket, &dir, &key, allow_failure)?,
        Commands::Restore {
            bucket,
            dir,
            keys,
            allow_failure,
        } => handlers::restore(&config, &bucket, &dir, &keys, allow_failure)?,
        Commands::Hash { pattern } => handlers::hash(&pattern)?,
        Commands::List { bucket, prefix } => handlers::list(&config, &bucket, &prefix)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config, &path)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&path, &key, &value)?,
        },
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", console::style("✗").red(), err);
            ExitCode::FAILURE
        }
    }
}
