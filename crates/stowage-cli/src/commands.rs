//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Archive a directory and upload it under a key
    Save {
        /// Bucket name without the gs:// prefix
        #[arg(short, long, env = "STOWAGE_BUCKET")]
        bucket: String,

        /// Directory to cache
        #[arg(short, long)]
        dir: PathBuf,

        /// Key to cache under; may contain {{ hashGlob "PATTERN" }}
        #[arg(short, long)]
        key: String,

        /// Exit successfully even if the save fails
        #[arg(long)]
        allow_failure: bool,
    },

    /// Restore the freshest of several keys into a directory
    Restore {
        /// Bucket name without the gs:// prefix
        #[arg(short, long, env = "STOWAGE_BUCKET")]
        bucket: String,

        /// Directory to restore into
        #[arg(short, long)]
        dir: PathBuf,

        /// Keys to search, most specific first (repeatable, comma-separated)
        #[arg(short, long = "key", required = true)]
        keys: Vec<String>,

        /// Exit successfully even if the restore fails
        #[arg(long)]
        allow_failure: bool,
    },

    /// Print the hash of every file matching a glob pattern
    Hash {
        /// Glob pattern
        pattern: String,
    },

    /// List cached objects
    List {
        /// Bucket name without the gs:// prefix
        #[arg(short, long, env = "STOWAGE_BUCKET")]
        bucket: String,

        /// Only list keys starting with this prefix
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Configuration value
        value: String,
    },
}
