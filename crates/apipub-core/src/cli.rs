//! Command-line definitions for the `apipub` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// API Publisher - replicate changed data between two resource APIs
#[derive(Parser, Debug)]
#[command(name = "apipub")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish key changes, upserts and deletes from source to target
    Publish {
        /// Publisher configuration file (TOML)
        #[arg(short, long, env = "APIPUB_CONFIG")]
        config: PathBuf,

        /// Only publish changes at or after this change version
        #[arg(long)]
        min_change_version: Option<i64>,

        /// Only publish changes at or before this change version
        #[arg(long)]
        max_change_version: Option<i64>,

        /// Append unrecoverable errors to this JSON-lines file
        #[arg(long)]
        errors_file: Option<PathBuf>,

        /// Remediation plans keyed by `{resource}/{status}` (JSON)
        #[arg(long)]
        remediations: Option<PathBuf>,

        /// Resource dependencies, overriding the configuration file (JSON)
        #[arg(long)]
        dependencies: Option<PathBuf>,
    },
}
