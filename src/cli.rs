//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Reconciles grab-time vs import-time custom-format scoring drift in a
/// media manager's download queue.
#[derive(Parser, Debug)]
#[command(name = "reconciler")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "reconciler.toml")]
    pub config: PathBuf,

    /// Force dry-run regardless of the config file's `dry_run` value.
    #[arg(long)]
    pub dry_run: bool,

    /// Run a single queue scan, then exit — for operational smoke tests.
    #[arg(long)]
    pub once: bool,
}
