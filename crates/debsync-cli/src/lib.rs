//! debsync - APT repository mirroring
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Command-line host for `debsync-core`. It wires the HTTP downloader, the
//! local content store and the gpg keyring into a [`SyncPipeline`] and
//! renders progress through `tracing`.
//!
//! # Store Layout
//!
//! ```text
//! <store>/
//! ├── content/    # Package blobs by sha256
//! └── state.db    # SQLite: units, associations, component package lists
//! ```
//!
//! [`SyncPipeline`]: debsync_core::SyncPipeline

pub mod cmd;
pub mod reporter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "debsync")]
#[command(author, version, about = "debsync - mirror APT repositories")]
pub struct Cli {
    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync a repository from its upstream feed
    Sync {
        /// Repository identifier in the store
        #[arg(long)]
        repo: String,
        /// TOML configuration file
        #[arg(long, short = 'c', required_unless_present = "set")]
        config: Option<PathBuf>,
        /// Flat `key=value` option (repeatable), instead of a config file
        #[arg(long = "set", value_name = "KEY=VALUE", conflicts_with = "config")]
        set: Vec<String>,
        /// Content store directory
        #[arg(long, env = "DEBSYNC_STORE")]
        store: PathBuf,
        /// Override the configured working directory
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show what a repository currently holds
    Status {
        /// Repository identifier in the store
        #[arg(long)]
        repo: String,
        /// Content store directory
        #[arg(long, env = "DEBSYNC_STORE")]
        store: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}
