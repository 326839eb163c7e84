//! debsync - APT repository mirroring CLI

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use debsync_cli::cmd;
use debsync_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let quiet = cli.quiet;

    let result = match cli.command {
        Commands::Sync {
            repo,
            config,
            set,
            store,
            work_dir,
            json,
        } => {
            let source = match config {
                Some(path) => cmd::sync::ConfigSource::File(path),
                None => cmd::sync::ConfigSource::Options(set),
            };
            cmd::sync::sync(&repo, source, &store, work_dir, json, quiet).await
        }
        Commands::Status { repo, store, json } => cmd::status::status(&repo, &store, json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
