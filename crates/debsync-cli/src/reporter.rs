//! Progress output for terminal runs.

use std::sync::atomic::{AtomicUsize, Ordering};

use debsync_core::{Reporter, Stage};
use debsync_schema::UnitKind;

/// Renders pipeline events as `tracing` events on the `debsync::progress`
/// target, plus a one-line summary on stderr unless quiet.
#[derive(Debug, Default)]
pub struct LogReporter {
    quiet: bool,
    warnings: AtomicUsize,
}

impl LogReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            warnings: AtomicUsize::new(0),
        }
    }

    /// Warnings seen so far.
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}

impl Reporter for LogReporter {
    fn stage(&self, stage: Stage) {
        tracing::debug!(target: "debsync::progress", %stage, "stage");
    }

    fn downloading(&self, what: &str, count: usize) {
        if count > 0 {
            tracing::info!(target: "debsync::progress", "Fetching {count} {what}");
        }
    }

    fn saved(&self, filename: &str, size: Option<u64>) {
        match size {
            Some(size) => tracing::info!(target: "debsync::progress", "Saved {filename} ({size} bytes)"),
            None => tracing::info!(target: "debsync::progress", "Saved {filename}"),
        }
    }

    fn removed(&self, kind: UnitKind, description: &str) {
        tracing::info!(target: "debsync::progress", "Removed {kind} {description}");
    }

    fn warning(&self, msg: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(target: "debsync::progress", "{msg}");
    }

    fn summary(&self, added: usize, removed: usize, elapsed_secs: f64) {
        if !self.quiet {
            eprintln!("Added {added}, removed {removed} in {elapsed_secs:.1}s");
        }
    }
}
