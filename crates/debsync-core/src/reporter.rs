//! Reporter trait for progress output.
//!
//! The pipeline reports what it is doing through this trait so a host can
//! render progress however it likes. Structured logs go through `tracing`
//! independently of any reporter.

use debsync_schema::UnitKind;

use crate::pipeline::Stage;

/// Receives progress events from a sync run.
pub trait Reporter: Send + Sync {
    /// A stage has started.
    fn stage(&self, stage: Stage);

    /// A download batch of `count` files is starting.
    fn downloading(&self, what: &str, count: usize);

    /// A package was verified and stored.
    fn saved(&self, filename: &str, size: Option<u64>);

    /// A unit was removed from the repository.
    fn removed(&self, kind: UnitKind, description: &str);

    /// Something unexpected that did not stop the run.
    fn warning(&self, msg: &str);

    /// The run finished.
    fn summary(&self, added: usize, removed: usize, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn stage(&self, stage: Stage) {
        (**self).stage(stage);
    }
    fn downloading(&self, what: &str, count: usize) {
        (**self).downloading(what, count);
    }
    fn saved(&self, filename: &str, size: Option<u64>) {
        (**self).saved(filename, size);
    }
    fn removed(&self, kind: UnitKind, description: &str) {
        (**self).removed(kind, description);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn summary(&self, added: usize, removed: usize, elapsed_secs: f64) {
        (**self).summary(added, removed, elapsed_secs);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn stage(&self, _stage: Stage) {}
    fn downloading(&self, _what: &str, _count: usize) {}
    fn saved(&self, _filename: &str, _size: Option<u64>) {}
    fn removed(&self, _kind: UnitKind, _description: &str) {}
    fn warning(&self, _msg: &str) {}
    fn summary(&self, _added: usize, _removed: usize, _elapsed_secs: f64) {}
}
