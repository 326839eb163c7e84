//! Core of debsync: mirrors a remote APT repository into a local content
//! store.
//!
//! The entry point is [`SyncPipeline`]. It drives the parsers in
//! [`release`] and [`packages`], the set arithmetic in [`reconcile`], and the
//! three collaborators a host has to provide: a [`Downloader`], a
//! [`ContentStore`] and a [`KeyringVerifier`]. Concrete implementations of
//! each live next to their traits.

pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod keyring;
pub mod packages;
pub mod paths;
pub mod pipeline;
pub mod reconcile;
pub mod release;
pub mod reporter;
pub mod retry;
pub mod store;

pub use config::{AllowList, SyncConfig};
pub use download::{DownloadOutcome, DownloadRequest, Downloader, HttpDownloader};
pub use error::{ErrorClass, Result, SyncError};
pub use keyring::{GpgKeyring, KeyringVerifier, Verification};
pub use pipeline::{Stage, SyncPipeline, SyncReport};
pub use reporter::{NullReporter, Reporter};
pub use store::{ContentStore, LocalStore};

/// User Agent string for outgoing requests
pub const USER_AGENT: &str = concat!("debsync/", env!("CARGO_PKG_VERSION"));
