//! Typed failures of a sync run.
//!
//! Every variant carries structured fields so a host can classify a failure
//! without parsing the message. Codes are stable across releases.

use std::path::PathBuf;

use debsync_schema::{Checksum, ControlError};
use thiserror::Error;

use crate::download::DownloadError;
use crate::keyring::KeyringError;
use crate::store::StoreError;

/// Result alias used throughout the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or contradictory configuration; fix the config and rerun.
    Configuration,
    /// Network or download failure.
    Transport,
    /// Signature or key problem.
    Trust,
    /// Content did not match its declared digest.
    Integrity,
    /// Metadata was malformed or inconsistent with expectations.
    Consistency,
    /// The content store or local filesystem failed.
    Storage,
}

/// Every way a sync run can fail.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The release metadata lists a different number of components than the
    /// repository is configured to expect.
    #[error(
        "Unable to sync {repo_id} from {feed_url}: expected {expected} component(s), got {actual}"
    )]
    UnexpectedComponentCount {
        /// Repository being synced.
        repo_id: String,
        /// Configured feed.
        feed_url: String,
        /// Configured cardinality.
        expected: usize,
        /// Components actually found.
        actual: usize,
    },

    /// A downloaded file did not hash to the digest the metadata declared.
    #[error(
        "Unable to sync {repo_id} from {feed_url}: mismatching checksums for {filename}: expected {expected}, actual {actual}"
    )]
    ChecksumMismatch {
        /// Repository being synced.
        repo_id: String,
        /// Configured feed.
        feed_url: String,
        /// Base name of the offending file.
        filename: String,
        /// Declared digest.
        expected: Checksum,
        /// Digest of the bytes on disk.
        actual: Checksum,
    },

    /// A signature is required but the release has none.
    #[error(
        "Release {release} has no detached signature at {}; cannot verify release integrity",
        .path.display()
    )]
    MissingSignature {
        /// Configured release name.
        release: String,
        /// Where the signature was expected.
        path: PathBuf,
    },

    /// The verifier rejected the release signature.
    #[error("Verification of release {release} failed (signer: {}): {diagnostic}", .signer.as_deref().unwrap_or("unknown"))]
    UntrustedRelease {
        /// Configured release name.
        release: String,
        /// Fingerprint of the signing key, when the verifier could tell.
        signer: Option<String>,
        /// Verifier output.
        diagnostic: String,
    },

    /// The keyring could not obtain or use a trusted key.
    #[error("Keyring error: {0}")]
    Keyring(#[from] KeyringError),

    /// A required download did not complete.
    #[error("Failed to download {url}: {source}")]
    Download {
        /// Source URL.
        url: String,
        /// Underlying transport failure.
        #[source]
        source: DownloadError,
    },

    /// Metadata could not be parsed or lacked a required field.
    #[error("Malformed {file}: {reason}")]
    Malformed {
        /// File (or URL) being parsed.
        file: String,
        /// What was wrong.
        reason: String,
    },

    /// Configuration rejected before any I/O.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The content store failed.
    #[error("Content store error: {0}")]
    Store(#[from] StoreError),

    /// Local filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An index lists content for which no unit was stored this run.
    #[error("Package {checksum} listed in {release}/{component} has no stored unit")]
    UnstoredPackage {
        /// Configured release name.
        release: String,
        /// Component whose index lists the package.
        component: String,
        /// Digest of the listed content.
        checksum: Checksum,
    },
}

impl SyncError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnexpectedComponentCount { .. } => "DEBSYNC001",
            Self::ChecksumMismatch { .. } => "DEBSYNC002",
            Self::MissingSignature { .. } => "DEBSYNC003",
            Self::UntrustedRelease { .. } => "DEBSYNC004",
            Self::Keyring(_) => "DEBSYNC005",
            Self::Download { .. } => "DEBSYNC006",
            Self::Malformed { .. } => "DEBSYNC007",
            Self::Config(_) => "DEBSYNC008",
            Self::Store(_) => "DEBSYNC009",
            Self::Io(_) => "DEBSYNC010",
            Self::UnstoredPackage { .. } => "DEBSYNC011",
        }
    }

    /// Category of the failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Configuration,
            Self::Download { .. } => ErrorClass::Transport,
            Self::MissingSignature { .. } | Self::UntrustedRelease { .. } | Self::Keyring(_) => {
                ErrorClass::Trust
            }
            Self::ChecksumMismatch { .. } => ErrorClass::Integrity,
            Self::UnexpectedComponentCount { .. }
            | Self::Malformed { .. }
            | Self::UnstoredPackage { .. } => ErrorClass::Consistency,
            Self::Store(_) | Self::Io(_) => ErrorClass::Storage,
        }
    }

    /// Returns `true` if re-invoking the sync later might succeed without
    /// any change to configuration or to the remote repository.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download { source, .. } => source.is_transient(),
            Self::Keyring(err) => err.is_transient(),
            Self::Io(_) => true,
            _ => false,
        }
    }

    pub(crate) fn malformed(file: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn control(file: impl Into<String>, err: &ControlError) -> Self {
        Self::malformed(file, err)
    }
}
