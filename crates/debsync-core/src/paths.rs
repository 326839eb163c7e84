//! On-disk layout of a sync's working directory.
//!
//! ```text
//! <working_dir>/
//!   releases/<release>/Release
//!   releases/<release>/Release.gpg
//!   releases/<release>/<component>/binary-<arch>/Packages[.gz]
//!   packages/<aa>/<bb>/<basename>.deb
//! ```

use std::path::{Path, PathBuf};

use debsync_schema::{Blake3Hash, IndexReference, RELEASE_FILE, RELEASE_SIGNATURE_FILE};

/// Paths under one repository's working directory.
#[derive(Debug, Clone)]
pub struct WorkingLayout {
    root: PathBuf,
}

impl WorkingLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `releases/<release>`
    pub fn release_dir(&self, release: &str) -> PathBuf {
        self.root.join("releases").join(release)
    }

    /// Local copy of a release document.
    pub fn release_file(&self, release: &str) -> PathBuf {
        self.release_dir(release).join(RELEASE_FILE)
    }

    /// Local copy of a release signature.
    pub fn signature_file(&self, release: &str) -> PathBuf {
        self.release_dir(release).join(RELEASE_SIGNATURE_FILE)
    }

    /// Local copy of a package index. The relative path comes from the
    /// release document, so `..` and absolute segments are dropped.
    pub fn index_path(&self, release: &str, reference: &IndexReference) -> PathBuf {
        let mut path = self.release_dir(release);
        for segment in reference.path.split('/') {
            if !segment.is_empty() && segment != "." && segment != ".." {
                path.push(segment);
            }
        }
        path
    }

    /// Root of the package download area.
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Download destination of a package given its `Filename`.
    pub fn package_destination(&self, filename: &str) -> PathBuf {
        self.packages_dir().join(storage_path(filename))
    }
}

/// Sharded relative path for a package file.
///
/// The two directory levels come from the BLAKE3 hash of the basename, so a
/// given name always lands in the same place and large pools spread evenly.
pub fn storage_path(filename: &str) -> PathBuf {
    let basename = filename_from_url(filename);
    let hash = Blake3Hash::compute(basename.as_bytes());
    let hex = hash.as_str();
    PathBuf::from(&hex[0..2]).join(&hex[2..4]).join(basename)
}

/// Last path segment of a URL or relative path.
pub fn filename_from_url(url: &str) -> &str {
    url.split('/').next_back().unwrap_or("")
}
