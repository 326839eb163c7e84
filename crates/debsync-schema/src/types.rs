//! Release, index and unit types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::hash::Checksum;

/// File-level compression of an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Plain text.
    None,
    /// Gzip (`.gz`).
    Gzip,
}

impl Compression {
    /// Variants in the order they should be preferred when a release lists
    /// the same index in several encodings. Mirrors commonly list a plain
    /// `Packages` they do not serve, so the compressed file comes first.
    pub fn preferred_order() -> impl Iterator<Item = Compression> {
        [Self::Gzip, Self::None].into_iter()
    }

    /// File name suffix, including the dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
        }
    }
}

/// A package index file advertised by a `Release` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReference {
    /// Component the index belongs to, e.g. `main` or `updates/main`.
    pub component: String,
    /// Debian architecture, e.g. `amd64`.
    pub architecture: String,
    /// Path relative to `dists/<release>/`.
    pub path: String,
    /// Digest the release declares for the file.
    pub checksum: Checksum,
    /// Size the release declares for the file.
    pub size: u64,
    /// Encoding of the file.
    pub compression: Compression,
}

/// Typed view of a verified `Release` document.
///
/// Built once per configured release name and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    /// Release name as configured, i.e. the directory under `dists/`.
    pub name: String,
    /// `Codename` field, e.g. `bookworm`.
    pub codename: String,
    /// `Suite` field, e.g. `stable`.
    pub suite: String,
    /// Components the release advertises.
    pub components: BTreeSet<String>,
    /// Architectures the release advertises.
    pub architectures: BTreeSet<String>,
    /// Package indices, one per (component, architecture) the release lists
    /// a file for, ordered by component then architecture.
    pub references: Vec<IndexReference>,
}

impl ReleaseDescriptor {
    /// Find the index reference for a (component, architecture) pair.
    pub fn reference(&self, component: &str, architecture: &str) -> Option<&IndexReference> {
        self.references
            .iter()
            .find(|r| r.component == component && r.architecture == architecture)
    }
}

/// Where a package record was listed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexOrigin {
    /// Configured release name.
    pub release: String,
    /// Component of the index.
    pub component: String,
    /// Architecture of the index (not of the package: `all` packages appear
    /// in every architecture's index).
    pub architecture: String,
}

/// A package as described by a package index.
///
/// The checksum is the identity: a record is created the first time a digest
/// is seen and later sightings only add to [`origins`](Self::origins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Content digest of the `.deb`.
    pub checksum: Checksum,
    /// Download path relative to the repository root (`Filename`).
    pub filename: String,
    /// Declared size in bytes, when the index lists one.
    pub size: Option<u64>,
    /// `Package` field.
    pub package: String,
    /// `Version` field.
    pub version: String,
    /// `Architecture` field.
    pub architecture: String,
    /// Every other field of the stanza (first line only), keyed by field
    /// name as written.
    pub fields: BTreeMap<String, String>,
    /// Indices that listed this content.
    pub origins: BTreeSet<IndexOrigin>,
}

impl PackageRecord {
    /// Last path segment of [`filename`](Self::filename).
    pub fn basename(&self) -> &str {
        self.filename.rsplit('/').next().unwrap_or(&self.filename)
    }
}

/// Kind tag of a persisted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// A release identity (codename + suite).
    Release,
    /// A (release, component) pair carrying a package set.
    Component,
    /// Package content.
    Package,
}

impl UnitKind {
    /// All kinds, in orphan-removal order.
    pub const ALL: [UnitKind; 3] = [Self::Release, Self::Component, Self::Package];
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Component => write!(f, "component"),
            Self::Package => write!(f, "package"),
        }
    }
}

/// Store-assigned identity of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Natural key of a unit: the kind tag plus the fields that make it unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UnitKey {
    /// Release identity.
    Release {
        /// `Codename` of the release.
        codename: String,
        /// `Suite` of the release.
        suite: String,
    },
    /// Component of a release.
    Component {
        /// Owning release unit.
        release: UnitId,
        /// Component name.
        name: String,
    },
    /// Package content.
    Package {
        /// Content digest.
        checksum: Checksum,
    },
}

impl UnitKey {
    /// Kind tag of this key.
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Release { .. } => UnitKind::Release,
            Self::Component { .. } => UnitKind::Component,
            Self::Package { .. } => UnitKind::Package,
        }
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release { codename, suite } => write!(f, "release {codename}/{suite}"),
            Self::Component { release, name } => write!(f, "component {name} of {release}"),
            Self::Package { checksum } => write!(f, "package {checksum}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ChecksumType;

    fn record(filename: &str) -> PackageRecord {
        PackageRecord {
            checksum: ChecksumType::Sha256.digest(filename.as_bytes()),
            filename: filename.to_string(),
            size: None,
            package: "hello".to_string(),
            version: "1.0".to_string(),
            architecture: "amd64".to_string(),
            fields: BTreeMap::new(),
            origins: BTreeSet::new(),
        }
    }

    #[test]
    fn basename_strips_pool_path() {
        assert_eq!(
            record("pool/main/h/hello/hello_1.0_amd64.deb").basename(),
            "hello_1.0_amd64.deb"
        );
        assert_eq!(record("flat.deb").basename(), "flat.deb");
    }

    #[test]
    fn unit_key_reports_kind() {
        let key = UnitKey::Component {
            release: UnitId(3),
            name: "main".to_string(),
        };
        assert_eq!(key.kind(), UnitKind::Component);
        assert_eq!(key.to_string(), "component main of #3");
    }

    #[test]
    fn compressed_index_is_preferred() {
        assert_eq!(
            Compression::preferred_order().collect::<Vec<_>>(),
            vec![Compression::Gzip, Compression::None]
        );
    }
}
