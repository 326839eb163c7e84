//! Package index parsing.
//!
//! Each `Packages` file lists one stanza per `.deb`. Index files are
//! checked against the digest the (already verified) release declared
//! before a single byte of them is parsed.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use debsync_schema::control::parse_paragraphs;
use debsync_schema::{
    Checksum, ChecksumType, Compression, ControlParagraph, IndexOrigin, IndexReference,
    PackageRecord, ReleaseDescriptor,
};

use crate::checksum::{Verdict, verify_file};
use crate::config::{AllowList, SyncConfig};
use crate::error::{Result, SyncError};

/// Stanza fields kept as typed [`PackageRecord`] members rather than in
/// [`PackageRecord::fields`].
const TYPED_FIELDS: &[&str] = &[
    "Package",
    "Version",
    "Architecture",
    "Filename",
    "Size",
    "SHA256",
    "SHA512",
];

/// Records accumulated across every index of a run.
#[derive(Debug, Default, Clone)]
pub struct ParsedIndices {
    /// One record per distinct content checksum.
    pub records: BTreeMap<Checksum, PackageRecord>,
    /// Checksums listed per (release, component).
    pub component_packages: BTreeMap<(String, String), BTreeSet<Checksum>>,
}

impl ParsedIndices {
    /// Add a record. A checksum seen before only gains origins.
    pub fn insert(&mut self, record: PackageRecord) {
        for origin in &record.origins {
            self.component_packages
                .entry((origin.release.clone(), origin.component.clone()))
                .or_default()
                .insert(record.checksum.clone());
        }
        match self.records.get_mut(&record.checksum) {
            Some(existing) => existing.origins.extend(record.origins),
            None => {
                self.records.insert(record.checksum.clone(), record);
            }
        }
    }

    /// Checksums listed by a (release, component), empty if none.
    pub fn packages_for(&self, release: &str, component: &str) -> BTreeSet<Checksum> {
        self.component_packages
            .get(&(release.to_string(), component.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no record was parsed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Selects, verifies and parses package indices.
#[derive(Debug, Clone)]
pub struct PackageIndexParser {
    repo_id: String,
    feed: String,
    components: AllowList,
    architectures: AllowList,
    expected_component_count: Option<usize>,
}

impl PackageIndexParser {
    /// Parser for repository `repo_id` with the allow-lists of `config`.
    pub fn new(repo_id: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            repo_id: repo_id.into(),
            feed: config.feed.clone(),
            components: config.components.clone(),
            architectures: config.architectures.clone(),
            expected_component_count: config.expected_component_count,
        }
    }

    /// Components of `descriptor` that pass the allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnexpectedComponentCount`] if an expected count
    /// is configured and the selection differs from it.
    pub fn select_components<'d>(&self, descriptor: &'d ReleaseDescriptor) -> Result<Vec<&'d str>> {
        let selected: Vec<&str> = descriptor
            .components
            .iter()
            .map(String::as_str)
            .filter(|c| self.components.permits(c))
            .collect();

        if let Some(expected) = self.expected_component_count
            && selected.len() != expected
        {
            return Err(SyncError::UnexpectedComponentCount {
                repo_id: self.repo_id.clone(),
                feed_url: self.feed.clone(),
                expected,
                actual: selected.len(),
            });
        }
        Ok(selected)
    }

    /// Whether an index passes both allow-lists.
    pub fn accepts(&self, reference: &IndexReference) -> bool {
        self.components.permits(&reference.component)
            && self.architectures.permits(&reference.architecture)
    }

    /// Index files of `descriptor` to download.
    pub fn select<'d>(&self, descriptor: &'d ReleaseDescriptor) -> Vec<&'d IndexReference> {
        descriptor
            .references
            .iter()
            .filter(|r| self.accepts(r))
            .collect()
    }

    /// Verify a downloaded index against its release entry and merge its
    /// records into `into`. Returns the number of stanzas read.
    ///
    /// # Errors
    ///
    /// - [`SyncError::ChecksumMismatch`] if the file does not match
    /// - [`SyncError::Malformed`] if it cannot be decoded or parsed
    /// - [`SyncError::Io`] if it cannot be read
    pub async fn parse_file(
        &self,
        release: &str,
        reference: &IndexReference,
        path: &Path,
        into: &mut ParsedIndices,
    ) -> Result<usize> {
        if !self.accepts(reference) {
            tracing::debug!("Skipping {} (not in allow-list)", reference.path);
            return Ok(0);
        }

        if let Verdict::Mismatch(actual) = verify_file(path, &reference.checksum).await? {
            return Err(SyncError::ChecksumMismatch {
                repo_id: self.repo_id.clone(),
                feed_url: self.feed.clone(),
                filename: reference.path.clone(),
                expected: reference.checksum.clone(),
                actual,
            });
        }

        let raw = tokio::fs::read(path).await?;
        let file = format!("{release}/{}", reference.path);
        let text = decode(&raw, reference.compression, &file)?;

        let origin = IndexOrigin {
            release: release.to_string(),
            component: reference.component.clone(),
            architecture: reference.architecture.clone(),
        };
        let records = Self::parse_text(&text, &origin, &file)?;
        let count = records.len();
        for record in records {
            into.insert(record);
        }
        tracing::debug!("Parsed {count} stanzas from {file}");
        Ok(count)
    }

    /// Parse the text of one index.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Malformed`] on syntax errors or a stanza missing
    /// a required field.
    pub fn parse_text(text: &str, origin: &IndexOrigin, file: &str) -> Result<Vec<PackageRecord>> {
        parse_paragraphs(text)
            .map_err(|e| SyncError::control(file, &e))?
            .iter()
            .map(|p| stanza_to_record(p, origin, file))
            .collect()
    }
}

fn decode(raw: &[u8], compression: Compression, file: &str) -> Result<String> {
    match compression {
        Compression::None => String::from_utf8(raw.to_vec())
            .map_err(|e| SyncError::malformed(file, format!("not UTF-8: {e}"))),
        Compression::Gzip => {
            let mut text = String::new();
            flate2::read::GzDecoder::new(raw)
                .read_to_string(&mut text)
                .map_err(|e| SyncError::malformed(file, format!("cannot decompress: {e}")))?;
            Ok(text)
        }
    }
}

fn stanza_to_record(
    paragraph: &ControlParagraph,
    origin: &IndexOrigin,
    file: &str,
) -> Result<PackageRecord> {
    let required = |name: &str| -> Result<String> {
        paragraph
            .field_str(name)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                SyncError::malformed(
                    file,
                    format!("stanza at line {} has no {name}", paragraph.start_line()),
                )
            })
    };

    let package = required("Package")?;
    let version = required("Version")?;
    let architecture = required("Architecture")?;
    let filename = required("Filename")?;

    let checksum = ChecksumType::preferred_order()
        .find_map(|kind| paragraph.field_str(kind.field_name()).map(|v| (kind, v)))
        .ok_or_else(|| {
            SyncError::malformed(file, format!("{package} {version} has no SHA256 or SHA512"))
        })
        .and_then(|(kind, value)| {
            Checksum::new(kind, value).map_err(|e| SyncError::malformed(file, e))
        })?;

    let size = paragraph
        .field_str("Size")
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| SyncError::malformed(file, format!("{package}: bad Size '{s}'")))
        })
        .transpose()?;

    let fields = paragraph
        .fields()
        .iter()
        .filter(|f| !TYPED_FIELDS.iter().any(|t| f.name().eq_ignore_ascii_case(t)))
        .map(|f| (f.name().to_string(), f.value().to_string()))
        .collect();

    Ok(PackageRecord {
        checksum,
        filename,
        size,
        package,
        version,
        architecture,
        fields,
        origins: BTreeSet::from([origin.clone()]),
    })
}
