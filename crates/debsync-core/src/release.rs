//! Release document parsing and verification.
//!
//! A `Release` file is a single deb822 paragraph. Besides identity fields
//! (`Codename`, `Suite`) and the advertised `Components` and
//! `Architectures`, it carries one checksum table per digest algorithm:
//!
//! ```text
//! SHA256:
//!  <digest> <size> main/binary-amd64/Packages
//!  <digest> <size> main/binary-amd64/Packages.gz
//! ```
//!
//! Only files listed in a trusted table are ever fetched, so the descriptor
//! produced here is the root of trust for the rest of the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use debsync_schema::control::parse_paragraphs;
use debsync_schema::{
    Checksum, ChecksumType, Compression, ControlParagraph, IndexReference, ReleaseDescriptor,
};

use crate::error::{Result, SyncError};
use crate::keyring::KeyringVerifier;

/// A fetched release document and, if it was available, its signature.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseFiles<'a> {
    /// Configured release name.
    pub name: &'a str,
    /// Release document bytes.
    pub document: &'a [u8],
    /// Detached signature bytes, when one was fetched.
    pub signature: Option<&'a [u8]>,
    /// Where the signature was expected, for diagnostics.
    pub signature_path: &'a Path,
}

/// Turns release documents into [`ReleaseDescriptor`]s.
#[derive(Debug, Clone, Default)]
pub struct ReleaseIndexParser {
    require_signature: bool,
    allowed_keys: Vec<String>,
}

impl ReleaseIndexParser {
    /// Parser that enforces signatures from `allowed_keys` when
    /// `require_signature` is set.
    pub fn new(require_signature: bool, allowed_keys: Vec<String>) -> Self {
        Self {
            require_signature,
            allowed_keys,
        }
    }

    /// Whether [`parse`](Self::parse) will check signatures.
    pub fn requires_signature(&self) -> bool {
        self.require_signature
    }

    /// Check the release signature when one is required.
    ///
    /// # Errors
    ///
    /// - [`SyncError::MissingSignature`] if no signature was fetched
    /// - [`SyncError::UntrustedRelease`] if the verifier rejects it
    /// - [`SyncError::Config`] if signatures are required but no verifier
    ///   was supplied
    /// - [`SyncError::Keyring`] if the verifier itself failed
    pub async fn verify(
        &self,
        files: ReleaseFiles<'_>,
        keyring: Option<&dyn KeyringVerifier>,
    ) -> Result<()> {
        if !self.require_signature {
            return Ok(());
        }
        let Some(signature) = files.signature else {
            return Err(SyncError::MissingSignature {
                release: files.name.to_string(),
                path: files.signature_path.to_path_buf(),
            });
        };
        let keyring = keyring.ok_or_else(|| {
            SyncError::Config("require_signature is set but no keyring is configured".to_string())
        })?;

        let verification = keyring
            .verify(files.document, signature, &self.allowed_keys)
            .await?;
        if !verification.valid {
            return Err(SyncError::UntrustedRelease {
                release: files.name.to_string(),
                signer: verification.signer,
                diagnostic: verification.diagnostic,
            });
        }
        tracing::info!(
            "Release {} signed by {}",
            files.name,
            verification.signer.as_deref().unwrap_or("trusted key")
        );
        Ok(())
    }

    /// Verify, then parse.
    ///
    /// # Errors
    ///
    /// Any error from [`verify`](Self::verify) or
    /// [`parse_unverified`](Self::parse_unverified).
    pub async fn parse(
        &self,
        files: ReleaseFiles<'_>,
        keyring: Option<&dyn KeyringVerifier>,
    ) -> Result<ReleaseDescriptor> {
        self.verify(files, keyring).await?;
        Self::parse_unverified(files.name, files.document)
    }

    /// Parse a release document without looking at any signature.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Malformed`] if the document is not a release
    /// paragraph with an identity, components, architectures and a usable
    /// checksum table.
    pub fn parse_unverified(name: &str, document: &[u8]) -> Result<ReleaseDescriptor> {
        let file = format!("{name}/Release");
        let text = std::str::from_utf8(document)
            .map_err(|e| SyncError::malformed(&file, format!("not UTF-8: {e}")))?;
        let paragraphs = parse_paragraphs(text).map_err(|e| SyncError::control(&file, &e))?;
        let paragraph = paragraphs
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::malformed(&file, "empty document"))?;

        let suite = non_empty(paragraph.field_str("Suite"));
        let codename = non_empty(paragraph.field_str("Codename"));
        let (codename, suite) = match (codename, suite) {
            (Some(c), Some(s)) => (c.to_string(), s.to_string()),
            (Some(c), None) => (c.to_string(), name.to_string()),
            (None, Some(s)) => (s.to_string(), s.to_string()),
            (None, None) => {
                return Err(SyncError::malformed(&file, "neither Codename nor Suite is set"));
            }
        };

        let components = word_set(&paragraph, "Components")
            .ok_or_else(|| SyncError::malformed(&file, "missing Components"))?;
        let architectures = word_set(&paragraph, "Architectures")
            .ok_or_else(|| SyncError::malformed(&file, "missing Architectures"))?;

        let table = checksum_table(&paragraph, &file)?;

        let mut references = Vec::new();
        for component in &components {
            for architecture in &architectures {
                let base = format!("{component}/binary-{architecture}/Packages");
                let found = Compression::preferred_order().find_map(|compression| {
                    let path = format!("{base}{}", compression.suffix());
                    table.get(&path).map(|(checksum, size)| IndexReference {
                        component: component.clone(),
                        architecture: architecture.clone(),
                        path,
                        checksum: checksum.clone(),
                        size: *size,
                        compression,
                    })
                });
                match found {
                    Some(reference) => references.push(reference),
                    None => tracing::debug!(
                        "Release {name} lists no package index for {component}/{architecture}"
                    ),
                }
            }
        }

        Ok(ReleaseDescriptor {
            name: name.to_string(),
            codename,
            suite,
            components,
            architectures,
            references,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn word_set(paragraph: &ControlParagraph, field: &str) -> Option<BTreeSet<String>> {
    paragraph
        .field_words(field)
        .map(|words| words.map(str::to_string).collect())
}

/// Read the most preferred checksum table: path -> (digest, size).
fn checksum_table(
    paragraph: &ControlParagraph,
    file: &str,
) -> Result<BTreeMap<String, (Checksum, u64)>> {
    let Some(kind) = ChecksumType::preferred_order()
        .find(|kind| paragraph.field(kind.field_name()).is_some())
    else {
        return Err(SyncError::malformed(file, "no SHA256 or SHA512 checksum table"));
    };

    let mut table = BTreeMap::new();
    for line in paragraph.field_lines(kind.field_name()).into_iter().flatten() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [digest, size, path] = parts.as_slice() else {
            return Err(SyncError::malformed(
                file,
                format!("bad {} entry '{line}'", kind.field_name()),
            ));
        };
        let checksum = Checksum::new(kind, digest).map_err(|e| SyncError::malformed(file, e))?;
        let size = size
            .parse::<u64>()
            .map_err(|_| SyncError::malformed(file, format!("bad size in '{line}'")))?;
        table.insert((*path).to_string(), (checksum, size));
    }
    Ok(table)
}
