//! Content digests.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Errors raised while validating a checksum string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// The digest does not have the length the algorithm produces.
    #[error("Invalid {kind} digest: expected {expected} hex characters, got {actual} in '{value}'")]
    Length {
        /// Algorithm the digest was declared with.
        kind: ChecksumType,
        /// Hex length the algorithm produces.
        expected: usize,
        /// Length of the rejected value.
        actual: usize,
        /// The rejected value.
        value: String,
    },

    /// The digest contains characters outside `[0-9a-fA-F]`.
    #[error("Invalid {kind} digest: contains non-hex characters in '{value}'")]
    NotHex {
        /// Algorithm the digest was declared with.
        kind: ChecksumType,
        /// The rejected value.
        value: String,
    },
}

/// Digest algorithm used by APT metadata.
///
/// `Release` files carry one checksum table per algorithm and `Packages`
/// stanzas carry one field per algorithm. Only the SHA-2 family is trusted;
/// `MD5Sum` and `SHA1` tables are ignored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// SHA-256, the algorithm every current archive publishes.
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
}

impl ChecksumType {
    /// Variants in the order they should be preferred.
    pub fn preferred_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Sha256, Self::Sha512].into_iter()
    }

    /// Name of the control field holding this digest, in both `Release`
    /// checksum tables and `Packages` stanzas.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Length of a hex-encoded digest of this type.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    /// Start a streaming hasher for this algorithm.
    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            Self::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
            Self::Sha512 => ChecksumHasher::Sha512(Sha512::new()),
        }
    }

    /// Hash an in-memory buffer.
    pub fn digest(&self, data: &[u8]) -> Checksum {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl std::fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Incremental hasher producing a [`Checksum`].
#[derive(Debug, Clone)]
pub enum ChecksumHasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// SHA-512 state.
    Sha512(Sha512),
}

impl ChecksumHasher {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the digest.
    pub fn finalize(self) -> Checksum {
        match self {
            Self::Sha256(h) => Checksum {
                kind: ChecksumType::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Self::Sha512(h) => Checksum {
                kind: ChecksumType::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

/// A validated content digest: the identity of a package file.
///
/// The hex string is normalized to lowercase so that two spellings of the
/// same digest compare equal. Ordering is by algorithm, then digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Checksum {
    kind: ChecksumType,
    hex: String,
}

impl Checksum {
    /// Validate and build a checksum of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not exactly [`ChecksumType::hex_len`]
    /// ASCII hex characters.
    pub fn new(kind: ChecksumType, value: &str) -> Result<Self, ChecksumError> {
        let value = value.trim();
        if value.len() != kind.hex_len() {
            return Err(ChecksumError::Length {
                kind,
                expected: kind.hex_len(),
                actual: value.len(),
                value: value.to_string(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::NotHex {
                kind,
                value: value.to_string(),
            });
        }
        Ok(Self {
            kind,
            hex: value.to_ascii_lowercase(),
        })
    }

    /// Shorthand for [`Checksum::new`] with SHA-256.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not 64 hex characters.
    pub fn sha256(value: &str) -> Result<Self, ChecksumError> {
        Self::new(ChecksumType::Sha256, value)
    }

    /// Algorithm that produced this digest.
    pub fn kind(&self) -> ChecksumType {
        self.kind
    }

    /// Lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.hex
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.hex)
    }
}

impl AsRef<str> for Checksum {
    fn as_ref(&self) -> &str {
        &self.hex
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            kind: ChecksumType,
            hex: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        Self::new(raw.kind, &raw.hex).map_err(serde::de::Error::custom)
    }
}

/// BLAKE3 hash for internal layout decisions (storage sharding).
///
/// BLAKE3 is used where the hash never leaves this machine; upstream
/// integrity is always checked with the digest the archive published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blake3Hash(String);

impl Blake3Hash {
    /// Compute BLAKE3 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(hash.to_hex().to_string())
    }

    /// Return the inner hex string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
