//! Streaming digests of files on disk.

use std::path::Path;

use debsync_schema::{Checksum, ChecksumType};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024;

/// Hash a file without loading it into memory.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub async fn checksum_file(path: &Path, kind: ChecksumType) -> std::io::Result<Checksum> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = kind.hasher();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Outcome of comparing a file against a declared digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The file hashes to the declared digest.
    Match,
    /// The file hashes to something else.
    Mismatch(Checksum),
}

/// Hash `path` with the algorithm of `expected` and compare.
///
/// # Errors
///
/// Returns any I/O error from reading the file.
pub async fn verify_file(path: &Path, expected: &Checksum) -> std::io::Result<Verdict> {
    let actual = checksum_file(path, expected.kind()).await?;
    Ok(if &actual == expected {
        Verdict::Match
    } else {
        Verdict::Mismatch(actual)
    })
}
