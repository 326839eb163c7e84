//! OpenPGP verification of release documents.
//!
//! [`KeyringVerifier`] is the seam the pipeline verifies through.
//! [`GpgKeyring`] implements it by shelling out to `gpg` with a private
//! home directory, reading the machine-readable `--status-fd` output rather
//! than the human-readable messages.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::retry::{RetryAction, RetryConfig, retry_with_backoff};

/// Result of verifying one detached signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// The signature is good and was made by a trusted key.
    pub valid: bool,
    /// Fingerprint of the signing key, when the verifier could tell.
    pub signer: Option<String>,
    /// Human-readable explanation, mostly useful when `valid` is false.
    pub diagnostic: String,
}

/// Keyring failures. A *bad signature* is not an error: it is a
/// [`Verification`] with `valid == false`.
#[derive(Error, Debug)]
pub enum KeyringError {
    /// No `gpg` binary on `PATH`.
    #[error("gpg executable not found in PATH")]
    GpgNotFound,

    /// A gpg invocation exceeded its time budget and was killed.
    #[error("gpg did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The keyserver did not deliver the key.
    #[error("could not fetch key {fingerprint} from {keyserver}: {stderr}")]
    KeyFetch {
        /// Requested fingerprint.
        fingerprint: String,
        /// Keyserver asked.
        keyserver: String,
        /// gpg's stderr.
        stderr: String,
    },

    /// Spawning gpg or staging its input failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyringError {
    /// Whether trying again could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::KeyFetch { .. })
    }
}

/// Signature verification against a set of trusted fingerprints.
#[async_trait]
pub trait KeyringVerifier: Send + Sync {
    /// Make sure the key is available locally, fetching it from `keyserver`
    /// if needed.
    async fn ensure_key(&self, fingerprint: &str, keyserver: &str) -> Result<(), KeyringError>;

    /// Check `signature` over `document`. Valid only if the signer is one of
    /// `trusted`.
    async fn verify(
        &self,
        document: &[u8],
        signature: &[u8],
        trusted: &[String],
    ) -> Result<Verification, KeyringError>;
}

/// Whether `candidate` is the same full fingerprint as `trusted`.
///
/// Both sides are compared without spaces and case. Key ids never match:
/// a fingerprint suffix can be forged with a vanity key.
pub fn fingerprint_matches(candidate: &str, trusted: &str) -> bool {
    let norm = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase()
    };
    let candidate = norm(candidate);
    let trusted = norm(trusted);
    !trusted.is_empty() && candidate == trusted
}

/// What gpg reported on its status channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// `VALIDSIG`: (signing subkey, primary key).
    pub valid_sig: Option<(String, String)>,
    /// `BADSIG` was reported.
    pub bad_sig: bool,
    /// Key id from `ERRSIG` / `NO_PUBKEY`.
    pub missing_key: Option<String>,
    /// Keywords seen, in order, for diagnostics.
    pub keywords: Vec<String>,
}

/// Parse `[GNUPG:]` status lines.
pub fn parse_status(output: &str) -> StatusReport {
    let mut report = StatusReport::default();
    for line in output.lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let mut words = rest.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();
        match keyword {
            "VALIDSIG" => {
                if let Some(signing) = args.first() {
                    // The primary key fingerprint is the last argument on
                    // modern gpg; older versions omit it.
                    let primary = args.get(9).unwrap_or(signing);
                    report.valid_sig = Some(((*signing).to_string(), (*primary).to_string()));
                }
            }
            "BADSIG" => report.bad_sig = true,
            "ERRSIG" | "NO_PUBKEY" => {
                if let Some(key) = args.first() {
                    report.missing_key = Some((*key).to_string());
                }
            }
            _ => {}
        }
        report.keywords.push(keyword.to_string());
    }
    report
}

/// Turn a status report into a verdict against the trusted set.
pub fn evaluate(report: &StatusReport, trusted: &[String]) -> Verification {
    if report.bad_sig {
        return Verification {
            valid: false,
            signer: report.valid_sig.as_ref().map(|(_, p)| p.clone()),
            diagnostic: "BADSIG: signature does not match the document".to_string(),
        };
    }
    match &report.valid_sig {
        Some((signing, primary)) => {
            let trusted_signer = trusted
                .iter()
                .any(|t| fingerprint_matches(signing, t) || fingerprint_matches(primary, t));
            Verification {
                valid: trusted_signer,
                signer: Some(primary.clone()),
                diagnostic: if trusted_signer {
                    format!("good signature from {primary}")
                } else {
                    format!("signed by {primary}, which is not in allowed_keys")
                },
            }
        }
        None => Verification {
            valid: false,
            signer: report.missing_key.clone(),
            diagnostic: match &report.missing_key {
                Some(key) => format!("no public key available for {key}"),
                None if report.keywords.is_empty() => "gpg reported no signature".to_string(),
                None => format!("no valid signature ({})", report.keywords.join(" ")),
            },
        },
    }
}

struct GpgOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// [`KeyringVerifier`] backed by the `gpg` command line tool.
#[derive(Debug, Clone)]
pub struct GpgKeyring {
    gpg: PathBuf,
    home: PathBuf,
    timeout: Duration,
    retry: RetryConfig,
}

impl GpgKeyring {
    /// Locate `gpg` on `PATH` and use `home` as its home directory.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::GpgNotFound`] if neither `gpg` nor `gpg2` is
    /// installed, or an I/O error if `home` cannot be created.
    pub fn new(home: impl Into<PathBuf>, timeout: Duration) -> Result<Self, KeyringError> {
        let gpg = which::which("gpg")
            .or_else(|_| which::which("gpg2"))
            .map_err(|_| KeyringError::GpgNotFound)?;
        Self::with_executable(gpg, home, timeout)
    }

    /// Use a specific gpg binary.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `home` cannot be created.
    pub fn with_executable(
        gpg: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, KeyringError> {
        let home = home.into();
        create_private_dir(&home)?;
        Ok(Self {
            gpg: gpg.into(),
            home,
            timeout,
            retry: RetryConfig::default(),
        })
    }

    /// Retry policy for keyserver fetches.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn run(&self, args: Vec<OsString>) -> Result<GpgOutput, KeyringError> {
        let gpg = self.gpg.clone();
        let home = self.home.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || run_gpg(&gpg, &home, &args, timeout))
            .await
            .map_err(|e| KeyringError::Io(std::io::Error::other(e)))?
    }

    async fn has_key(&self, fingerprint: &str) -> Result<bool, KeyringError> {
        let out = self
            .run(vec!["--list-keys".into(), fingerprint.into()])
            .await?;
        Ok(out.success)
    }
}

#[async_trait]
impl KeyringVerifier for GpgKeyring {
    async fn ensure_key(&self, fingerprint: &str, keyserver: &str) -> Result<(), KeyringError> {
        if self.has_key(fingerprint).await? {
            tracing::debug!("Key {fingerprint} already in keyring");
            return Ok(());
        }

        tracing::info!("Fetching key {fingerprint} from {keyserver}");
        retry_with_backoff(
            &self.retry,
            |e: &KeyringError| {
                if e.is_transient() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || async {
                let out = self
                    .run(vec![
                        "--keyserver".into(),
                        keyserver.into(),
                        "--recv-keys".into(),
                        fingerprint.into(),
                    ])
                    .await?;
                if out.success {
                    Ok(())
                } else {
                    Err(KeyringError::KeyFetch {
                        fingerprint: fingerprint.to_string(),
                        keyserver: keyserver.to_string(),
                        stderr: out.stderr.trim().to_string(),
                    })
                }
            },
        )
        .await
    }

    async fn verify(
        &self,
        document: &[u8],
        signature: &[u8],
        trusted: &[String],
    ) -> Result<Verification, KeyringError> {
        let staging = tempfile::tempdir()?;
        let doc_path = staging.path().join("Release");
        let sig_path = staging.path().join("Release.gpg");
        tokio::fs::write(&doc_path, document).await?;
        tokio::fs::write(&sig_path, signature).await?;

        let out = self
            .run(vec![
                "--verify".into(),
                sig_path.into_os_string(),
                doc_path.into_os_string(),
            ])
            .await?;

        let report = parse_status(&out.stdout);
        let mut verification = evaluate(&report, trusted);
        if !verification.valid && !out.stderr.trim().is_empty() {
            verification.diagnostic = format!("{}; gpg: {}", verification.diagnostic, out.stderr.trim());
        }
        Ok(verification)
    }
}

fn run_gpg(
    gpg: &Path,
    home: &Path,
    args: &[OsString],
    timeout: Duration,
) -> Result<GpgOutput, KeyringError> {
    let mut child = Command::new(gpg)
        .arg("--homedir")
        .arg(home)
        .args(["--batch", "--no-tty", "--status-fd", "1"])
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain both pipes while waiting so a chatty gpg cannot block on write.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let Some(status) = child.wait_timeout(timeout)? else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(KeyringError::Timeout(timeout));
    };

    let collect = |handle: Option<std::thread::JoinHandle<String>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    Ok(GpgOutput {
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
