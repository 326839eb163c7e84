//! Fixtures shared by the end-to-end tests: a throwaway APT mirror on disk
//! served through `file://` URLs, plus scripted collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use debsync_core::download::{DownloadOutcome, DownloadRequest, Downloader, HttpDownloader};
use debsync_core::keyring::{KeyringError, KeyringVerifier, Verification};
use debsync_core::retry::RetryConfig;
use debsync_core::store::{ContentStore, LocalStore};
use debsync_core::{SyncConfig, SyncPipeline};
use debsync_schema::{Checksum, ChecksumType, UnitId, UnitKey};
use tempfile::TempDir;

pub const REPO: &str = "debian";
pub const TRUSTED_KEY: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

/// A `.deb` published in the mirror's pool.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub filename: String,
    pub checksum: Checksum,
    pub size: u64,
}

impl Package {
    pub fn key(&self) -> UnitKey {
        UnitKey::Package {
            checksum: self.checksum.clone(),
        }
    }

    fn stanza(&self) -> String {
        format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\nFilename: {}\nSize: {}\nSHA256: {}\nDescription: {} test package\n",
            self.name,
            self.version,
            self.architecture,
            self.filename,
            self.size,
            self.checksum.as_str(),
            self.name
        )
    }
}

/// A mirror tree under a temporary directory.
pub struct Mirror {
    dir: TempDir,
    /// (release, component, architecture) -> listed packages
    indices: BTreeMap<(String, String, String), Vec<Package>>,
    gzip: bool,
    advertise_plain: bool,
}

impl Mirror {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mirror")).unwrap();
        Self {
            dir,
            indices: BTreeMap::new(),
            gzip: false,
            advertise_plain: false,
        }
    }

    /// Publish indices gzip-compressed from now on.
    pub fn gzip(mut self) -> Self {
        self.gzip = true;
        self
    }

    /// Also list an uncompressed `Packages` in each `Release` table, without
    /// serving the file. Only meaningful together with [`gzip`](Self::gzip).
    pub fn advertise_plain(mut self) -> Self {
        self.advertise_plain = true;
        self
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    pub fn feed(&self) -> String {
        reqwest::Url::from_directory_path(self.root())
            .unwrap()
            .to_string()
    }

    /// Scratch directory next to the mirror, for the store and working area.
    pub fn scratch(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    /// Write a package into the pool.
    pub fn package(&self, name: &str, version: &str, component: &str, body: &[u8]) -> Package {
        let first = &name[..1];
        let filename = format!("pool/{component}/{first}/{name}/{name}_{version}_amd64.deb");
        let path = self.root().join(&filename);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        Package {
            name: name.to_string(),
            version: version.to_string(),
            architecture: "amd64".to_string(),
            filename,
            checksum: ChecksumType::Sha256.digest(body),
            size: body.len() as u64,
        }
    }

    /// List `package` in a component's index for `amd64`.
    pub fn list(&mut self, release: &str, component: &str, package: &Package) {
        self.indices
            .entry((release.to_string(), component.to_string(), "amd64".to_string()))
            .or_default()
            .push(package.clone());
    }

    /// Declare an empty index, so the component shows up in the release.
    pub fn declare(&mut self, release: &str, component: &str) {
        self.indices
            .entry((release.to_string(), component.to_string(), "amd64".to_string()))
            .or_default();
    }

    /// Forget every index of a release.
    pub fn clear(&mut self, release: &str) {
        self.indices.retain(|(r, _, _), _| r != release);
    }

    /// Overwrite a pool file without updating any index.
    pub fn tamper(&self, package: &Package, body: &[u8]) {
        std::fs::write(self.root().join(&package.filename), body).unwrap();
    }

    /// Write the indices and `Release` document of one release.
    pub fn publish(&self, release: &str, codename: &str) {
        let dists = self.root().join("dists").join(release);
        if dists.exists() {
            std::fs::remove_dir_all(&dists).unwrap();
        }

        let mut components = BTreeSet::new();
        let mut architectures = BTreeSet::new();
        let mut table = String::new();
        for ((r, component, arch), packages) in &self.indices {
            if r != release {
                continue;
            }
            components.insert(component.clone());
            architectures.insert(arch.clone());

            let text: Vec<String> = packages.iter().map(Package::stanza).collect();
            let text = text.join("\n");
            let (suffix, bytes) = if self.gzip {
                if self.advertise_plain {
                    let digest = ChecksumType::Sha256.digest(text.as_bytes());
                    table.push_str(&format!(
                        " {} {} {component}/binary-{arch}/Packages\n",
                        digest.as_str(),
                        text.len()
                    ));
                }
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(text.as_bytes()).unwrap();
                (".gz", encoder.finish().unwrap())
            } else {
                ("", text.into_bytes())
            };

            let rel = format!("{component}/binary-{arch}/Packages{suffix}");
            let path = dists.join(&rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, &bytes).unwrap();
            let digest = ChecksumType::Sha256.digest(&bytes);
            table.push_str(&format!(" {} {} {rel}\n", digest.as_str(), bytes.len()));
        }

        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(" ");
        let document = format!(
            "Origin: Test\nLabel: Test\nSuite: {release}\nCodename: {codename}\nComponents: {}\nArchitectures: {}\nSHA256:\n{table}",
            join(&components),
            join(&architectures)
        );
        std::fs::create_dir_all(&dists).unwrap();
        std::fs::write(dists.join("Release"), document).unwrap();
    }

    /// Drop a (fake) detached signature next to a release document.
    pub fn sign(&self, release: &str) {
        std::fs::write(
            self.root().join("dists").join(release).join("Release.gpg"),
            b"-----BEGIN PGP SIGNATURE-----\nfake\n-----END PGP SIGNATURE-----\n",
        )
        .unwrap();
    }
}

/// Configuration pointing at `mirror`, with extra flat options.
pub fn config(mirror: &Mirror, extra: &[(&str, &str)]) -> SyncConfig {
    let mut map = BTreeMap::from([
        ("feed".to_string(), mirror.feed()),
        (
            "working_dir".to_string(),
            mirror.scratch("work").display().to_string(),
        ),
    ]);
    for (k, v) in extra {
        map.insert((*k).to_string(), (*v).to_string());
    }
    SyncConfig::from_options(&map).unwrap()
}

/// [`HttpDownloader`] that records every URL it is asked for.
#[derive(Debug, Clone)]
pub struct CountingDownloader {
    inner: HttpDownloader,
    seen: Arc<Mutex<Vec<String>>>,
}

impl CountingDownloader {
    pub fn new() -> Self {
        Self {
            inner: HttpDownloader::new(4, RetryConfig::none(), Duration::from_secs(10)).unwrap(),
            seen: Arc::default(),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    /// Requested URLs of pool files.
    pub fn packages(&self) -> Vec<String> {
        self.urls()
            .into_iter()
            .filter(|u| u.ends_with(".deb"))
            .collect()
    }
}

#[async_trait]
impl Downloader for CountingDownloader {
    async fn fetch<T: Send + 'static>(
        &self,
        requests: Vec<DownloadRequest<T>>,
    ) -> Vec<DownloadOutcome<T>> {
        self.seen
            .lock()
            .unwrap()
            .extend(requests.iter().map(|r| r.url.clone()));
        self.inner.fetch(requests).await
    }
}

/// Verifier that returns the same answer for every signature.
#[derive(Debug)]
pub struct ScriptedKeyring {
    valid: bool,
}

impl ScriptedKeyring {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self { valid: true })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self { valid: false })
    }
}

#[async_trait]
impl KeyringVerifier for ScriptedKeyring {
    async fn ensure_key(&self, _fingerprint: &str, _keyserver: &str) -> Result<(), KeyringError> {
        Ok(())
    }

    async fn verify(
        &self,
        _document: &[u8],
        _signature: &[u8],
        _trusted: &[String],
    ) -> Result<Verification, KeyringError> {
        Ok(if self.valid {
            Verification {
                valid: true,
                signer: Some(TRUSTED_KEY.to_string()),
                diagnostic: String::new(),
            }
        } else {
            Verification {
                valid: false,
                signer: Some("FEDCBA9876543210".to_string()),
                diagnostic: "signed by FEDCBA9876543210, which is not trusted".to_string(),
            }
        })
    }
}

/// A store under the mirror's scratch area. Reopening gives the same state.
pub fn store(mirror: &Mirror) -> Arc<LocalStore> {
    Arc::new(LocalStore::open(mirror.scratch("store")).unwrap())
}

pub fn pipeline(
    config: SyncConfig,
    downloader: CountingDownloader,
    store: &Arc<LocalStore>,
) -> SyncPipeline<CountingDownloader> {
    let store: Arc<dyn ContentStore> = store.clone();
    SyncPipeline::new(REPO, config, downloader, store)
}

pub async fn release_unit(store: &LocalStore, codename: &str, suite: &str) -> UnitId {
    store
        .find_unit(&UnitKey::Release {
            codename: codename.to_string(),
            suite: suite.to_string(),
        })
        .await
        .unwrap()
        .expect("release unit")
}

pub async fn component_unit(store: &LocalStore, release: UnitId, name: &str) -> UnitId {
    store
        .find_unit(&UnitKey::Component {
            release,
            name: name.to_string(),
        })
        .await
        .unwrap()
        .expect("component unit")
}

pub async fn package_unit(store: &LocalStore, package: &Package) -> UnitId {
    store
        .find_unit(&package.key())
        .await
        .unwrap()
        .expect("package unit")
}

pub fn exists(path: &Path) -> bool {
    path.try_exists().unwrap()
}
