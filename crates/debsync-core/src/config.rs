//! Sync configuration.
//!
//! A host hands the pipeline either the flat string map its plugin
//! configuration is stored as, or a TOML document with the same keys. Both
//! funnel through [`SyncOptions`] and are validated once, before any I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::retry::RetryConfig;

/// Release synced when `releases` is not configured.
pub const DEFAULT_RELEASE: &str = "stable";

/// Keyserver used to fetch missing trusted keys.
pub const DEFAULT_KEYSERVER: &str = "hkps://keyserver.ubuntu.com";

/// Parallel downloads when `max_concurrent_downloads` is not configured.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Upper bound on a single keyring operation.
pub const DEFAULT_KEY_TIMEOUT_SECS: u64 = 30;

/// Longest a download may stall between reads before it is abandoned.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// An optional allow-list. Absence means everything is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(Option<BTreeSet<String>>);

impl AllowList {
    /// Allow everything.
    pub fn all() -> Self {
        Self(None)
    }

    /// Allow only the given names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Some(names.into_iter().map(Into::into).collect()))
    }

    /// Whether `name` passes the list.
    pub fn permits(&self, name: &str) -> bool {
        self.0.as_ref().is_none_or(|set| set.contains(name))
    }
}

/// A list option: comma-separated string in the plugin map, either a string
/// or an array in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ListOption {
    /// `"main,contrib"`
    Csv(String),
    /// `["main", "contrib"]`
    List(Vec<String>),
}

impl ListOption {
    fn items(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::Csv(s) => s.split(',').collect(),
            Self::List(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Unvalidated configuration as supplied by the host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncOptions {
    /// Base URL of the repository.
    pub feed: Option<String>,
    /// Release names under `dists/`.
    pub releases: Option<ListOption>,
    /// Architecture allow-list.
    pub architectures: Option<ListOption>,
    /// Component allow-list.
    pub components: Option<ListOption>,
    /// Retire content no longer listed upstream.
    pub remove_missing_units: Option<bool>,
    /// Refuse unsigned or untrusted releases.
    pub require_signature: Option<bool>,
    /// Fingerprints trusted to sign releases.
    pub allowed_keys: Option<ListOption>,
    /// Where missing keys are fetched from.
    pub keyserver: Option<String>,
    /// Scratch area for downloaded metadata and packages.
    pub working_dir: Option<PathBuf>,
    /// Parallel downloads.
    pub max_concurrent_downloads: Option<usize>,
    /// Expected number of components per release.
    pub expected_component_count: Option<usize>,
    /// Timeout for one keyring operation, in seconds.
    pub key_timeout_secs: Option<u64>,
    /// Longest a download may go without receiving data, in seconds.
    pub download_timeout_secs: Option<u64>,
    /// Download retry policy.
    pub retry: Option<RetryConfig>,
}

/// Validated configuration consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Repository base URL without trailing slash.
    pub feed: String,
    /// Releases to sync, in configured order.
    pub releases: Vec<String>,
    /// Architecture allow-list.
    pub architectures: AllowList,
    /// Component allow-list.
    pub components: AllowList,
    /// Full-replacement semantics and orphan cleanup when set.
    pub remove_missing: bool,
    /// Releases must carry a valid signature from [`allowed_keys`](Self::allowed_keys).
    pub require_signature: bool,
    /// Normalized (uppercase, no spaces) trusted fingerprints.
    pub allowed_keys: Vec<String>,
    /// Keyserver for fetching trusted keys.
    pub keyserver: String,
    /// Scratch directory for this repository.
    pub working_dir: PathBuf,
    /// Parallel downloads.
    pub max_concurrent_downloads: usize,
    /// Download retry policy.
    pub retry: RetryConfig,
    /// Cardinality check on components, when configured.
    pub expected_component_count: Option<usize>,
    /// Timeout for one keyring operation.
    pub key_timeout: Duration,
    /// Read timeout of a single download.
    pub download_timeout: Duration,
}

impl SyncConfig {
    /// Build from the flat string map a plugin host stores configuration in.
    ///
    /// Unknown keys are ignored so hosts can keep unrelated settings in the
    /// same map.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for unparsable values or a configuration
    /// that fails [validation](SyncOptions::validate).
    pub fn from_options(map: &BTreeMap<String, String>) -> Result<Self> {
        let list = |key: &str| map.get(key).map(|v| ListOption::Csv(v.clone()));
        let number = |key: &str| -> Result<Option<u64>> {
            map.get(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map_err(|_| SyncError::Config(format!("{key}: expected a number, got '{v}'")))
                })
                .transpose()
        };

        let options = SyncOptions {
            feed: map.get("feed").cloned(),
            releases: list("releases"),
            architectures: list("architectures"),
            components: list("components"),
            remove_missing_units: map
                .get("remove_missing_units")
                .map(|v| parse_bool("remove_missing_units", v))
                .transpose()?,
            require_signature: map
                .get("require_signature")
                .map(|v| parse_bool("require_signature", v))
                .transpose()?,
            allowed_keys: list("allowed_keys"),
            keyserver: map.get("keyserver").cloned(),
            working_dir: map.get("working_dir").map(PathBuf::from),
            max_concurrent_downloads: number("max_concurrent_downloads")?.map(|n| n as usize),
            expected_component_count: number("expected_component_count")?.map(|n| n as usize),
            key_timeout_secs: number("key_timeout_secs")?,
            download_timeout_secs: number("download_timeout_secs")?,
            retry: None,
        };

        for key in map.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::debug!("ignoring unrecognized option '{key}'");
            }
        }

        options.validate()
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] on TOML errors, unknown keys, or a
    /// configuration that fails validation.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let options: SyncOptions =
            toml::from_str(input).map_err(|e| SyncError::Config(e.to_string()))?;
        options.validate()
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// `<feed>/dists/<release>`
    pub fn release_base_url(&self, release: &str) -> String {
        format!("{}/dists/{release}", self.feed)
    }

    /// URL of a release document.
    pub fn release_url(&self, release: &str) -> String {
        format!(
            "{}/{}",
            self.release_base_url(release),
            debsync_schema::RELEASE_FILE
        )
    }

    /// URL of a release document's detached signature.
    pub fn signature_url(&self, release: &str) -> String {
        format!(
            "{}/{}",
            self.release_base_url(release),
            debsync_schema::RELEASE_SIGNATURE_FILE
        )
    }

    /// URL of an index file given its path relative to the release.
    pub fn index_url(&self, release: &str, path: &str) -> String {
        format!("{}/{path}", self.release_base_url(release))
    }

    /// URL of a package given its `Filename` field.
    pub fn package_url(&self, filename: &str) -> String {
        format!("{}/{}", self.feed, filename.trim_start_matches('/'))
    }
}

const KNOWN_KEYS: &[&str] = &[
    "feed",
    "releases",
    "architectures",
    "components",
    "remove_missing_units",
    "require_signature",
    "allowed_keys",
    "keyserver",
    "working_dir",
    "max_concurrent_downloads",
    "expected_component_count",
    "key_timeout_secs",
    "download_timeout_secs",
];

impl SyncOptions {
    /// Check the options and resolve defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first problem found.
    pub fn validate(self) -> Result<SyncConfig> {
        let feed = self
            .feed
            .as_deref()
            .map(|f| f.trim().trim_end_matches('/'))
            .filter(|f| !f.is_empty())
            .ok_or_else(|| SyncError::Config("feed is required".to_string()))?
            .to_string();

        let url = reqwest::Url::parse(&feed)
            .map_err(|e| SyncError::Config(format!("feed '{feed}' is not a valid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https" | "file") {
            return Err(SyncError::Config(format!(
                "feed '{feed}': unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let releases = match &self.releases {
            Some(list) => list.items(),
            None => vec![DEFAULT_RELEASE.to_string()],
        };
        if releases.is_empty() {
            return Err(SyncError::Config("releases must not be empty".to_string()));
        }
        if let Some(bad) = releases
            .iter()
            .find(|r| r.is_empty() || r.contains('/') || matches!(r.as_str(), "." | ".."))
        {
            return Err(SyncError::Config(format!(
                "release name '{bad}' must be a single path segment"
            )));
        }
        let mut seen = BTreeSet::new();
        let releases: Vec<String> = releases
            .into_iter()
            .filter(|r| seen.insert(r.clone()))
            .collect();

        let architectures = allow_list("architectures", self.architectures.as_ref())?;
        let components = allow_list("components", self.components.as_ref())?;

        let require_signature = self.require_signature.unwrap_or(false);
        let allowed_keys = self
            .allowed_keys
            .as_ref()
            .map(ListOption::items)
            .unwrap_or_default()
            .iter()
            .map(|k| normalize_fingerprint(k))
            .collect::<Result<Vec<_>>>()?;
        if require_signature && allowed_keys.is_empty() {
            return Err(SyncError::Config(
                "allowed_keys is required when require_signature is enabled".to_string(),
            ));
        }

        let max_concurrent_downloads = self
            .max_concurrent_downloads
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);
        if max_concurrent_downloads == 0 {
            return Err(SyncError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }

        let download_timeout = self
            .download_timeout_secs
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);
        if download_timeout == 0 {
            return Err(SyncError::Config(
                "download_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.expected_component_count == Some(0) {
            return Err(SyncError::Config(
                "expected_component_count must be at least 1".to_string(),
            ));
        }

        Ok(SyncConfig {
            feed,
            releases,
            architectures,
            components,
            remove_missing: self.remove_missing_units.unwrap_or(false),
            require_signature,
            allowed_keys,
            keyserver: self
                .keyserver
                .filter(|k| !k.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_KEYSERVER.to_string()),
            working_dir: self
                .working_dir
                .unwrap_or_else(|| std::env::temp_dir().join("debsync")),
            max_concurrent_downloads,
            retry: self.retry.unwrap_or_default(),
            expected_component_count: self.expected_component_count,
            key_timeout: Duration::from_secs(
                self.key_timeout_secs.unwrap_or(DEFAULT_KEY_TIMEOUT_SECS),
            ),
            download_timeout: Duration::from_secs(download_timeout),
        })
    }
}

fn allow_list(key: &str, option: Option<&ListOption>) -> Result<AllowList> {
    match option {
        None => Ok(AllowList::all()),
        Some(list) => {
            let items = list.items();
            if items.is_empty() {
                // An empty allow-list would filter out everything; that is
                // never what was meant.
                return Err(SyncError::Config(format!(
                    "{key} allow-list is set but empty; remove it to allow all"
                )));
            }
            Ok(AllowList::only(items))
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(SyncError::Config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

/// Uppercase a fingerprint and drop spaces and a `0x` prefix.
///
/// Only full fingerprints are accepted: 40 hex digits (v4 keys) or 64
/// (v5/v6). Short and long key IDs are trivially forgeable.
///
/// # Errors
///
/// Returns [`SyncError::Config`] if what remains is not a full hex
/// fingerprint.
pub fn normalize_fingerprint(raw: &str) -> Result<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact
        .strip_prefix("0x")
        .or_else(|| compact.strip_prefix("0X"))
        .unwrap_or(&compact)
        .to_ascii_uppercase();
    if !matches!(compact.len(), 40 | 64) || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SyncError::Config(format!(
            "allowed_keys: '{raw}' is not a full key fingerprint (40 or 64 hex digits)"
        )));
    }
    Ok(compact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply() {
        let config =
            SyncConfig::from_options(&options(&[("feed", "http://deb.example.org/debian/")]))
                .unwrap();
        assert_eq!(config.feed, "http://deb.example.org/debian");
        assert_eq!(config.releases, vec!["stable"]);
        assert_eq!(config.architectures, AllowList::all());
        assert_eq!(config.components, AllowList::all());
        assert!(!config.remove_missing);
        assert!(!config.require_signature);
        assert_eq!(config.keyserver, DEFAULT_KEYSERVER);
        assert_eq!(config.max_concurrent_downloads, DEFAULT_MAX_CONCURRENT_DOWNLOADS);
        assert_eq!(
            config.download_timeout,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
    }

    #[test]
    fn download_timeout_is_configurable_and_nonzero() {
        let config = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("download_timeout_secs", "5"),
        ]))
        .unwrap();
        assert_eq!(config.download_timeout, Duration::from_secs(5));

        let err = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("download_timeout_secs", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("download_timeout_secs")));
    }

    #[test]
    fn release_names_must_stay_under_dists() {
        for bad in ["..", ".", "stable/../..", "a/b"] {
            let err = SyncConfig::from_options(&options(&[
                ("feed", "http://deb.example.org/debian"),
                ("releases", bad),
            ]))
            .unwrap_err();
            assert!(
                matches!(err, SyncError::Config(ref m) if m.contains("single path segment")),
                "{bad} was accepted"
            );
        }

        let config = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("releases", "bookworm-updates"),
        ]))
        .unwrap();
        assert_eq!(config.releases, vec!["bookworm-updates"]);
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        let config = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("releases", "bookworm, bookworm-updates,bookworm"),
            ("components", "main"),
            ("architectures", "amd64,arm64"),
            ("remove_missing_units", "yes"),
        ]))
        .unwrap();
        assert_eq!(config.releases, vec!["bookworm", "bookworm-updates"]);
        assert!(config.components.permits("main"));
        assert!(!config.components.permits("contrib"));
        assert!(config.architectures.permits("arm64"));
        assert!(config.remove_missing);
    }

    #[test]
    fn missing_feed_is_rejected() {
        let err = SyncConfig::from_options(&options(&[("releases", "stable")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("feed")));
    }

    #[test]
    fn signature_requires_keys() {
        let err = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("require_signature", "true"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("allowed_keys")));
    }

    #[test]
    fn empty_allow_list_is_contradictory() {
        let err = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("components", " , "),
        ]))
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("components")));
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let err = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("remove_missing_units", "sometimes"),
        ]))
        .unwrap_err();
        assert_eq!(err.code(), "DEBSYNC008");
    }

    #[test]
    fn fingerprints_are_normalized() {
        assert_eq!(
            normalize_fingerprint("0xb8b8 0b5b 623e ab6a d877 5c45 b7c5 d7d6 3509 47f8").unwrap(),
            "B8B80B5B623EAB6AD8775C45B7C5D7D6350947F8"
        );
        assert!(normalize_fingerprint("not-a-key").is_err());
    }

    #[test]
    fn key_ids_are_not_fingerprints() {
        // Long (16) and short (8) key IDs.
        assert!(normalize_fingerprint("B7C5D7D6350947F8").is_err());
        assert!(normalize_fingerprint("350947F8").is_err());
        assert!(normalize_fingerprint(&"A".repeat(41)).is_err());
        assert!(normalize_fingerprint(&"A".repeat(64)).is_ok());

        let err = SyncConfig::from_options(&options(&[
            ("feed", "http://deb.example.org/debian"),
            ("require_signature", "true"),
            ("allowed_keys", "6ED0E7B82643E131"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("full key fingerprint")));
    }

    #[test]
    fn toml_accepts_arrays_and_rejects_unknown_keys() {
        let config = SyncConfig::from_toml_str(
            r#"
            feed = "https://deb.example.org/debian"
            releases = ["bookworm"]
            components = "main,contrib"
            require_signature = true
            allowed_keys = ["B8B80B5B623EAB6AD8775C45B7C5D7D6350947F8"]

            [retry]
            max_retries = 1
            base_delay_ms = 10
            max_delay_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.releases, vec!["bookworm"]);
        assert!(config.components.permits("contrib"));
        assert_eq!(config.retry.max_retries, 1);

        let err = SyncConfig::from_toml_str("feed = \"http://x\"\nfeeds = 1\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn urls_are_derived_from_feed() {
        let config =
            SyncConfig::from_options(&options(&[("feed", "http://deb.example.org/debian")]))
                .unwrap();
        assert_eq!(
            config.release_url("stable"),
            "http://deb.example.org/debian/dists/stable/Release"
        );
        assert_eq!(
            config.signature_url("stable"),
            "http://deb.example.org/debian/dists/stable/Release.gpg"
        );
        assert_eq!(
            config.index_url("stable", "main/binary-amd64/Packages.gz"),
            "http://deb.example.org/debian/dists/stable/main/binary-amd64/Packages.gz"
        );
        assert_eq!(
            config.package_url("pool/main/h/hello/hello_1.0_amd64.deb"),
            "http://deb.example.org/debian/pool/main/h/hello/hello_1.0_amd64.deb"
        );
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err =
            SyncConfig::from_options(&options(&[("feed", "ftp://deb.example.org")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(ref m) if m.contains("scheme")));
    }
}
