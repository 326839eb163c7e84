//! `debsync sync`: run the pipeline once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use debsync_core::{
    ContentStore, GpgKeyring, HttpDownloader, LocalStore, SyncConfig, SyncPipeline, SyncReport,
};

use crate::reporter::LogReporter;

/// Where the sync configuration comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A TOML file.
    File(PathBuf),
    /// Flat `key=value` pairs, the form a plugin host stores.
    Options(Vec<String>),
}

impl ConfigSource {
    pub fn load(&self) -> Result<SyncConfig> {
        match self {
            Self::File(path) => SyncConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display())),
            Self::Options(pairs) => {
                let map = parse_pairs(pairs)?;
                Ok(SyncConfig::from_options(&map)?)
            }
        }
    }
}

fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{pair}'");
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// Sync `repo` into the store at `store_dir`.
pub async fn sync(
    repo: &str,
    source: ConfigSource,
    store_dir: &Path,
    work_dir: Option<PathBuf>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let mut config = source.load()?;
    if let Some(dir) = work_dir {
        config.working_dir = dir;
    }

    let downloader =
        HttpDownloader::from_config(&config).context("Failed to initialize HTTP client")?;
    let store: Arc<dyn ContentStore> = Arc::new(
        LocalStore::open(store_dir)
            .with_context(|| format!("Failed to open store at {}", store_dir.display()))?,
    );
    let reporter = Arc::new(LogReporter::new(quiet || json));

    let keyring = if config.require_signature {
        let home = config.working_dir.join("gnupg");
        let keyring = GpgKeyring::new(home, config.key_timeout)
            .context("Signature checks are enabled but gpg is unavailable")?
            .with_retry(config.retry.clone());
        Some(Arc::new(keyring))
    } else {
        None
    };

    let mut pipeline = SyncPipeline::new(repo, config, downloader, store).with_reporter(reporter);
    if let Some(keyring) = keyring {
        pipeline = pipeline.with_keyring(keyring);
    }

    let report = match pipeline.run().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(
                code = e.code(),
                retryable = e.is_retryable(),
                "Sync of {repo} failed: {e}"
            );
            bail!("[{}] {e}", e.code());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("Repository: {}", report.repo_id);
    for release in &report.releases {
        println!("  release   {release}");
    }
    println!("  components {}", report.components);
    println!(
        "  packages   {} listed, {} downloaded ({} bytes), {} already present",
        report.records, report.downloaded, report.downloaded_bytes, report.already_present
    );
    if report.removed() > 0 {
        println!(
            "  removed    {} releases, {} components, {} packages",
            report.removed_releases, report.removed_components, report.removed_packages
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_become_options() {
        let map = parse_pairs(&[
            "feed=http://deb.example.org/debian".to_string(),
            "releases = stable,testing".to_string(),
        ])
        .unwrap();
        assert_eq!(map["feed"], "http://deb.example.org/debian");
        assert_eq!(map["releases"], "stable,testing");

        let config = ConfigSource::Options(vec!["feed=http://deb.example.org/debian".to_string()])
            .load()
            .unwrap();
        assert_eq!(config.releases, vec!["stable".to_string()]);
    }

    #[test]
    fn pair_without_equals_is_rejected() {
        assert!(parse_pairs(&["feed".to_string()]).is_err());
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debsync.toml");
        std::fs::write(
            &path,
            "feed = \"http://deb.example.org/debian\"\nreleases = [\"bookworm\"]\n",
        )
        .unwrap();
        let config = ConfigSource::File(path).load().unwrap();
        assert_eq!(config.releases, vec!["bookworm".to_string()]);
    }
}
