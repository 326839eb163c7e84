//! `debsync status`: what a repository holds right now.

use std::path::Path;

use anyhow::{Context, Result};
use debsync_core::{ContentStore, LocalStore};
use debsync_schema::{UnitKey, UnitKind};
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
struct RepoStatus {
    repo: String,
    releases: Vec<String>,
    components: Vec<String>,
    packages: usize,
    bytes: u64,
}

/// Print the units associated with `repo`.
pub async fn status(repo: &str, store_dir: &Path, json: bool) -> Result<()> {
    let store = LocalStore::open(store_dir)
        .with_context(|| format!("Failed to open store at {}", store_dir.display()))?;
    let status = collect(&store, repo).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Repository: {}", status.repo);
    for release in &status.releases {
        println!("  release   {release}");
    }
    for component in &status.components {
        println!("  component {component}");
    }
    println!("  packages  {} ({} bytes)", status.packages, status.bytes);
    Ok(())
}

async fn collect(store: &LocalStore, repo: &str) -> Result<RepoStatus> {
    let mut status = RepoStatus {
        repo: repo.to_string(),
        ..RepoStatus::default()
    };

    for id in store.list_associated(repo, UnitKind::Release).await? {
        if let UnitKey::Release { codename, suite } = store.unit_key(id).await? {
            status.releases.push(format!("{codename}/{suite}"));
        }
    }

    for id in store.list_associated(repo, UnitKind::Component).await? {
        if let UnitKey::Component { release, name } = store.unit_key(id).await? {
            let release = match store.unit_key(release).await? {
                UnitKey::Release { codename, .. } => codename,
                other => other.to_string(),
            };
            let count = store.component_packages(id).await?.len();
            status.components.push(format!("{release}/{name} ({count} packages)"));
        }
    }

    let packages = store.list_associated(repo, UnitKind::Package).await?;
    status.packages = packages.len();
    for id in packages {
        if let Some(info) = store.content_info(id).await? {
            status.bytes += info.size;
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use debsync_schema::ChecksumType;

    #[tokio::test]
    async fn empty_repo_has_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let status = collect(&store, "debian").await.unwrap();
        assert!(status.releases.is_empty());
        assert_eq!(status.packages, 0);
    }

    #[tokio::test]
    async fn associated_units_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let release = store
            .get_or_create_unit(&UnitKey::Release {
                codename: "bookworm".to_string(),
                suite: "stable".to_string(),
            })
            .await
            .unwrap();
        let component = store
            .get_or_create_unit(&UnitKey::Component {
                release,
                name: "main".to_string(),
            })
            .await
            .unwrap();
        let package = store
            .get_or_create_unit(&UnitKey::Package {
                checksum: ChecksumType::Sha256.digest(b"deb"),
            })
            .await
            .unwrap();
        for id in [release, component, package] {
            store.associate("debian", id).await.unwrap();
        }

        let status = collect(&store, "debian").await.unwrap();
        assert_eq!(status.releases, vec!["bookworm/stable".to_string()]);
        assert_eq!(status.components, vec!["bookworm/main (0 packages)".to_string()]);
        assert_eq!(status.packages, 1);
        assert_eq!(status.bytes, 0);
    }
}
