//! Content store.
//!
//! Units (releases, components, packages) are identified by a natural
//! [`UnitKey`] and get a store-assigned [`UnitId`]. Repositories reference
//! units through associations; a unit may be associated with many
//! repositories and package content is shared between them.
//!
//! [`LocalStore`] keeps unit metadata in a SQLite database and package
//! bytes as content-addressed blobs:
//!
//! ```text
//! <root>/state.db
//! <root>/content/<first 2 hex>/<checksum hex>
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use debsync_schema::{Checksum, PackageRecord, UnitId, UnitKey, UnitKind};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A unit key could not be encoded or read back.
    #[error("unit key encoding error: {0}")]
    Key(#[from] serde_json::Error),

    /// A previous holder of the connection panicked.
    #[error("store connection poisoned")]
    Poisoned,

    /// No unit has this id.
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),

    /// The unit exists but is of another kind.
    #[error("unit {id} is a {actual}, expected a {expected}")]
    WrongKind {
        /// Unit in question.
        id: UnitId,
        /// Kind the operation needs.
        expected: UnitKind,
        /// Kind the unit has.
        actual: UnitKind,
    },
}

/// Durable unit storage and repository associations.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Checksums of all package content already held, in any repository.
    async fn existing_checksums(&self) -> Result<BTreeSet<Checksum>, StoreError>;

    /// Look a unit up by natural key.
    async fn find_unit(&self, key: &UnitKey) -> Result<Option<UnitId>, StoreError>;

    /// Look a unit up by natural key, creating it if absent.
    async fn get_or_create_unit(&self, key: &UnitKey) -> Result<UnitId, StoreError>;

    /// Take ownership of a verified package file and record its metadata.
    /// Idempotent per checksum.
    async fn persist_content(&self, record: &PackageRecord, file: &Path)
    -> Result<UnitId, StoreError>;

    /// Make `unit` part of repository `repo_id`.
    async fn associate(&self, repo_id: &str, unit: UnitId) -> Result<(), StoreError>;

    /// Drop `unit` from repository `repo_id`. The unit itself survives.
    async fn remove(&self, repo_id: &str, unit: UnitId) -> Result<(), StoreError>;

    /// Units of `kind` associated with `repo_id`.
    async fn list_associated(
        &self,
        repo_id: &str,
        kind: UnitKind,
    ) -> Result<BTreeSet<UnitId>, StoreError>;

    /// Package set of a component unit.
    async fn component_packages(&self, component: UnitId) -> Result<BTreeSet<UnitId>, StoreError>;

    /// Replace the package set of a component unit.
    async fn set_component_packages(
        &self,
        component: UnitId,
        packages: BTreeSet<UnitId>,
    ) -> Result<(), StoreError>;
}

/// Metadata kept for a persisted package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    /// `Filename` the content was downloaded from.
    pub filename: String,
    /// Size of the blob in bytes.
    pub size: u64,
    /// `Package` field.
    pub package: String,
    /// `Version` field.
    pub version: String,
    /// `Architecture` field.
    pub architecture: String,
}

const DB_FILE: &str = "state.db";

/// [`ContentStore`] on the local filesystem, indexed by SQLite.
pub struct LocalStore {
    root: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").field("root", &self.root).finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open (or initialize) a store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the database
    /// cannot be opened or migrated.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("content"))?;

        let conn = Connection::open(root.join(DB_FILE))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        init_schema(&conn)?;

        Ok(Self {
            root,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob for `checksum` lives.
    pub fn content_path(&self, checksum: &Checksum) -> PathBuf {
        let hex = checksum.as_str();
        self.root.join("content").join(&hex[..2]).join(hex)
    }

    /// Natural key of a unit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownUnit`] for an unknown id.
    pub async fn unit_key(&self, id: UnitId) -> Result<UnitKey, StoreError> {
        self.call(move |conn| unit_key(conn, id)).await
    }

    /// Stored metadata of a package unit, if it has content.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownUnit`] for an unknown id.
    pub async fn content_info(&self, id: UnitId) -> Result<Option<ContentInfo>, StoreError> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT filename, size, package, version, architecture FROM units WHERE id = ?1",
                    params![id.0 as i64],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<i64>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;
            let (filename, size, package, version, architecture) =
                row.ok_or(StoreError::UnknownUnit(id))?;
            Ok(filename.zip(size).map(|(filename, size)| ContentInfo {
                filename,
                size: size as u64,
                package: package.unwrap_or_default(),
                version: version.unwrap_or_default(),
                architecture: architecture.unwrap_or_default(),
            }))
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    async fn place_blob(&self, checksum: &Checksum, file: &Path) -> Result<u64, StoreError> {
        let blob = self.content_path(checksum);
        if let Ok(meta) = tokio::fs::metadata(&blob).await {
            return Ok(meta.len());
        }
        let parent = blob
            .parent()
            .ok_or_else(|| std::io::Error::other("blob path has no parent"))?;
        tokio::fs::create_dir_all(parent).await?;

        let staging = blob.with_extension("tmp");
        let size = tokio::fs::copy(file, &staging).await?;
        tokio::fs::rename(&staging, &blob).await?;
        Ok(size)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS units (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            natural_key TEXT NOT NULL UNIQUE,
            filename TEXT,
            size INTEGER,
            package TEXT,
            version TEXT,
            architecture TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_units_kind ON units(kind);

        CREATE TABLE IF NOT EXISTS associations (
            repo TEXT NOT NULL,
            unit INTEGER NOT NULL REFERENCES units(id),
            PRIMARY KEY (repo, unit)
        );

        CREATE TABLE IF NOT EXISTS component_packages (
            component INTEGER NOT NULL REFERENCES units(id),
            package INTEGER NOT NULL REFERENCES units(id),
            PRIMARY KEY (component, package)
        );",
    )?;
    Ok(())
}

fn kind_tag(kind: UnitKind) -> &'static str {
    match kind {
        UnitKind::Release => "release",
        UnitKind::Component => "component",
        UnitKind::Package => "package",
    }
}

fn unit_key(conn: &Connection, id: UnitId) -> Result<UnitKey, StoreError> {
    let key: Option<String> = conn
        .query_row(
            "SELECT natural_key FROM units WHERE id = ?1",
            params![id.0 as i64],
            |row| row.get(0),
        )
        .optional()?;
    let key = key.ok_or(StoreError::UnknownUnit(id))?;
    Ok(serde_json::from_str(&key)?)
}

fn expect_kind(conn: &Connection, id: UnitId, expected: UnitKind) -> Result<(), StoreError> {
    let actual = unit_key(conn, id)?.kind();
    if actual == expected {
        Ok(())
    } else {
        Err(StoreError::WrongKind {
            id,
            expected,
            actual,
        })
    }
}

fn find_unit(conn: &Connection, encoded: &str) -> Result<Option<UnitId>, StoreError> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM units WHERE natural_key = ?1",
            params![encoded],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(|id| UnitId(id as u64)))
}

fn get_or_create(conn: &Connection, key: &UnitKey) -> Result<UnitId, StoreError> {
    let encoded = serde_json::to_string(key)?;
    if let Some(id) = find_unit(conn, &encoded)? {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO units (kind, natural_key) VALUES (?1, ?2)",
        params![kind_tag(key.kind()), encoded],
    )?;
    let id = UnitId(conn.last_insert_rowid() as u64);
    tracing::debug!("Created {key} as {id}");
    Ok(id)
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn existing_checksums(&self) -> Result<BTreeSet<Checksum>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT natural_key FROM units WHERE kind = 'package' AND filename IS NOT NULL",
            )?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut checksums = BTreeSet::new();
            for key in keys {
                if let UnitKey::Package { checksum } = serde_json::from_str(&key)? {
                    checksums.insert(checksum);
                }
            }
            Ok(checksums)
        })
        .await
    }

    async fn find_unit(&self, key: &UnitKey) -> Result<Option<UnitId>, StoreError> {
        let encoded = serde_json::to_string(key)?;
        self.call(move |conn| find_unit(conn, &encoded)).await
    }

    async fn get_or_create_unit(&self, key: &UnitKey) -> Result<UnitId, StoreError> {
        let key = key.clone();
        self.call(move |conn| get_or_create(conn, &key)).await
    }

    async fn persist_content(
        &self,
        record: &PackageRecord,
        file: &Path,
    ) -> Result<UnitId, StoreError> {
        let size = self.place_blob(&record.checksum, file).await?;
        let record = record.clone();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let id = get_or_create(
                &tx,
                &UnitKey::Package {
                    checksum: record.checksum.clone(),
                },
            )?;
            tx.execute(
                "UPDATE units SET filename = ?1, size = ?2, package = ?3, version = ?4, architecture = ?5
                 WHERE id = ?6",
                params![
                    record.filename,
                    size as i64,
                    record.package,
                    record.version,
                    record.architecture,
                    id.0 as i64
                ],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn associate(&self, repo_id: &str, unit: UnitId) -> Result<(), StoreError> {
        let repo_id = repo_id.to_string();
        self.call(move |conn| {
            unit_key(conn, unit)?;
            conn.execute(
                "INSERT OR IGNORE INTO associations (repo, unit) VALUES (?1, ?2)",
                params![repo_id, unit.0 as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, repo_id: &str, unit: UnitId) -> Result<(), StoreError> {
        let repo_id = repo_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM associations WHERE repo = ?1 AND unit = ?2",
                params![repo_id, unit.0 as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_associated(
        &self,
        repo_id: &str,
        kind: UnitKind,
    ) -> Result<BTreeSet<UnitId>, StoreError> {
        let repo_id = repo_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT a.unit FROM associations a JOIN units u ON u.id = a.unit
                 WHERE a.repo = ?1 AND u.kind = ?2",
            )?;
            let ids = stmt
                .query_map(params![repo_id, kind_tag(kind)], |row| row.get::<_, i64>(0))?
                .map(|id| id.map(|id| UnitId(id as u64)))
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn component_packages(&self, component: UnitId) -> Result<BTreeSet<UnitId>, StoreError> {
        self.call(move |conn| {
            expect_kind(conn, component, UnitKind::Component)?;
            let mut stmt =
                conn.prepare("SELECT package FROM component_packages WHERE component = ?1")?;
            let ids = stmt
                .query_map(params![component.0 as i64], |row| row.get::<_, i64>(0))?
                .map(|id| id.map(|id| UnitId(id as u64)))
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn set_component_packages(
        &self,
        component: UnitId,
        packages: BTreeSet<UnitId>,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            expect_kind(&tx, component, UnitKind::Component)?;
            for id in &packages {
                expect_kind(&tx, *id, UnitKind::Package)?;
            }
            tx.execute(
                "DELETE FROM component_packages WHERE component = ?1",
                params![component.0 as i64],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO component_packages (component, package) VALUES (?1, ?2)",
                )?;
                for id in &packages {
                    insert.execute(params![component.0 as i64, id.0 as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
