//! The sync state machine.
//!
//! ```text
//! INIT -> FETCH_RELEASE -> PARSE_RELEASE -> FETCH_PACKAGE_INDICES
//!      -> PARSE_PACKAGE_INDICES -> RESOLVE_LOCAL -> FETCH_MISSING_CONTENT
//!      -> VERIFY_AND_SAVE_CONTENT -> SAVE_METADATA -> [ORPHAN_CLEANUP] -> DONE
//! ```
//!
//! Stages run strictly in order and share one [`RunContext`]. Any error
//! aborts the run. Nothing is associated with the repository before every
//! downloaded package has been verified, and component package lists are
//! only written once all content they point at is in the store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use debsync_schema::{Checksum, IndexReference, ReleaseDescriptor, UnitId, UnitKey, UnitKind};
use serde::Serialize;
use tracing::Instrument;

use crate::checksum::{Verdict, verify_file};
use crate::config::SyncConfig;
use crate::download::{DownloadOutcome, DownloadRequest, Downloader};
use crate::error::{Result, SyncError};
use crate::keyring::KeyringVerifier;
use crate::packages::{PackageIndexParser, ParsedIndices};
use crate::paths::{WorkingLayout, filename_from_url};
use crate::reconcile::{DownloadPlan, OrphanCandidates, SyncReconciler};
use crate::release::{ReleaseFiles, ReleaseIndexParser};
use crate::reporter::{NullReporter, Reporter};
use crate::store::ContentStore;

/// A step of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Validate collaborators, load orphan candidates.
    Init,
    /// Download release documents and signatures.
    FetchRelease,
    /// Verify and parse release documents; get-or-create release and
    /// component units.
    ParseRelease,
    /// Download the selected package indices.
    FetchPackageIndices,
    /// Verify and parse package indices.
    ParsePackageIndices,
    /// Work out which content the store already has.
    ResolveLocal,
    /// Download missing packages.
    FetchMissingContent,
    /// Check every download against its digest, then store it.
    VerifyAndSaveContent,
    /// Write component package lists and associate metadata units.
    SaveMetadata,
    /// Drop units upstream no longer lists.
    OrphanCleanup,
    /// Finished.
    Done,
}

impl Stage {
    /// Upper-case stage name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::FetchRelease => "FETCH_RELEASE",
            Self::ParseRelease => "PARSE_RELEASE",
            Self::FetchPackageIndices => "FETCH_PACKAGE_INDICES",
            Self::ParsePackageIndices => "PARSE_PACKAGE_INDICES",
            Self::ResolveLocal => "RESOLVE_LOCAL",
            Self::FetchMissingContent => "FETCH_MISSING_CONTENT",
            Self::VerifyAndSaveContent => "VERIFY_AND_SAVE_CONTENT",
            Self::SaveMetadata => "SAVE_METADATA",
            Self::OrphanCleanup => "ORPHAN_CLEANUP",
            Self::Done => "DONE",
        }
    }

    /// The stage after this one. Orphan cleanup only runs when removal of
    /// missing units is enabled.
    pub const fn next(self, remove_missing: bool) -> Self {
        match self {
            Self::Init => Self::FetchRelease,
            Self::FetchRelease => Self::ParseRelease,
            Self::ParseRelease => Self::FetchPackageIndices,
            Self::FetchPackageIndices => Self::ParsePackageIndices,
            Self::ParsePackageIndices => Self::ResolveLocal,
            Self::ResolveLocal => Self::FetchMissingContent,
            Self::FetchMissingContent => Self::VerifyAndSaveContent,
            Self::VerifyAndSaveContent => Self::SaveMetadata,
            Self::SaveMetadata if remove_missing => Self::OrphanCleanup,
            Self::SaveMetadata | Self::OrphanCleanup | Self::Done => Self::Done,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Repository synced.
    pub repo_id: String,
    /// `codename/suite` of every release synced, in configured order.
    pub releases: Vec<String>,
    /// Component units whose package list was written.
    pub components: usize,
    /// Distinct packages listed upstream.
    pub records: usize,
    /// Packages downloaded this run.
    pub downloaded: usize,
    /// Bytes downloaded for packages.
    pub downloaded_bytes: u64,
    /// Packages the store already held.
    pub already_present: usize,
    /// Release units removed from the repository.
    pub removed_releases: usize,
    /// Component units removed from the repository.
    pub removed_components: usize,
    /// Package units removed from the repository.
    pub removed_packages: usize,
    /// Wall time of the run.
    pub elapsed_secs: f64,
}

impl SyncReport {
    /// Units removed, all kinds.
    pub fn removed(&self) -> usize {
        self.removed_releases + self.removed_components + self.removed_packages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseFile {
    Document,
    Signature,
}

/// Local copies of one release's documents.
#[derive(Debug, Default)]
struct FetchedRelease {
    document: PathBuf,
    signature: Option<PathBuf>,
    signature_path: PathBuf,
}

/// Per-release state from `PARSE_RELEASE` on.
#[derive(Debug)]
struct ReleaseState {
    descriptor: ReleaseDescriptor,
    unit: UnitId,
    components: BTreeMap<String, UnitId>,
    indices: Vec<(IndexReference, PathBuf)>,
}

/// State shared by the stages of one run.
#[derive(Debug, Default)]
struct RunContext {
    /// `FETCH_RELEASE`: release name -> local files.
    fetched_releases: BTreeMap<String, FetchedRelease>,
    /// `PARSE_RELEASE`: one entry per configured release, in order.
    releases: Vec<ReleaseState>,
    /// `PARSE_PACKAGE_INDICES`: deduplicated records and per-component lists.
    parsed: ParsedIndices,
    /// `RESOLVE_LOCAL`: what to fetch.
    plan: DownloadPlan,
    /// `FETCH_MISSING_CONTENT`: downloaded files, sorted by path.
    fetched: Vec<(Checksum, PathBuf, u64)>,
    /// `VERIFY_AND_SAVE_CONTENT`: unit of every record of this run.
    package_units: BTreeMap<Checksum, UnitId>,
    /// Shrinks as the run re-affirms units.
    candidates: OrphanCandidates,
    report: SyncReport,
}

/// Mirrors one remote APT repository into a [`ContentStore`].
pub struct SyncPipeline<D: Downloader> {
    repo_id: String,
    config: SyncConfig,
    layout: WorkingLayout,
    downloader: D,
    store: Arc<dyn ContentStore>,
    keyring: Option<Arc<dyn KeyringVerifier>>,
    reporter: Arc<dyn Reporter>,
}

impl<D: Downloader> std::fmt::Debug for SyncPipeline<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("repo_id", &self.repo_id)
            .field("config", &self.config)
            .field("keyring", &self.keyring.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: Downloader> SyncPipeline<D> {
    /// Pipeline for `repo_id`. Signatures can only be enforced once a
    /// keyring is attached with [`with_keyring`](Self::with_keyring).
    pub fn new(
        repo_id: impl Into<String>,
        config: SyncConfig,
        downloader: D,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let layout = WorkingLayout::new(config.working_dir.clone());
        Self {
            repo_id: repo_id.into(),
            config,
            layout,
            downloader,
            store,
            keyring: None,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Verify release signatures with `keyring`.
    #[must_use]
    pub fn with_keyring(mut self, keyring: Arc<dyn KeyringVerifier>) -> Self {
        self.keyring = Some(keyring);
        self
    }

    /// Send progress events to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run every stage.
    ///
    /// # Errors
    ///
    /// Returns the first [`SyncError`] any stage hits. Earlier stages never
    /// associate anything the failing stage would have depended on.
    pub async fn run(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let mut ctx = RunContext {
            report: SyncReport {
                repo_id: self.repo_id.clone(),
                ..SyncReport::default()
            },
            ..RunContext::default()
        };

        let mut stage = Stage::Init;
        while stage != Stage::Done {
            self.reporter.stage(stage);
            let span = tracing::info_span!("stage", repo = %self.repo_id, stage = %stage);
            self.step(stage, &mut ctx).instrument(span).await?;
            stage = stage.next(self.config.remove_missing);
        }
        self.reporter.stage(Stage::Done);

        let mut report = ctx.report;
        report.elapsed_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            "Synced {}: {} packages ({} downloaded, {} present), {} removed",
            self.repo_id,
            report.records,
            report.downloaded,
            report.already_present,
            report.removed()
        );
        self.reporter
            .summary(report.downloaded, report.removed(), report.elapsed_secs);
        Ok(report)
    }

    async fn step(&self, stage: Stage, ctx: &mut RunContext) -> Result<()> {
        tracing::info!("{stage}");
        match stage {
            Stage::Init => self.init(ctx).await,
            Stage::FetchRelease => self.fetch_release(ctx).await,
            Stage::ParseRelease => self.parse_release(ctx).await,
            Stage::FetchPackageIndices => self.fetch_package_indices(ctx).await,
            Stage::ParsePackageIndices => self.parse_package_indices(ctx).await,
            Stage::ResolveLocal => self.resolve_local(ctx).await,
            Stage::FetchMissingContent => self.fetch_missing_content(ctx).await,
            Stage::VerifyAndSaveContent => self.verify_and_save_content(ctx).await,
            Stage::SaveMetadata => self.save_metadata(ctx).await,
            Stage::OrphanCleanup => self.orphan_cleanup(ctx).await,
            Stage::Done => Ok(()),
        }
    }

    fn package_parser(&self) -> PackageIndexParser {
        PackageIndexParser::new(&self.repo_id, &self.config)
    }

    async fn init(&self, ctx: &mut RunContext) -> Result<()> {
        if self.config.require_signature && self.keyring.is_none() {
            return Err(SyncError::Config(
                "require_signature is set but no keyring is configured".to_string(),
            ));
        }
        tokio::fs::create_dir_all(self.layout.root()).await?;

        ctx.candidates = if self.config.remove_missing {
            let candidates = OrphanCandidates::load(self.store.as_ref(), &self.repo_id).await?;
            tracing::debug!(
                "Orphan candidates: {} releases, {} components, {} packages",
                candidates.remaining(UnitKind::Release),
                candidates.remaining(UnitKind::Component),
                candidates.remaining(UnitKind::Package)
            );
            candidates
        } else {
            OrphanCandidates::disabled()
        };
        Ok(())
    }

    async fn fetch_release(&self, ctx: &mut RunContext) -> Result<()> {
        let mut requests = Vec::new();
        for release in &self.config.releases {
            let document = self.layout.release_file(release);
            let signature = self.layout.signature_file(release);
            // A signature left over from an earlier run must not stand in
            // for one that is missing now.
            remove_if_exists(&document).await?;
            remove_if_exists(&signature).await?;

            requests.push(DownloadRequest::new(
                self.config.release_url(release),
                &document,
                (release.clone(), ReleaseFile::Document),
            ));
            requests.push(DownloadRequest::new(
                self.config.signature_url(release),
                &signature,
                (release.clone(), ReleaseFile::Signature),
            ));
            ctx.fetched_releases.insert(
                release.clone(),
                FetchedRelease {
                    document,
                    signature: None,
                    signature_path: signature,
                },
            );
        }

        self.reporter.downloading("release files", requests.len());
        let outcomes = self.downloader.fetch(requests).await;

        let mut failure = None;
        for outcome in outcomes {
            let (release, kind) = &outcome.request.data;
            match (kind, outcome.result) {
                (ReleaseFile::Document, Ok(_)) => {}
                (ReleaseFile::Document, Err(source)) => {
                    tracing::error!("Could not fetch {}: {source}", outcome.request.url);
                    failure.get_or_insert(SyncError::Download {
                        url: outcome.request.url.clone(),
                        source,
                    });
                }
                (ReleaseFile::Signature, Ok(_)) => {
                    if let Some(fetched) = ctx.fetched_releases.get_mut(release) {
                        fetched.signature = Some(outcome.request.destination.clone());
                    }
                }
                (ReleaseFile::Signature, Err(e)) => {
                    if self.config.require_signature {
                        tracing::warn!("No signature for release {release}: {e}");
                        self.reporter
                            .warning(&format!("no signature for release {release}"));
                    } else {
                        tracing::debug!("No signature for release {release}: {e}");
                    }
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    async fn parse_release(&self, ctx: &mut RunContext) -> Result<()> {
        let parser =
            ReleaseIndexParser::new(self.config.require_signature, self.config.allowed_keys.clone());
        if parser.requires_signature()
            && let Some(keyring) = self.keyring.as_deref()
        {
            for key in &self.config.allowed_keys {
                keyring.ensure_key(key, &self.config.keyserver).await?;
            }
        }
        let package_parser = self.package_parser();

        for release in &self.config.releases {
            let Some(fetched) = ctx.fetched_releases.get(release) else {
                continue;
            };
            let document = tokio::fs::read(&fetched.document).await?;
            let signature = match &fetched.signature {
                Some(path) => Some(tokio::fs::read(path).await?),
                None => None,
            };

            let descriptor = parser
                .parse(
                    ReleaseFiles {
                        name: release,
                        document: &document,
                        signature: signature.as_deref(),
                        signature_path: &fetched.signature_path,
                    },
                    self.keyring.as_deref(),
                )
                .await?;
            let components = package_parser.select_components(&descriptor)?;

            let unit = self
                .store
                .get_or_create_unit(&UnitKey::Release {
                    codename: descriptor.codename.clone(),
                    suite: descriptor.suite.clone(),
                })
                .await?;
            ctx.candidates.retain(UnitKind::Release, unit);

            let mut component_units = BTreeMap::new();
            for component in components {
                let id = self
                    .store
                    .get_or_create_unit(&UnitKey::Component {
                        release: unit,
                        name: component.to_string(),
                    })
                    .await?;
                ctx.candidates.retain(UnitKind::Component, id);
                component_units.insert(component.to_string(), id);
            }

            tracing::info!(
                "Release {release} ({}/{}): {} components, {} package indices",
                descriptor.codename,
                descriptor.suite,
                component_units.len(),
                descriptor.references.len()
            );
            ctx.report
                .releases
                .push(format!("{}/{}", descriptor.codename, descriptor.suite));
            ctx.releases.push(ReleaseState {
                descriptor,
                unit,
                components: component_units,
                indices: Vec::new(),
            });
        }
        Ok(())
    }

    async fn fetch_package_indices(&self, ctx: &mut RunContext) -> Result<()> {
        let parser = self.package_parser();
        let mut requests = Vec::new();
        for (idx, state) in ctx.releases.iter().enumerate() {
            let name = &state.descriptor.name;
            for reference in parser.select(&state.descriptor) {
                requests.push(DownloadRequest::new(
                    self.config.index_url(name, &reference.path),
                    self.layout.index_path(name, reference),
                    (idx, reference.clone()),
                ));
            }
        }

        self.reporter.downloading("package indices", requests.len());
        let completed = completed(self.downloader.fetch(requests).await)?;
        for (request, _) in completed {
            let (idx, reference) = request.data;
            if let Some(state) = ctx.releases.get_mut(idx) {
                state.indices.push((reference, request.destination));
            }
        }
        for state in &mut ctx.releases {
            state
                .indices
                .sort_by(|a, b| a.0.path.cmp(&b.0.path));
        }
        Ok(())
    }

    async fn parse_package_indices(&self, ctx: &mut RunContext) -> Result<()> {
        let parser = self.package_parser();
        for state in &ctx.releases {
            for (reference, path) in &state.indices {
                parser
                    .parse_file(&state.descriptor.name, reference, path, &mut ctx.parsed)
                    .await?;
            }
        }
        ctx.report.records = ctx.parsed.len();
        tracing::info!("{} distinct packages listed", ctx.parsed.len());
        Ok(())
    }

    async fn resolve_local(&self, ctx: &mut RunContext) -> Result<()> {
        let existing = self.store.existing_checksums().await?;
        let reconciler = SyncReconciler::new(&self.config, self.layout.clone());
        ctx.plan = reconciler.plan_downloads(&ctx.parsed.records, &existing);
        ctx.report.already_present = ctx.plan.present.len();
        tracing::info!(
            "{} packages to download, {} already present",
            ctx.plan.downloads.len(),
            ctx.plan.present.len()
        );
        Ok(())
    }

    async fn fetch_missing_content(&self, ctx: &mut RunContext) -> Result<()> {
        if ctx.plan.is_empty() {
            return Ok(());
        }
        let requests: Vec<_> = ctx
            .plan
            .downloads
            .values()
            .map(|d| DownloadRequest::new(d.url.clone(), d.destination.clone(), d.checksum.clone()))
            .collect();

        self.reporter.downloading("packages", requests.len());
        let mut fetched: Vec<_> = completed(self.downloader.fetch(requests).await)?
            .into_iter()
            .map(|(request, bytes)| (request.data, request.destination, bytes))
            .collect();
        fetched.sort_by(|a, b| a.1.cmp(&b.1));
        ctx.fetched = fetched;
        Ok(())
    }

    async fn verify_and_save_content(&self, ctx: &mut RunContext) -> Result<()> {
        // The whole batch is checked before anything is stored: one bad file
        // means the source cannot be trusted for this run.
        for (checksum, path, _) in &ctx.fetched {
            if let Verdict::Mismatch(actual) = verify_file(path, checksum).await? {
                return Err(SyncError::ChecksumMismatch {
                    repo_id: self.repo_id.clone(),
                    feed_url: self.config.feed.clone(),
                    filename: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    expected: checksum.clone(),
                    actual,
                });
            }
        }

        for (checksum, path, bytes) in &ctx.fetched {
            let Some(record) = ctx.parsed.records.get(checksum) else {
                continue;
            };
            let id = self.store.persist_content(record, path).await?;
            self.store.associate(&self.repo_id, id).await?;
            ctx.candidates.retain(UnitKind::Package, id);
            ctx.package_units.insert(checksum.clone(), id);
            ctx.report.downloaded += 1;
            ctx.report.downloaded_bytes += bytes;
            self.reporter.saved(record.basename(), Some(*bytes));
            tracing::debug!("Saved {} as {id}", record.filename);
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!("Could not remove {}: {e}", path.display());
            }
        }

        for checksum in &ctx.plan.present {
            let key = UnitKey::Package {
                checksum: checksum.clone(),
            };
            let id = match self.store.find_unit(&key).await? {
                Some(id) => id,
                None => self.store.get_or_create_unit(&key).await?,
            };
            self.store.associate(&self.repo_id, id).await?;
            ctx.candidates.retain(UnitKind::Package, id);
            ctx.package_units.insert(checksum.clone(), id);
        }
        Ok(())
    }

    async fn save_metadata(&self, ctx: &mut RunContext) -> Result<()> {
        let reconciler = SyncReconciler::new(&self.config, self.layout.clone());

        let current = listed_packages(
            ctx.releases.iter().flat_map(|state| {
                state
                    .components
                    .iter()
                    .map(move |(name, unit)| (state.descriptor.name.as_str(), name.as_str(), *unit))
            }),
            &ctx.parsed,
            &ctx.package_units,
        )?;

        for (component, packages) in &current {
            let persisted = self.store.component_packages(*component).await?;
            let updated = reconciler.component_packages(&persisted, packages);
            tracing::debug!(
                "Component {component}: {} -> {} packages",
                persisted.len(),
                updated.len()
            );
            self.store.set_component_packages(*component, updated).await?;
        }

        let mut associated = BTreeSet::new();
        for state in &ctx.releases {
            if associated.insert(state.unit) {
                self.store.associate(&self.repo_id, state.unit).await?;
            }
            for unit in state.components.values() {
                if associated.insert(*unit) {
                    self.store.associate(&self.repo_id, *unit).await?;
                }
            }
        }
        ctx.report.components = current.len();
        Ok(())
    }

    async fn orphan_cleanup(&self, ctx: &mut RunContext) -> Result<()> {
        let orphans = std::mem::take(&mut ctx.candidates).into_orphans();
        if orphans.is_empty() {
            return Ok(());
        }
        tracing::info!("Removing {} orphaned units", orphans.len());
        for (kind, id) in orphans.in_removal_order() {
            self.store.remove(&self.repo_id, id).await?;
            self.reporter.removed(kind, &id.to_string());
            match kind {
                UnitKind::Release => ctx.report.removed_releases += 1,
                UnitKind::Component => ctx.report.removed_components += 1,
                UnitKind::Package => ctx.report.removed_packages += 1,
            }
        }
        Ok(())
    }
}

/// Package units listed by each component unit this run.
///
/// Two configured names can resolve to the same release unit (an alias such
/// as `stable` next to its codename); their lists merge. Every listed digest
/// must have a unit, otherwise the component list would silently lose it.
fn listed_packages<'a>(
    components: impl IntoIterator<Item = (&'a str, &'a str, UnitId)>,
    parsed: &ParsedIndices,
    package_units: &BTreeMap<Checksum, UnitId>,
) -> Result<BTreeMap<UnitId, BTreeSet<UnitId>>> {
    let mut current: BTreeMap<UnitId, BTreeSet<UnitId>> = BTreeMap::new();
    for (release, component, unit) in components {
        let listed = current.entry(unit).or_default();
        for checksum in parsed.packages_for(release, component) {
            let id = package_units
                .get(&checksum)
                .ok_or_else(|| SyncError::UnstoredPackage {
                    release: release.to_string(),
                    component: component.to_string(),
                    checksum: checksum.clone(),
                })?;
            listed.insert(*id);
        }
    }
    Ok(current)
}

/// Split a batch into completed requests, failing on the first error.
fn completed<T>(outcomes: Vec<DownloadOutcome<T>>) -> Result<Vec<(DownloadRequest<T>, u64)>> {
    let mut done = Vec::with_capacity(outcomes.len());
    let mut failure = None;
    for outcome in outcomes {
        match outcome.result {
            Ok(bytes) => done.push((outcome.request, bytes)),
            Err(source) => {
                tracing::error!(
                    "Could not fetch {} ({}): {source}",
                    outcome.request.url,
                    filename_from_url(&outcome.request.url)
                );
                failure.get_or_insert(SyncError::Download {
                    url: outcome.request.url,
                    source,
                });
            }
        }
    }
    failure.map_or(Ok(done), Err)
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_run_in_order() {
        let mut stage = Stage::Init;
        let mut seen = vec![stage];
        while stage != Stage::Done {
            stage = stage.next(true);
            seen.push(stage);
        }
        let names: Vec<_> = seen.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "INIT",
                "FETCH_RELEASE",
                "PARSE_RELEASE",
                "FETCH_PACKAGE_INDICES",
                "PARSE_PACKAGE_INDICES",
                "RESOLVE_LOCAL",
                "FETCH_MISSING_CONTENT",
                "VERIFY_AND_SAVE_CONTENT",
                "SAVE_METADATA",
                "ORPHAN_CLEANUP",
                "DONE"
            ]
        );
    }

    #[test]
    fn cleanup_is_skipped_without_removal() {
        assert_eq!(Stage::SaveMetadata.next(false), Stage::Done);
        assert_eq!(Stage::Done.next(true), Stage::Done);
    }

    #[test]
    fn failed_download_is_first_error() {
        let outcomes = vec![
            DownloadOutcome {
                request: DownloadRequest::new("http://x/a", "/tmp/a", 1),
                result: Ok(3),
            },
            DownloadOutcome {
                request: DownloadRequest::new("http://x/b", "/tmp/b", 2),
                result: Err(crate::download::DownloadError::Status(404)),
            },
        ];
        let err = completed(outcomes).unwrap_err();
        assert!(matches!(err, SyncError::Download { ref url, .. } if url == "http://x/b"));
        assert_eq!(err.code(), "DEBSYNC006");
    }

    fn parsed_with(release: &str, component: &str, body: &[u8]) -> (ParsedIndices, Checksum) {
        let checksum = debsync_schema::ChecksumType::Sha256.digest(body);
        let mut parsed = ParsedIndices::default();
        parsed
            .component_packages
            .entry((release.to_string(), component.to_string()))
            .or_default()
            .insert(checksum.clone());
        (parsed, checksum)
    }

    #[test]
    fn aliased_releases_merge_component_lists() {
        let (mut parsed, hello) = parsed_with("stable", "main", b"hello");
        let (other, bye) = parsed_with("bookworm", "main", b"bye");
        parsed.component_packages.extend(other.component_packages);
        let units = BTreeMap::from([(hello, UnitId(10)), (bye, UnitId(11))]);

        let listed = listed_packages(
            [("stable", "main", UnitId(2)), ("bookworm", "main", UnitId(2))],
            &parsed,
            &units,
        )
        .unwrap();
        assert_eq!(
            listed,
            BTreeMap::from([(UnitId(2), BTreeSet::from([UnitId(10), UnitId(11)]))])
        );
    }

    #[test]
    fn listed_package_without_unit_fails_the_run() {
        let (parsed, hello) = parsed_with("stable", "main", b"hello");
        let err = listed_packages([("stable", "main", UnitId(2))], &parsed, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::UnstoredPackage { ref component, ref checksum, .. }
                if component == "main" && *checksum == hello
        ));
        assert_eq!(err.code(), "DEBSYNC011");
    }
}
