//! Set arithmetic between what upstream advertises and what is stored.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use debsync_schema::{Checksum, PackageRecord, UnitId, UnitKind};

use crate::config::SyncConfig;
use crate::paths::WorkingLayout;
use crate::store::{ContentStore, StoreError};

/// Units previously associated with the repository that this run has not
/// re-affirmed yet.
///
/// Loaded once at the start of a run when missing-content removal is
/// enabled; every unit the run touches is struck off immediately, so what
/// is left at the end is exactly the orphan set.
#[derive(Debug, Default, Clone)]
pub struct OrphanCandidates {
    enabled: bool,
    by_kind: BTreeMap<UnitKind, BTreeSet<UnitId>>,
}

impl OrphanCandidates {
    /// Tracking off: nothing will ever be an orphan.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Tracking on, starting from the given candidates.
    pub fn new(candidates: impl IntoIterator<Item = (UnitKind, UnitId)>) -> Self {
        let mut by_kind: BTreeMap<UnitKind, BTreeSet<UnitId>> = BTreeMap::new();
        for (kind, id) in candidates {
            by_kind.entry(kind).or_default().insert(id);
        }
        Self {
            enabled: true,
            by_kind,
        }
    }

    /// Every unit of every kind currently associated with `repo_id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn load(store: &dyn ContentStore, repo_id: &str) -> Result<Self, StoreError> {
        let mut candidates = Vec::new();
        for kind in UnitKind::ALL {
            for id in store.list_associated(repo_id, kind).await? {
                candidates.push((kind, id));
            }
        }
        Ok(Self::new(candidates))
    }

    /// Strike a unit off the candidate list. Returns whether it was a
    /// candidate.
    pub fn retain(&mut self, kind: UnitKind, id: UnitId) -> bool {
        self.by_kind
            .get_mut(&kind)
            .is_some_and(|set| set.remove(&id))
    }

    /// Remaining candidates of one kind.
    pub fn remaining(&self, kind: UnitKind) -> usize {
        self.by_kind.get(&kind).map_or(0, BTreeSet::len)
    }

    /// What is left: the orphans.
    pub fn into_orphans(mut self) -> OrphanSet {
        if !self.enabled {
            return OrphanSet::default();
        }
        let mut take = |kind| self.by_kind.remove(&kind).unwrap_or_default();
        OrphanSet {
            releases: take(UnitKind::Release),
            components: take(UnitKind::Component),
            packages: take(UnitKind::Package),
        }
    }
}

/// Units to disassociate from the repository, grouped by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OrphanSet {
    /// Release units.
    pub releases: BTreeSet<UnitId>,
    /// Component units.
    pub components: BTreeSet<UnitId>,
    /// Package units.
    pub packages: BTreeSet<UnitId>,
}

impl OrphanSet {
    /// Total number of orphans.
    pub fn len(&self) -> usize {
        self.releases.len() + self.components.len() + self.packages.len()
    }

    /// True if nothing is orphaned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Orphans in removal order: releases, then components, then packages.
    pub fn in_removal_order(&self) -> impl Iterator<Item = (UnitKind, UnitId)> + '_ {
        let tag = |kind: UnitKind, set: &BTreeSet<UnitId>| {
            set.iter().map(move |id| (kind, *id)).collect::<Vec<_>>()
        };
        tag(UnitKind::Release, &self.releases)
            .into_iter()
            .chain(tag(UnitKind::Component, &self.components))
            .chain(tag(UnitKind::Package, &self.packages))
    }
}

/// One package to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDownload {
    /// Content identity.
    pub checksum: Checksum,
    /// Source URL.
    pub url: String,
    /// Sharded destination in the working area.
    pub destination: PathBuf,
}

/// What has to be fetched, and what is already here.
#[derive(Debug, Default, Clone)]
pub struct DownloadPlan {
    /// Missing content by checksum.
    pub downloads: BTreeMap<Checksum, PlannedDownload>,
    /// Content already in the store.
    pub present: BTreeSet<Checksum>,
}

impl DownloadPlan {
    /// Nothing to fetch.
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}

/// Computes download plans and component package lists.
#[derive(Debug, Clone)]
pub struct SyncReconciler {
    config: SyncConfig,
    layout: WorkingLayout,
}

impl SyncReconciler {
    /// Reconciler for one run.
    pub fn new(config: &SyncConfig, layout: WorkingLayout) -> Self {
        Self {
            config: config.clone(),
            layout,
        }
    }

    /// Every record whose checksum is not in `existing` becomes a download.
    ///
    /// Destinations come from [`storage_path`](crate::paths::storage_path).
    /// Two different contents with the same basename would collide there;
    /// the later one gets a checksum-named subdirectory instead.
    pub fn plan_downloads(
        &self,
        records: &BTreeMap<Checksum, PackageRecord>,
        existing: &BTreeSet<Checksum>,
    ) -> DownloadPlan {
        let mut plan = DownloadPlan::default();
        let mut claimed: BTreeSet<PathBuf> = BTreeSet::new();

        for (checksum, record) in records {
            if existing.contains(checksum) {
                plan.present.insert(checksum.clone());
                continue;
            }
            let mut destination = self.layout.package_destination(&record.filename);
            if !claimed.insert(destination.clone()) {
                tracing::warn!(
                    "{} is listed with more than one checksum; storing {checksum} separately",
                    record.basename()
                );
                destination = destination
                    .with_file_name(checksum.as_str())
                    .join(record.basename());
                claimed.insert(destination.clone());
            }
            plan.downloads.insert(
                checksum.clone(),
                PlannedDownload {
                    checksum: checksum.clone(),
                    url: self.config.package_url(&record.filename),
                    destination,
                },
            );
        }
        plan
    }

    /// New package list of a component.
    ///
    /// With removal enabled the list is exactly `current`. Otherwise it is
    /// `persisted` plus `current`, so a package that temporarily vanished
    /// upstream keeps its association.
    pub fn component_packages(
        &self,
        persisted: &BTreeSet<UnitId>,
        current: &BTreeSet<UnitId>,
    ) -> BTreeSet<UnitId> {
        if self.config.remove_missing {
            current.clone()
        } else {
            persisted.union(current).copied().collect()
        }
    }
}
