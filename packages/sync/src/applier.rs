//! # Update Application
//!
//! Turns a batch of deduplicated updates into region refreshes.
//!
//! ## Pipeline
//!
//! ```text
//! updates ─▶ plan: resolve refresh paths to regions (exact, then ancestors)
//!                  └─ any path unresolvable → refresh every top-level region
//!         ─▶ run:  refresh selected regions concurrently, each one
//!                  waiting out the persistence debounce and skipping
//!                  regions the local user just edited
//!         ─▶ join: highlight the last update's paths, then reconcile its
//!                  annotation snapshot
//! ```
//!
//! Failures of single refreshes are logged; the batch always reaches the
//! highlight and reconcile step.

use crate::gate::PersistenceGate;
use crate::model::{AnnotationInfo, Update};
use crate::paths;
use crate::reconcile::{AnnotationReconciler, ReconcileReport};
use crate::surface::{EditorSurface, Region};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

/// Regions selected for refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTargets {
    /// Resolved subset, deduplicated
    Selected(Vec<Region>),
    /// Resolution failed somewhere; every top-level region
    All(Vec<Region>),
}

impl RefreshTargets {
    pub fn regions(&self) -> &[Region] {
        match self {
            RefreshTargets::Selected(regions) | RefreshTargets::All(regions) => regions,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, RefreshTargets::All(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPlan {
    pub targets: RefreshTargets,
    /// Direct paths of the last update, without annotation paths
    pub highlight: Vec<String>,
    /// Annotation snapshot of the last update; absent means none remain
    pub annotations: AnnotationInfo,
}

impl RefreshPlan {
    /// Plan a batch; `None` for an empty batch
    pub fn build(updates: &[Update], editor: &dyn EditorSurface) -> Option<Self> {
        let last = updates.last()?;

        let mut selected = Vec::new();
        let mut seen = HashSet::new();
        let mut refresh_all = false;

        'updates: for update in updates {
            tracing::trace!("Applying update {:?}", update);
            for path in &update.resolve_paths {
                if paths::is_annotation_path(path) {
                    tracing::debug!("Skipping unexpected annotation path {}", path);
                    continue;
                }
                match editor.resolve_or_ancestor(path) {
                    Some(region) => {
                        if seen.insert(region.path.clone()) {
                            tracing::trace!("Added region to refresh: {}", region.path);
                            selected.push(region);
                        } else {
                            tracing::trace!("Already refreshing, ignoring {}", region.path);
                        }
                    }
                    None => {
                        tracing::trace!("Region or parent not found, falling back to full refresh: {}", path);
                        refresh_all = true;
                        break 'updates;
                    }
                }
            }
        }

        let targets = if refresh_all {
            RefreshTargets::All(
                editor
                    .regions()
                    .into_iter()
                    .filter(Region::is_top_level)
                    .collect(),
            )
        } else {
            RefreshTargets::Selected(selected)
        };

        let highlight = last
            .direct_paths
            .iter()
            .filter(|path| !paths::is_annotation_path(path))
            .cloned()
            .collect();

        let annotations = last.annotations.clone().unwrap_or_default();

        Some(Self {
            targets,
            highlight,
            annotations,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    Suppressed,
    Failed,
}

/// Result of one applied batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub refresh_all: bool,
    pub refreshed: Vec<String>,
    /// Regions skipped because the local user just edited them
    pub suppressed: Vec<String>,
    pub failed: Vec<String>,
    pub highlighted: Vec<String>,
    pub reconcile: ReconcileReport,
}

/// Runs planned batches against the editor
#[derive(Clone)]
pub struct Applier {
    editor: Arc<dyn EditorSurface>,
    reconciler: Arc<AnnotationReconciler>,
    gate: Arc<PersistenceGate>,
}

impl Applier {
    pub fn new(
        editor: Arc<dyn EditorSurface>,
        reconciler: Arc<AnnotationReconciler>,
        gate: Arc<PersistenceGate>,
    ) -> Self {
        Self {
            editor,
            reconciler,
            gate,
        }
    }

    /// Refresh, then highlight and reconcile once every refresh settled
    pub async fn run(&self, plan: RefreshPlan, annotation_layer: bool) -> BatchReport {
        let mut report = BatchReport {
            refresh_all: plan.targets.is_full(),
            ..Default::default()
        };
        if report.refresh_all {
            tracing::trace!("Refreshing all top level regions");
        }

        let regions = plan.targets.regions();
        let outcomes = join_all(regions.iter().map(|region| self.refresh_gated(region))).await;
        for (region, outcome) in regions.iter().zip(outcomes) {
            let bucket = match outcome {
                RefreshOutcome::Refreshed => &mut report.refreshed,
                RefreshOutcome::Suppressed => &mut report.suppressed,
                RefreshOutcome::Failed => &mut report.failed,
            };
            bucket.push(region.path.clone());
        }

        for path in &plan.highlight {
            match self.editor.resolve(path) {
                Some(region) => {
                    tracing::trace!("Highlighting: {}", path);
                    self.editor.highlight(&region);
                    report.highlighted.push(path.clone());
                }
                // Normal for removals
                None => tracing::trace!("Region not found for highlight: {}", path),
            }
        }

        report.reconcile = self
            .reconciler
            .reconcile(&plan.annotations, annotation_layer)
            .await;

        report
    }

    async fn refresh_gated(&self, region: &Region) -> RefreshOutcome {
        self.gate.settle().await;

        if self.gate.has_recent_edit(&region.path) {
            tracing::trace!("Skipping refresh due to recent local update: {}", region.path);
            return RefreshOutcome::Suppressed;
        }

        tracing::trace!("Refreshing region {}", region.path);
        match self.editor.refresh(region).await {
            Ok(()) => RefreshOutcome::Refreshed,
            Err(e) => {
                tracing::warn!("Refresh of {} failed: {}", region.path, e);
                RefreshOutcome::Failed
            }
        }
    }
}
