//! # Region-Set Reconciliation
//!
//! The server declares which regions currently own annotations. The
//! reconciler fetches each owner's entries, then diffs the result against
//! what is rendered locally:
//!
//! - present on both sides with different data → update in place
//! - only rendered locally → remove
//! - only on the server → add
//!
//! Entries whose data already matches produce no operation, so applying the
//! same snapshot twice is a no-op the second time.

use crate::model::AnnotationInfo;
use crate::paths;
use crate::surface::AnnotationSurface;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Container property that is not an annotation entry
const PRIMARY_TYPE: &str = "jcr:primaryType";

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOp<V> {
    Add { path: String, data: V },
    Update { path: String, data: V },
    Remove { path: String },
}

impl<V> ReconcileOp<V> {
    pub fn path(&self) -> &str {
        match self {
            ReconcileOp::Add { path, .. }
            | ReconcileOp::Update { path, .. }
            | ReconcileOp::Remove { path } => path,
        }
    }
}

/// Three-way diff of a remote entry set against a local one.
///
/// Updates and removals come first in local order, followed by additions in
/// remote order.
pub fn diff<V: PartialEq + Clone>(
    remote: &BTreeMap<String, V>,
    local: &BTreeMap<String, V>,
) -> Vec<ReconcileOp<V>> {
    let mut ops = Vec::new();

    for (path, local_data) in local {
        match remote.get(path) {
            Some(remote_data) if remote_data != local_data => ops.push(ReconcileOp::Update {
                path: path.clone(),
                data: remote_data.clone(),
            }),
            Some(_) => {}
            None => ops.push(ReconcileOp::Remove { path: path.clone() }),
        }
    }

    for (path, remote_data) in remote {
        if !local.contains_key(path) {
            ops.push(ReconcileOp::Add {
                path: path.clone(),
                data: remote_data.clone(),
            });
        }
    }

    ops
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub ops: Vec<ReconcileOp<Value>>,
    /// Owners whose metadata could not be fetched; their entries were left alone
    pub failed_owners: Vec<String>,
    /// Layer was inactive and a notice about new annotations was raised
    pub notified: bool,
}

pub struct AnnotationReconciler {
    surface: Arc<dyn AnnotationSurface>,
}

impl AnnotationReconciler {
    pub fn new(surface: Arc<dyn AnnotationSurface>) -> Self {
        Self { surface }
    }

    /// Bring the annotation layer in line with a declared snapshot.
    ///
    /// Entries are only materialized while the annotation layer is active;
    /// otherwise the badge is updated and a notice is raised when the count
    /// grew.
    pub async fn reconcile(&self, info: &AnnotationInfo, layer_active: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let previous = self.surface.set_badge(info.count);
        tracing::trace!("Updated annotation badge to {}", info.count);
        self.surface.set_owners(&info.components);

        if !layer_active {
            if info.count > previous {
                tracing::trace!("Displaying annotation update notice");
                self.surface.notify_available();
                report.notified = true;
            }
            return report;
        }

        let fetches = info.components.iter().map(|owner| {
            let surface = self.surface.clone();
            async move { (owner, surface.fetch(owner).await) }
        });

        let mut remote = BTreeMap::new();
        let mut failed = HashSet::new();
        for (owner, result) in join_all(fetches).await {
            match result {
                Ok(entries) => {
                    for (name, data) in entries {
                        if name == PRIMARY_TYPE || data.is_null() {
                            continue;
                        }
                        remote.insert(paths::annotation_entry_path(owner, &name), data);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to load annotations for {}: {}", owner, e);
                    failed.insert(owner.clone());
                }
            }
        }
        tracing::trace!("Loaded {} annotations from server", remote.len());

        let mut local = self.surface.local_entries();
        local.retain(|path, _| {
            paths::annotation_owner(path)
                .map(|owner| !failed.contains(owner))
                .unwrap_or(true)
        });

        report.ops = diff(&remote, &local);
        for op in &report.ops {
            match op {
                ReconcileOp::Add { path, data } => self.surface.add(path, data),
                ReconcileOp::Update { path, data } => self.surface.update(path, data),
                ReconcileOp::Remove { path } => self.surface.remove(path),
            }
        }

        let mut failed_owners: Vec<String> = failed.into_iter().collect();
        failed_owners.sort();
        report.failed_owners = failed_owners;
        report
    }
}
