//! # Lease Coordinator
//!
//! Tracks which regions other sessions hold and which region this session
//! believes it holds.
//!
//! The lease mapping is keyed by region path, so two leases for one region can
//! never coexist; a later lease for the same path replaces the earlier one.
//! The local intent changes only through local acquire/release actions, a
//! server rejection, or a release naming the intended path.

use crate::model::{ClientId, HeartbeatRequest, Lease, Release, User};
use crate::surface::EditorSurface;
use std::collections::{BTreeMap, HashMap};

/// Outcome of a lease request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Accepted,
    Rejected,
}

/// Regions whose lock state changed while applying server state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseChanges {
    pub leased: Vec<String>,
    pub released: Vec<String>,
    /// Paths that could not be resolved to a region and were skipped
    pub unresolved: Vec<String>,
}

impl LeaseChanges {
    pub fn is_empty(&self) -> bool {
        self.leased.is_empty() && self.released.is_empty()
    }

    fn merge(&mut self, other: LeaseChanges) {
        self.leased.extend(other.leased);
        self.released.extend(other.released);
        self.unresolved.extend(other.unresolved);
    }
}

#[derive(Debug, Default)]
pub struct LeaseCoordinator {
    leases: HashMap<String, Lease>,
    intent: Option<String>,
}

impl LeaseCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Region this session believes it holds
    pub fn intent(&self) -> Option<&str> {
        self.intent.as_deref()
    }

    pub fn get(&self, path: &str) -> Option<&Lease> {
        self.leases.get(path)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Lease holders keyed by region path
    pub fn holders(&self) -> BTreeMap<String, User> {
        self.leases
            .iter()
            .map(|(path, lease)| (path.clone(), lease.user.clone()))
            .collect()
    }

    /// Heartbeat carrying the current claim
    pub fn claim_request(&self, uid: &ClientId) -> HeartbeatRequest {
        HeartbeatRequest {
            uid: uid.clone(),
            lease_path: self.intent.clone(),
            release: false,
        }
    }

    /// Local acquire action; the intent is held until released or rejected
    pub fn acquire(&mut self, uid: &ClientId, path: impl Into<String>) -> HeartbeatRequest {
        let path = path.into();
        tracing::debug!("Requesting lease for {}", path);
        self.intent = Some(path.clone());
        HeartbeatRequest {
            uid: uid.clone(),
            lease_path: Some(path),
            release: false,
        }
    }

    /// Local release action. `None` when nothing is held.
    pub fn release(&mut self, uid: &ClientId) -> Option<HeartbeatRequest> {
        let path = self.intent.take()?;
        tracing::debug!("Releasing lease for {}", path);
        Some(HeartbeatRequest {
            uid: uid.clone(),
            lease_path: None,
            release: true,
        })
    }

    /// Server rejected a claim on `claimed`.
    ///
    /// Returns true if that claim was still the current intent and has been
    /// dropped; a rejection for a superseded claim leaves the intent alone.
    pub fn reject(&mut self, claimed: &str) -> bool {
        if self.intent.as_deref() == Some(claimed) {
            self.intent = None;
            true
        } else {
            false
        }
    }

    /// Apply a lease list from the server.
    ///
    /// A full snapshot replaces the mapping and unlocks regions missing from
    /// it; an incremental list only adds or overwrites entries.
    pub fn apply_snapshot(
        &mut self,
        leases: Vec<Lease>,
        incremental: bool,
        editor: &dyn EditorSurface,
    ) -> LeaseChanges {
        let mut changes = LeaseChanges::default();
        let previous = if incremental {
            HashMap::new()
        } else {
            std::mem::take(&mut self.leases)
        };

        for lease in leases {
            match editor.resolve(&lease.path) {
                Some(region) => editor.mark_leased(&region, &lease.user),
                None => {
                    tracing::error!("Cannot apply lease, region not found: {}", lease.path);
                    changes.unresolved.push(lease.path.clone());
                }
            }
            changes.leased.push(lease.path.clone());
            self.leases.insert(lease.path.clone(), lease);
        }

        let mut dropped: Vec<String> = previous
            .into_keys()
            .filter(|path| !self.leases.contains_key(path))
            .collect();
        dropped.sort();
        for path in dropped {
            match editor.resolve(&path) {
                Some(region) => editor.mark_released(&region),
                None => {
                    tracing::error!("Cannot remove lease, region not found: {}", path);
                    changes.unresolved.push(path.clone());
                }
            }
            changes.released.push(path);
        }

        changes
    }

    /// Remove every released path from the mapping and unlock its region
    pub fn apply_releases(&mut self, releases: &[Release], editor: &dyn EditorSurface) -> LeaseChanges {
        let mut changes = LeaseChanges::default();

        for path in releases.iter().flat_map(|r| r.paths.iter()) {
            self.leases.remove(path);
            if self.intent.as_deref() == Some(path.as_str()) {
                tracing::debug!("Own lease released by server: {}", path);
                self.intent = None;
            }
            match editor.resolve(path) {
                Some(region) => editor.mark_released(&region),
                None => {
                    tracing::debug!("Cannot apply release, region not found: {}", path);
                    changes.unresolved.push(path.clone());
                }
            }
            changes.released.push(path.clone());
        }

        changes
    }

    /// Re-apply leased marks after the editor recreated its overlays
    pub fn refresh_marks(&self, editor: &dyn EditorSurface) -> LeaseChanges {
        let mut changes = LeaseChanges::default();
        for region in editor.regions() {
            if let Some(lease) = self.leases.get(&region.path) {
                tracing::trace!("Refreshing lease mark for {}", lease.path);
                editor.mark_leased(&region, &lease.user);
                changes.leased.push(lease.path.clone());
            }
        }
        changes
    }

    /// Apply leases and releases of one message in order
    pub fn apply_message(
        &mut self,
        leases: Vec<Lease>,
        releases: &[Release],
        incremental: bool,
        editor: &dyn EditorSurface,
    ) -> LeaseChanges {
        let mut changes = LeaseChanges::default();
        if !leases.is_empty() || !incremental {
            changes.merge(self.apply_snapshot(leases, incremental, editor));
        }
        if !releases.is_empty() {
            changes.merge(self.apply_releases(releases, editor));
        }
        changes
    }
}
