//! # Presence Tracking
//!
//! Keeps the ordered set of users on the document and derives the sequence
//! of view operations needed to show it.
//!
//! The local user's own entry is always first. Users announced as leaving
//! stay visible for a grace period; if they re-enter before it ends the
//! removal is cancelled. The view is only shown in the edit and layout
//! layers.

use crate::model::User;
use std::collections::HashSet;

/// Editor layer, as reported by the embedding page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerMode {
    #[default]
    Edit,
    Layouting,
    Annotate,
    Other,
}

impl LayerMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Edit" => LayerMode::Edit,
            "Layouting" => LayerMode::Layouting,
            "Annotate" => LayerMode::Annotate,
            _ => LayerMode::Other,
        }
    }

    pub fn shows_presence(self) -> bool {
        matches!(self, LayerMode::Edit | LayerMode::Layouting)
    }
}

/// One step for the presence view; applied strictly in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceOp {
    Show,
    Hide,
    SlideIn(User),
    SlideOut(User),
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    own_id: Option<String>,
    users: Vec<User>,
    pending_removal: HashSet<String>,
    /// Users currently on screen, in display order
    rendered: Vec<User>,
    shown: bool,
    layer: LayerMode,
}

impl PresenceTracker {
    pub fn new(own_id: Option<String>, layer: LayerMode) -> Self {
        Self {
            own_id,
            layer,
            ..Default::default()
        }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn is_pending_removal(&self, id: &str) -> bool {
        self.pending_removal.contains(id)
    }

    pub fn layer(&self) -> LayerMode {
        self.layer
    }

    fn is_own(&self, user: &User) -> bool {
        self.own_id.as_deref() == Some(user.id.as_str())
    }

    /// Apply entering users.
    ///
    /// A full snapshot replaces the set; an incremental list appends users
    /// not present yet. Either way a listed user is no longer pending removal.
    pub fn apply_snapshot(&mut self, users: Vec<User>, incremental: bool) -> Vec<PresenceOp> {
        for user in &users {
            self.pending_removal.remove(&user.id);
        }

        if !incremental {
            self.users.clear();
        }
        for user in users {
            if user.id.is_empty() || self.users.iter().any(|u| u.id == user.id) {
                continue;
            }
            if self.is_own(&user) {
                self.users.insert(0, user);
            } else {
                self.users.push(user);
            }
        }

        self.render()
    }

    /// Mark users for removal once the grace period ends.
    ///
    /// Returns the ids that were present and are now pending.
    pub fn begin_removal(&mut self, ids: &[String]) -> Vec<String> {
        let mut pending = Vec::new();
        for id in ids {
            if self.users.iter().any(|u| &u.id == id) {
                self.pending_removal.insert(id.clone());
                pending.push(id.clone());
            }
        }
        pending
    }

    /// Grace period ended; drop users still pending removal
    pub fn finish_removal(&mut self, ids: &[String]) -> Vec<PresenceOp> {
        let expired: HashSet<&String> = ids
            .iter()
            .filter(|id| self.pending_removal.contains(*id))
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        self.users.retain(|u| !expired.contains(&u.id));
        for id in ids {
            self.pending_removal.remove(id);
        }
        self.render()
    }

    pub fn set_layer(&mut self, layer: LayerMode) -> Vec<PresenceOp> {
        self.layer = layer;
        self.render()
    }

    /// Re-render everything, e.g. after the editor rebuilt its overlays
    pub fn refresh(&mut self) -> Vec<PresenceOp> {
        self.rendered.clear();
        self.shown = false;
        self.render()
    }

    /// Operations moving the view from what is rendered to what should be
    fn render(&mut self) -> Vec<PresenceOp> {
        let mut ops = Vec::new();

        if !self.layer.shows_presence() || self.users.is_empty() {
            if self.shown {
                ops.push(PresenceOp::Hide);
            }
            self.shown = false;
            self.rendered.clear();
            return ops;
        }

        if !self.shown {
            ops.push(PresenceOp::Show);
            self.shown = true;
        }

        for user in &self.rendered {
            if !self.users.iter().any(|u| u.id == user.id) {
                ops.push(PresenceOp::SlideOut(user.clone()));
            }
        }
        for user in &self.users {
            if !self.rendered.iter().any(|r| r.id == user.id) {
                ops.push(PresenceOp::SlideIn(user.clone()));
            }
        }

        self.rendered = self.users.clone();
        ops
    }
}
