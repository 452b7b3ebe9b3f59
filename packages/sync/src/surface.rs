//! # Collaborator Interfaces
//!
//! The engine never touches the editor, the presence bar or the annotation
//! layer directly. Everything it needs from the embedding page is injected
//! through these traits, so the session has no global state of its own.

use crate::errors::SyncResult;
use crate::model::{ClosingSignal, HeartbeatRequest, HeartbeatResponse, User};
use crate::paths;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// An addressable, independently editable unit of the document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub path: String,
    pub parent: Option<String>,
}

impl Region {
    pub fn new(path: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            path: path.into(),
            parent,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

/// Document model owning regions and their overlays
#[async_trait]
pub trait EditorSurface: Send + Sync {
    /// Identity of the edited document, if the editor knows it yet
    fn document_id(&self) -> Option<String>;

    /// Exact lookup; `None` when no region has this path
    fn resolve(&self, path: &str) -> Option<Region>;

    /// Nearest resolvable ancestor of `path`
    fn resolve_ancestor(&self, path: &str) -> Option<Region> {
        paths::ancestors(path)
            .into_iter()
            .find_map(|parent| self.resolve(parent))
    }

    fn resolve_or_ancestor(&self, path: &str) -> Option<Region> {
        self.resolve(path).or_else(|| self.resolve_ancestor(path))
    }

    /// All regions currently rendered
    fn regions(&self) -> Vec<Region>;

    fn mark_leased(&self, region: &Region, holder: &User);

    fn mark_released(&self, region: &Region);

    /// Re-render a region from the server
    async fn refresh(&self, region: &Region) -> SyncResult<()>;

    fn highlight(&self, region: &Region);

    /// Non-blocking "someone else is editing this" warning
    fn show_conflict_warning(&self);
}

/// The bar showing who else is on the document
#[async_trait]
pub trait PresenceSurface: Send + Sync {
    fn show(&self);

    fn hide(&self);

    /// Completes when the entry animation has finished
    async fn slide_in(&self, user: &User);

    async fn slide_out(&self, user: &User);
}

/// Annotation layer and its locally rendered entries
#[async_trait]
pub trait AnnotationSurface: Send + Sync {
    /// Annotation container of one owning region, keyed by entry name
    async fn fetch(&self, owner_path: &str) -> SyncResult<Map<String, Value>>;

    /// Rendered entries keyed by entry path
    fn local_entries(&self) -> BTreeMap<String, Value>;

    fn add(&self, path: &str, data: &Value);

    fn update(&self, path: &str, data: &Value);

    fn remove(&self, path: &str);

    /// Set the badge count and return the previous one
    fn set_badge(&self, count: u32) -> u32;

    fn set_owners(&self, owners: &[String]);

    /// Tell the user newer annotations exist outside the annotation layer
    fn notify_available(&self);
}

/// Request/response channel next to the event stream
#[async_trait]
pub trait SideChannel: Send + Sync {
    async fn heartbeat(
        &self,
        document_id: &str,
        request: &HeartbeatRequest,
    ) -> SyncResult<HeartbeatResponse>;

    /// Fire-and-forget; no acknowledgment is awaited
    fn send_closing(&self, signal: &ClosingSignal);
}

/// Everything a session talks to
#[derive(Clone)]
pub struct Collaborators {
    pub editor: Arc<dyn EditorSurface>,
    pub presence: Arc<dyn PresenceSurface>,
    pub annotations: Arc<dyn AnnotationSurface>,
    pub channel: Arc<dyn SideChannel>,
    pub connector: Arc<dyn crate::transport::Connector>,
}
