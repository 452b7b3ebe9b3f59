//! In-memory collaborators.
//!
//! Record every call instead of rendering anything. Used to replay captured
//! event streams from the command line and to drive sessions in tests.

use crate::errors::{SyncError, SyncResult};
use crate::model::{ClosingSignal, HeartbeatRequest, HeartbeatResponse, Message, User};
use crate::paths;
use crate::presence::PresenceOp;
use crate::surface::{AnnotationSurface, EditorSurface, PresenceSurface, Region, SideChannel};
use crate::transport::{ByteStream, Connector, StreamRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Calls made against a [`MemoryEditor`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorLog {
    pub refreshed: Vec<String>,
    pub highlighted: Vec<String>,
    pub warnings: usize,
}

#[derive(Debug, Default)]
struct EditorState {
    document_id: Option<String>,
    regions: Vec<String>,
    /// Region path to holder id
    leased: BTreeMap<String, String>,
    failing: HashSet<String>,
    refresh_delay: Option<Duration>,
    log: EditorLog,
}

/// Editor whose regions are plain paths.
///
/// A region's parent is its nearest registered ancestor; regions without one
/// are top level.
#[derive(Debug, Default)]
pub struct MemoryEditor {
    state: Mutex<EditorState>,
}

impl MemoryEditor {
    pub fn new(document_id: Option<&str>) -> Self {
        Self::with_regions(document_id, Vec::<String>::new())
    }

    pub fn with_regions<I, S>(document_id: Option<&str>, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let editor = Self::default();
        {
            let mut state = editor.state.lock();
            state.document_id = document_id.map(str::to_string);
            state.regions = regions.into_iter().map(Into::into).collect();
        }
        editor
    }

    pub fn add_region(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = self.state.lock();
        if !state.regions.contains(&path) {
            state.regions.push(path);
        }
    }

    pub fn remove_region(&self, path: &str) {
        let mut state = self.state.lock();
        state.regions.retain(|r| r != path);
        state.leased.remove(path);
    }

    pub fn set_document_id(&self, document_id: Option<&str>) {
        self.state.lock().document_id = document_id.map(str::to_string);
    }

    /// Make refreshes of `path` fail
    pub fn fail_refresh(&self, path: impl Into<String>) {
        self.state.lock().failing.insert(path.into());
    }

    /// Make every refresh take `delay`
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.lock().refresh_delay = Some(delay);
    }

    /// Lease marks currently shown, path to holder id
    pub fn leased(&self) -> BTreeMap<String, String> {
        self.state.lock().leased.clone()
    }

    /// Forget every mark, as if overlays were rebuilt
    pub fn clear_marks(&self) {
        self.state.lock().leased.clear();
    }

    pub fn log(&self) -> EditorLog {
        self.state.lock().log.clone()
    }

    fn region(state: &EditorState, path: &str) -> Region {
        let parent = paths::ancestors(path)
            .into_iter()
            .find(|p| state.regions.iter().any(|r| r == p))
            .map(str::to_string);
        Region::new(path, parent)
    }
}

#[async_trait]
impl EditorSurface for MemoryEditor {
    fn document_id(&self) -> Option<String> {
        self.state.lock().document_id.clone()
    }

    fn resolve(&self, path: &str) -> Option<Region> {
        let state = self.state.lock();
        if state.regions.iter().any(|r| r == path) {
            Some(Self::region(&state, path))
        } else {
            None
        }
    }

    fn regions(&self) -> Vec<Region> {
        let state = self.state.lock();
        state
            .regions
            .iter()
            .map(|path| Self::region(&state, path))
            .collect()
    }

    fn mark_leased(&self, region: &Region, holder: &User) {
        self.state
            .lock()
            .leased
            .insert(region.path.clone(), holder.id.clone());
    }

    fn mark_released(&self, region: &Region) {
        self.state.lock().leased.remove(&region.path);
    }

    async fn refresh(&self, region: &Region) -> SyncResult<()> {
        let delay = self.state.lock().refresh_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing.contains(&region.path) {
            return Err(SyncError::Refresh {
                path: region.path.clone(),
                reason: "render failed".to_string(),
            });
        }
        state.log.refreshed.push(region.path.clone());
        Ok(())
    }

    fn highlight(&self, region: &Region) {
        self.state.lock().log.highlighted.push(region.path.clone());
    }

    fn show_conflict_warning(&self) {
        self.state.lock().log.warnings += 1;
    }
}

#[derive(Debug, Default)]
struct PresenceState {
    ops: Vec<PresenceOp>,
    rendered: Vec<User>,
    visible: bool,
}

/// Presence bar that keeps the rendered list
#[derive(Debug, Default)]
pub struct MemoryPresence {
    state: Mutex<PresenceState>,
    animation: Duration,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every slide takes `animation`
    pub fn with_animation(animation: Duration) -> Self {
        Self {
            animation,
            ..Default::default()
        }
    }

    pub fn ops(&self) -> Vec<PresenceOp> {
        self.state.lock().ops.clone()
    }

    /// Ids on screen, in display order
    pub fn rendered(&self) -> Vec<String> {
        self.state
            .lock()
            .rendered
            .iter()
            .map(|u| u.id.clone())
            .collect()
    }

    pub fn is_visible(&self) -> bool {
        self.state.lock().visible
    }

    async fn animate(&self) {
        if !self.animation.is_zero() {
            tokio::time::sleep(self.animation).await;
        }
    }
}

#[async_trait]
impl PresenceSurface for MemoryPresence {
    fn show(&self) {
        let mut state = self.state.lock();
        state.ops.push(PresenceOp::Show);
        state.visible = true;
    }

    fn hide(&self) {
        let mut state = self.state.lock();
        state.ops.push(PresenceOp::Hide);
        state.visible = false;
        state.rendered.clear();
    }

    async fn slide_in(&self, user: &User) {
        self.animate().await;
        let mut state = self.state.lock();
        state.ops.push(PresenceOp::SlideIn(user.clone()));
        state.rendered.push(user.clone());
    }

    async fn slide_out(&self, user: &User) {
        self.animate().await;
        let mut state = self.state.lock();
        state.ops.push(PresenceOp::SlideOut(user.clone()));
        state.rendered.retain(|u| u.id != user.id);
    }
}

#[derive(Debug, Default)]
struct AnnotationState {
    remote: HashMap<String, Map<String, Value>>,
    local: BTreeMap<String, Value>,
    badge: u32,
    owners: Vec<String>,
    notices: usize,
}

/// Annotation layer backed by a map of remote containers.
///
/// Fetching an owner with no remote container fails.
#[derive(Debug, Default)]
pub struct MemoryAnnotations {
    state: Mutex<AnnotationState>,
}

impl MemoryAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-side container of `owner`; non-object values clear it
    pub fn set_remote(&self, owner: impl Into<String>, container: Value) {
        let container = match container {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.lock().remote.insert(owner.into(), container);
    }

    pub fn badge(&self) -> u32 {
        self.state.lock().badge
    }

    pub fn owners(&self) -> Vec<String> {
        self.state.lock().owners.clone()
    }

    /// Number of "newer annotations available" notices shown
    pub fn notices(&self) -> usize {
        self.state.lock().notices
    }
}

#[async_trait]
impl AnnotationSurface for MemoryAnnotations {
    async fn fetch(&self, owner_path: &str) -> SyncResult<Map<String, Value>> {
        self.state
            .lock()
            .remote
            .get(owner_path)
            .cloned()
            .ok_or_else(|| SyncError::Fetch {
                path: owner_path.to_string(),
                reason: "not found".to_string(),
            })
    }

    fn local_entries(&self) -> BTreeMap<String, Value> {
        self.state.lock().local.clone()
    }

    fn add(&self, path: &str, data: &Value) {
        self.state.lock().local.insert(path.to_string(), data.clone());
    }

    fn update(&self, path: &str, data: &Value) {
        self.state.lock().local.insert(path.to_string(), data.clone());
    }

    fn remove(&self, path: &str) {
        self.state.lock().local.remove(path);
    }

    fn set_badge(&self, count: u32) -> u32 {
        std::mem::replace(&mut self.state.lock().badge, count)
    }

    fn set_owners(&self, owners: &[String]) {
        self.state.lock().owners = owners.to_vec();
    }

    fn notify_available(&self) {
        self.state.lock().notices += 1;
    }
}

#[derive(Debug, Default)]
struct LeaseServerState {
    users: HashMap<String, User>,
    /// Region path to holding client id
    leases: BTreeMap<String, String>,
    requests: Vec<HeartbeatRequest>,
    closing: Vec<ClosingSignal>,
    failures: usize,
}

/// Side channel arbitrating leases between the clients sharing it.
///
/// A region held by one client is refused to every other client unless both
/// belong to the same user.
#[derive(Debug, Default)]
pub struct MemoryLeaseServer {
    state: Mutex<LeaseServerState>,
}

impl MemoryLeaseServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the user behind a client id
    pub fn join(&self, uid: &str, user: User) {
        self.state.lock().users.insert(uid.to_string(), user);
    }

    /// Fail the next `count` posts with a transport error
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures = count;
    }

    /// Held regions, path to client id
    pub fn leases(&self) -> BTreeMap<String, String> {
        self.state.lock().leases.clone()
    }

    pub fn requests(&self) -> Vec<HeartbeatRequest> {
        self.state.lock().requests.clone()
    }

    pub fn closing(&self) -> Vec<ClosingSignal> {
        self.state.lock().closing.clone()
    }

    fn user_of(state: &LeaseServerState, uid: &str) -> String {
        state
            .users
            .get(uid)
            .map(|u| u.id.clone())
            .unwrap_or_else(|| uid.to_string())
    }

    fn may_lease(state: &LeaseServerState, uid: &str, path: &str) -> bool {
        match state.leases.get(path) {
            Some(holder) => holder == uid || Self::user_of(state, holder) == Self::user_of(state, uid),
            None => true,
        }
    }
}

#[async_trait]
impl SideChannel for MemoryLeaseServer {
    async fn heartbeat(
        &self,
        _document_id: &str,
        request: &HeartbeatRequest,
    ) -> SyncResult<HeartbeatResponse> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if state.failures > 0 {
            state.failures -= 1;
            return Err(SyncError::transport("connection refused"));
        }

        let uid = request.uid.as_str();
        let claim = match (&request.lease_path, request.release) {
            (Some(path), false) => path.clone(),
            _ => {
                state.leases.retain(|_, holder| holder != uid);
                return Ok(HeartbeatResponse::default());
            }
        };

        if !Self::may_lease(&state, uid, &claim) {
            return Ok(HeartbeatResponse { rejected: true });
        }
        state.leases.retain(|_, holder| holder != uid);
        state.leases.insert(claim, uid.to_string());
        Ok(HeartbeatResponse::default())
    }

    fn send_closing(&self, signal: &ClosingSignal) {
        let mut state = self.state.lock();
        state.leases.retain(|_, holder| holder != signal.uid.as_str());
        state.closing.push(signal.clone());
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    opens: Vec<StreamRequest>,
    current: Option<mpsc::UnboundedSender<SyncResult<Vec<u8>>>>,
    refuse_next: bool,
}

/// Connector whose streams are fed by hand
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    state: Mutex<ConnectorState>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests of every open attempt so far
    pub fn opens(&self) -> Vec<StreamRequest> {
        self.state.lock().opens.clone()
    }

    pub fn refuse_next(&self) {
        self.state.lock().refuse_next = true;
    }

    /// Push raw bytes on the current connection
    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> bool {
        match &self.state.lock().current {
            Some(tx) => tx.send(Ok(bytes.into())).is_ok(),
            None => false,
        }
    }

    /// Push one message as a complete event
    pub fn send(&self, message: &Message) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send_raw(format!("data: {}\n\n", json)),
            Err(_) => false,
        }
    }

    /// End the current connection cleanly
    pub fn disconnect(&self) {
        self.state.lock().current = None;
    }

    /// End the current connection with an error
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = self.state.lock().current.take() {
            let _ = tx.send(Err(SyncError::transport(reason)));
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, request: &StreamRequest) -> SyncResult<ByteStream> {
        let mut state = self.state.lock();
        state.opens.push(request.clone());
        if std::mem::take(&mut state.refuse_next) {
            return Err(SyncError::transport("connection refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
