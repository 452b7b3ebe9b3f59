//! # Sync Session
//!
//! Owns every session-scoped entity and runs the single event loop that
//! mutates them.
//!
//! ```text
//!   SessionHandle ──commands──┐
//!   event stream ──messages───┼──▶ loop ──▶ leases / dedup markers / presence
//!   spawned tasks ──results───┤
//!   heartbeat timer ──────────┘
//! ```
//!
//! Network calls and timers never run on the loop itself: they are spawned
//! and post their results back, so handlers never interleave over shared
//! state. Refresh batches are the exception. They only read the editor and
//! the persistence gate, so they run to completion on their own task.

use crate::applier::{Applier, BatchReport, RefreshPlan};
use crate::config::SyncSettings;
use crate::errors::{SyncError, SyncResult};
use crate::gate::PersistenceGate;
use crate::heartbeat::{self, HeartbeatSchedule};
use crate::lease::{LeaseChanges, LeaseCoordinator, LeaseOutcome};
use crate::model::{ClientId, ClosingSignal, HeartbeatRequest, HeartbeatResponse, Message, User};
use crate::presence::{LayerMode, PresenceOp, PresenceTracker};
use crate::reconcile::AnnotationReconciler;
use crate::surface::{Collaborators, PresenceSurface};
use crate::tracker::UpdateTracker;
use crate::transport::{ConnectionState, StreamRequest, Transport, TransportEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Per-session identity and initial state
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: ClientId,
    /// Document being edited; recovered from the editor when unknown
    pub document_id: Option<String>,
    /// Id of the local user, pinned first in the presence bar
    pub user_id: Option<String>,
    pub layer: LayerMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: ClientId::generate(),
            document_id: None,
            user_id: None,
            layer: LayerMode::Edit,
        }
    }
}

/// Read-only view of the session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub client_id: ClientId,
    pub document_id: Option<String>,
    pub intent: Option<String>,
    pub leases: BTreeMap<String, User>,
    pub users: Vec<User>,
    pub markers: BTreeMap<String, u64>,
    pub connection: ConnectionState,
    pub layer: LayerMode,
}

/// What processing one inbound message did
#[derive(Debug, Default)]
pub struct Dispatch {
    pub leases: LeaseChanges,
    pub accepted_updates: usize,
    pub dropped_updates: usize,
    pub presence: Vec<PresenceOp>,
    /// Users now pending removal
    pub exits: Vec<String>,
    /// Refresh batch started by the message, if any update was new
    pub batch: Option<JoinHandle<BatchReport>>,
}

impl Dispatch {
    /// Wait for the refresh batch to settle
    pub async fn settled(self) -> Option<BatchReport> {
        match self.batch?.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!("Refresh batch failed: {}", e);
                None
            }
        }
    }
}

enum Command {
    RequestLease {
        path: String,
        reply: oneshot::Sender<SyncResult<LeaseOutcome>>,
    },
    ReleaseLease {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    SetLayer(LayerMode),
    RefreshUi,
    Deliver {
        message: Message,
        reply: oneshot::Sender<Dispatch>,
    },
    Reconnect,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Side channel post awaiting its response
enum Post {
    Heartbeat,
    Lease {
        reply: oneshot::Sender<SyncResult<LeaseOutcome>>,
    },
    Release {
        reply: oneshot::Sender<SyncResult<()>>,
    },
}

impl Post {
    fn fail(self, error: SyncError) {
        match self {
            Post::Heartbeat => {}
            Post::Lease { reply } => {
                let _ = reply.send(Err(error));
            }
            Post::Release { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

enum Internal {
    Posted {
        claim: Option<String>,
        post: Post,
        result: SyncResult<HeartbeatResponse>,
    },
    GraceElapsed(Vec<String>),
}

/// Cloneable front door to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    gate: Arc<PersistenceGate>,
    client_id: ClientId,
}

impl SessionHandle {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| SyncError::SessionClosed)
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Ask for exclusive editing rights on a region.
    ///
    /// On rejection the conflict warning is shown by the session after the
    /// configured delay.
    pub async fn request_lease(&self, path: impl Into<String>) -> SyncResult<LeaseOutcome> {
        let path = path.into();
        self.call(|reply| Command::RequestLease { path, reply }).await?
    }

    /// Give up the current lease; a no-op when nothing is held
    pub async fn release_lease(&self) -> SyncResult<()> {
        self.call(|reply| Command::ReleaseLease { reply }).await?
    }

    /// A local save started or finished
    pub fn note_persistence(&self) {
        self.gate.note_persistence();
    }

    /// Regions the editor re-rendered after a local change
    pub fn note_local_edits<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gate.note_local_edits(paths)
    }

    pub async fn set_layer(&self, layer: LayerMode) -> SyncResult<()> {
        self.send(Command::SetLayer(layer)).await
    }

    /// Re-apply lease marks and presence after the editor rebuilt overlays
    pub async fn refresh_ui(&self) -> SyncResult<()> {
        self.send(Command::RefreshUi).await
    }

    /// Process a message as if it arrived on the event stream
    pub async fn deliver(&self, message: Message) -> SyncResult<Dispatch> {
        self.call(|reply| Command::Deliver { message, reply }).await
    }

    /// Drop the current connection and open a new one
    pub async fn reconnect(&self) -> SyncResult<()> {
        self.send(Command::Reconnect).await
    }

    pub async fn snapshot(&self) -> SyncResult<SessionSnapshot> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// Page is unloading: signal the server and stop the session
    pub async fn close(&self) -> SyncResult<()> {
        self.call(|reply| Command::Close { reply }).await
    }
}

pub struct SyncSession {
    settings: SyncSettings,
    client_id: ClientId,
    document_id: Option<String>,
    collab: Collaborators,
    leases: LeaseCoordinator,
    tracker: UpdateTracker,
    presence: PresenceTracker,
    applier: Applier,
    heartbeat: HeartbeatSchedule,
    transport: Transport,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    animations: mpsc::UnboundedSender<PresenceOp>,
    animation_rx: Option<mpsc::UnboundedReceiver<PresenceOp>>,
}

impl SyncSession {
    pub fn new(
        settings: SyncSettings,
        options: SessionOptions,
        collab: Collaborators,
    ) -> (Self, SessionHandle) {
        let (command_tx, commands) = mpsc::channel(settings.event_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (animations, animation_rx) = mpsc::unbounded_channel();

        let gate = Arc::new(PersistenceGate::new(settings.persistence_debounce()));
        let reconciler = Arc::new(AnnotationReconciler::new(collab.annotations.clone()));
        let applier = Applier::new(collab.editor.clone(), reconciler, gate.clone());

        let handle = SessionHandle {
            commands: command_tx,
            gate,
            client_id: options.client_id.clone(),
        };

        let session = Self {
            heartbeat: HeartbeatSchedule::new(settings.heartbeat_interval(), settings.heartbeat_recover()),
            tracker: UpdateTracker::new(settings.marker_ttl()),
            presence: PresenceTracker::new(options.user_id, options.layer),
            settings,
            client_id: options.client_id,
            document_id: options.document_id,
            collab,
            leases: LeaseCoordinator::new(),
            applier,
            transport: Transport::new(),
            commands,
            internal_tx,
            internal_rx,
            transport_tx,
            transport_rx,
            animations,
            animation_rx: Some(animation_rx),
        };

        (session, handle)
    }

    /// Create a session and run it on the current runtime
    pub fn spawn(
        settings: SyncSettings,
        options: SessionOptions,
        collab: Collaborators,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (session, handle) = Self::new(settings, options, collab);
        (handle, tokio::spawn(session.run()))
    }

    /// Run until closed or every handle is dropped
    pub async fn run(mut self) {
        if let Some(ops) = self.animation_rx.take() {
            tokio::spawn(run_animations(self.collab.presence.clone(), ops));
        }
        self.connect();
        self.heartbeat.schedule_next();

        loop {
            let deadline = self.heartbeat.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("All session handles dropped");
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(event) = self.transport_rx.recv() => self.handle_transport(event),
                _ = heartbeat::sleep_until(deadline) => self.send_heartbeat(),
            }
        }

        self.transport.disconnect();
        tracing::debug!("Session {} stopped", self.client_id);
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::RequestLease { path, reply } => {
                let request = self.leases.acquire(&self.client_id, path);
                self.post(request, Post::Lease { reply });
            }
            Command::ReleaseLease { reply } => match self.leases.release(&self.client_id) {
                Some(request) => self.post(request, Post::Release { reply }),
                None => {
                    let _ = reply.send(Ok(()));
                }
            },
            Command::SetLayer(layer) => {
                tracing::debug!("Layer changed to {:?}", layer);
                let ops = self.presence.set_layer(layer);
                self.animate(ops);
            }
            Command::RefreshUi => {
                tracing::debug!("Refreshing UI");
                self.leases.refresh_marks(self.collab.editor.as_ref());
                let ops = self.presence.refresh();
                self.animate(ops);
            }
            Command::Deliver { message, reply } => {
                let dispatch = self.dispatch(message);
                let _ = reply.send(dispatch);
            }
            Command::Reconnect => self.connect(),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Close { reply } => {
                self.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Posted { claim, post, result } => self.on_posted(claim, post, result),
            Internal::GraceElapsed(ids) => {
                let ops = self.presence.finish_removal(&ids);
                self.animate(ops);
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { connection } => self.transport.on_opened(connection),
            TransportEvent::Message { connection, message } => {
                if self.transport.is_current(connection) {
                    // The batch keeps running detached
                    let _ = self.dispatch(message);
                }
            }
            TransportEvent::Closed { connection, error } => {
                self.transport.on_closed(connection, error.as_deref())
            }
        }
    }

    /// Apply one inbound message: leases, releases, updates, entering and
    /// leaving users, in that order
    fn dispatch(&mut self, message: Message) -> Dispatch {
        let incremental = message.is_incremental();
        let Message {
            leases,
            releases,
            updates,
            user_enter,
            user_exit,
            ..
        } = message;
        let editor = self.collab.editor.clone();
        let mut dispatch = Dispatch::default();

        dispatch.leases = self
            .leases
            .apply_message(leases, &releases, incremental, editor.as_ref());

        if !updates.is_empty() {
            let now = Instant::now();
            self.tracker.evict_stale(now);
            let total = updates.len();
            let fresh = self.tracker.filter_new(updates, now);
            dispatch.accepted_updates = fresh.len();
            dispatch.dropped_updates = total - fresh.len();

            if let Some(plan) = RefreshPlan::build(&fresh, editor.as_ref()) {
                let applier = self.applier.clone();
                let annotation_layer = self.presence.layer() == LayerMode::Annotate;
                dispatch.batch = Some(tokio::spawn(async move {
                    applier.run(plan, annotation_layer).await
                }));
            }
        }

        // A setup message is authoritative even when nobody is listed
        if !user_enter.is_empty() || !incremental {
            dispatch.presence = self.presence.apply_snapshot(user_enter, incremental);
            self.animate(dispatch.presence.clone());
        }

        if !user_exit.is_empty() {
            dispatch.exits = self.presence.begin_removal(&user_exit);
            if !dispatch.exits.is_empty() {
                let ids = dispatch.exits.clone();
                let grace = self.settings.presence_grace();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = internal.send(Internal::GraceElapsed(ids));
                });
            }
        }

        dispatch
    }

    fn document_id(&mut self) -> Option<String> {
        if self.document_id.is_none() {
            self.document_id = self.collab.editor.document_id();
            if let Some(id) = &self.document_id {
                tracing::debug!("Recovered document identity {}", id);
            }
        }
        self.document_id.clone()
    }

    fn connect(&mut self) {
        let Some(document_id) = self.document_id() else {
            tracing::error!("Unable to set up server connection, no document identity");
            return;
        };
        let request = StreamRequest::new(self.client_id.clone(), document_id);
        self.transport
            .connect(self.collab.connector.clone(), request, self.transport_tx.clone());
    }

    fn send_heartbeat(&mut self) {
        tracing::trace!("Trigger heartbeat");
        let request = self.leases.claim_request(&self.client_id);
        self.post(request, Post::Heartbeat);
    }

    /// Post on the side channel, replacing the pending heartbeat
    fn post(&mut self, request: HeartbeatRequest, post: Post) {
        self.heartbeat.cancel();

        let Some(document_id) = self.document_id() else {
            tracing::error!("Unable to send heartbeat, no document identity; retrying shortly");
            self.heartbeat.schedule_recovery();
            post.fail(SyncError::NoDocument);
            return;
        };

        tracing::trace!("Sending side channel payload {:?}", request);
        let channel = self.collab.channel.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = channel.heartbeat(&document_id, &request).await;
            let _ = internal.send(Internal::Posted {
                claim: request.lease_path,
                post,
                result,
            });
        });
    }

    fn on_posted(&mut self, claim: Option<String>, post: Post, result: SyncResult<HeartbeatResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Side channel post failed, retrying shortly: {}", e);
                self.heartbeat.schedule_recovery();
                post.fail(e);
                return;
            }
        };
        self.heartbeat.schedule_next();

        match post {
            Post::Heartbeat => {
                if response.rejected {
                    self.on_rejected(claim.as_deref(), false);
                }
            }
            Post::Lease { reply } => {
                let outcome = if response.rejected {
                    self.on_rejected(claim.as_deref(), true);
                    LeaseOutcome::Rejected
                } else {
                    LeaseOutcome::Accepted
                };
                let _ = reply.send(Ok(outcome));
            }
            Post::Release { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Drop the rejected claim and warn the user after a short delay.
    ///
    /// Heartbeat rejections of a claim that was already superseded are
    /// ignored; an explicit lease request always warns.
    fn on_rejected(&mut self, claim: Option<&str>, explicit: bool) {
        let dropped = claim.map(|path| self.leases.reject(path)).unwrap_or(false);
        if !dropped && !explicit {
            tracing::debug!("Ignoring rejection of superseded claim {:?}", claim);
            return;
        }

        tracing::debug!("Lease rejected: {:?}", claim);
        let editor = self.collab.editor.clone();
        let delay = self.settings.rejection_warning_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!("Showing conflict warning");
            editor.show_conflict_warning();
        });
    }

    fn animate(&self, ops: Vec<PresenceOp>) {
        for op in ops {
            let _ = self.animations.send(op);
        }
    }

    fn close(&mut self) {
        if let (Some(path), Some(document_id)) = (self.leases.intent(), self.document_id.clone()) {
            tracing::debug!("Sending closing signal, lease held on {}", path);
            self.collab.channel.send_closing(&ClosingSignal {
                uid: self.client_id.clone(),
                page_path: document_id,
            });
        }
        self.heartbeat.cancel();
        self.transport.disconnect();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            client_id: self.client_id.clone(),
            document_id: self.document_id.clone(),
            intent: self.leases.intent().map(str::to_string),
            leases: self.leases.holders(),
            users: self.presence.users().to_vec(),
            markers: self.tracker.markers(),
            connection: self.transport.state(),
            layer: self.presence.layer(),
        }
    }
}

/// Apply presence operations one at a time, never overlapping
async fn run_animations(surface: Arc<dyn PresenceSurface>, mut ops: mpsc::UnboundedReceiver<PresenceOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            PresenceOp::Show => surface.show(),
            PresenceOp::Hide => surface.hide(),
            PresenceOp::SlideIn(user) => surface.slide_in(&user).await,
            PresenceOp::SlideOut(user) => surface.slide_out(&user).await,
        }
    }
}
