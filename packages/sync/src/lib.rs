//! # Collab Sync
//!
//! Client side of collaborative document editing: region leases, change
//! propagation, presence and annotation reconciliation over one server
//! event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ transport: event stream → Message           │
//! │  - SSE framing, keep-alives dropped         │
//! │  - full snapshot on every (re)connect       │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ session: one loop owns all session state    │
//! │  - lease: who edits which region            │
//! │  - tracker: drop already-applied updates    │
//! │  - presence: who is on the document         │
//! │  - heartbeat: keep the local claim alive    │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ applier: refresh regions behind the gate    │
//! │  - concurrent refreshes, then highlight     │
//! │  - reconcile: annotation add/update/remove  │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ surface: editor, presence bar, annotations  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Server authority**: a full snapshot replaces local lease and
//!    presence state
//! 2. **Apply once**: an update is applied at most once per session
//! 3. **Local edits win briefly**: remote refreshes wait for local saves to
//!    settle and skip regions the user just changed
//! 4. **No globals**: everything the engine touches is injected
//!
//! ## Usage
//!
//! ```rust,ignore
//! use collab_sync::{Collaborators, SessionOptions, SyncSession, SyncSettings};
//!
//! let settings = SyncSettings::load(&project_dir)?;
//! let (handle, task) = SyncSession::spawn(settings, SessionOptions::default(), collaborators);
//!
//! match handle.request_lease("/content/page/jcr:content/par/text").await? {
//!     LeaseOutcome::Accepted => { /* edit */ }
//!     LeaseOutcome::Rejected => { /* warning is shown by the session */ }
//! }
//! handle.release_lease().await?;
//! handle.close().await?;
//! ```

mod applier;
mod config;
mod errors;
mod gate;
mod heartbeat;
mod lease;
mod presence;
mod reconcile;
mod session;
mod tracker;

pub mod memory;
pub mod model;
pub mod paths;
pub mod surface;
pub mod transport;

pub use applier::{Applier, BatchReport, RefreshPlan, RefreshTargets};
pub use config::{ConfigError, SyncSettings, DEFAULT_CONFIG_NAME};
pub use errors::{SyncError, SyncResult};
pub use gate::PersistenceGate;
pub use heartbeat::HeartbeatSchedule;
pub use lease::{LeaseChanges, LeaseCoordinator, LeaseOutcome};
pub use presence::{LayerMode, PresenceOp, PresenceTracker};
pub use reconcile::{diff, AnnotationReconciler, ReconcileOp, ReconcileReport};
pub use session::{Dispatch, SessionHandle, SessionOptions, SessionSnapshot, SyncSession};
pub use surface::{
    AnnotationSurface, Collaborators, EditorSurface, PresenceSurface, Region, SideChannel,
};
pub use tracker::UpdateTracker;
pub use transport::{ConnectionState, Connector, SseDecoder, SseEvent, StreamRequest};
