//! End-to-end session behavior against in-memory collaborators

use collab_sync::memory::{
    MemoryAnnotations, MemoryEditor, MemoryLeaseServer, MemoryPresence, ScriptedConnector,
};
use collab_sync::model::{
    AnnotationInfo, ClientId, ClosingSignal, Lease, Message, Release, Update, User,
};
use collab_sync::{
    AnnotationSurface, Collaborators, ConnectionState, LayerMode, LeaseOutcome, PresenceOp,
    ReconcileOp, SessionHandle, SessionOptions, SideChannel, SyncError, SyncSession,
    SyncSettings,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const DOC: &str = "/content/site/page";
const ROOT: &str = "/content/site/page/jcr:content";
const PAR: &str = "/content/site/page/jcr:content/par";
const TEXT: &str = "/content/site/page/jcr:content/par/text";
const IMAGE: &str = "/content/site/page/jcr:content/par/image";

struct Client {
    handle: SessionHandle,
    editor: Arc<MemoryEditor>,
    presence: Arc<MemoryPresence>,
    annotations: Arc<MemoryAnnotations>,
    connector: Arc<ScriptedConnector>,
}

fn start(server: &Arc<MemoryLeaseServer>, uid: &str, user: &str, layer: LayerMode) -> Client {
    start_with(server, uid, user, layer, Some(DOC))
}

fn start_with(
    server: &Arc<MemoryLeaseServer>,
    uid: &str,
    user: &str,
    layer: LayerMode,
    document_id: Option<&str>,
) -> Client {
    server.join(uid, User::new(user, user.to_uppercase()));

    let editor = Arc::new(MemoryEditor::with_regions(document_id, [ROOT, PAR, TEXT, IMAGE]));
    let presence = Arc::new(MemoryPresence::new());
    let annotations = Arc::new(MemoryAnnotations::new());
    let connector = Arc::new(ScriptedConnector::new());

    let collaborators = Collaborators {
        editor: editor.clone(),
        presence: presence.clone(),
        annotations: annotations.clone(),
        channel: server.clone(),
        connector: connector.clone(),
    };
    let options = SessionOptions {
        client_id: ClientId::from(uid),
        document_id: None,
        user_id: Some(user.to_string()),
        layer,
    };

    let (handle, _task) = SyncSession::spawn(SyncSettings::default(), options, collaborators);
    Client {
        handle,
        editor,
        presence,
        annotations,
        connector,
    }
}

fn update(time: u64, paths: &[&str]) -> Update {
    Update {
        direct_paths: paths.iter().map(|s| s.to_string()).collect(),
        resolve_paths: paths.iter().map(|s| s.to_string()).collect(),
        time,
        annotations: None,
    }
}

fn user(id: &str) -> User {
    User::new(id, id.to_uppercase())
}

/// Let spawned tasks run without moving the clock noticeably
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_lease_mutual_exclusion() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    let bob = start(&server, "bbb", "bob", LayerMode::Edit);

    assert_eq!(alice.handle.request_lease(TEXT).await.unwrap(), LeaseOutcome::Accepted);
    assert_eq!(bob.handle.request_lease(TEXT).await.unwrap(), LeaseOutcome::Rejected);

    let snapshot = bob.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.intent, None);
    assert_eq!(server.leases().get(TEXT).map(String::as_str), Some("aaa"));

    // Warning is delayed, not immediate
    sleep(Duration::from_millis(1400)).await;
    assert_eq!(bob.editor.log().warnings, 0);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.editor.log().warnings, 1);
    assert_eq!(alice.editor.log().warnings, 0);
}

#[tokio::test(start_paused = true)]
async fn test_release_frees_region_for_others() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    let bob = start(&server, "bbb", "bob", LayerMode::Edit);

    alice.handle.request_lease(TEXT).await.unwrap();
    alice.handle.release_lease().await.unwrap();
    assert_eq!(alice.handle.snapshot().await.unwrap().intent, None);

    assert_eq!(bob.handle.request_lease(TEXT).await.unwrap(), LeaseOutcome::Accepted);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(bob.editor.log().warnings, 0);

    let release = server.requests().into_iter().find(|r| r.release).unwrap();
    assert_eq!(release.uid, ClientId::from("aaa"));
}

#[tokio::test(start_paused = true)]
async fn test_release_without_lease_posts_nothing() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    alice.handle.release_lease().await.unwrap();
    assert!(server.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_claim_alive() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    alice.handle.request_lease(TEXT).await.unwrap();
    sleep(Duration::from_secs(36)).await;

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].lease_path.as_deref(), Some(TEXT));
    assert!(!requests[1].release);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_recovers_after_failure() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    server.fail_next(1);
    let result = alice.handle.request_lease(TEXT).await;
    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(alice.handle.snapshot().await.unwrap().intent.as_deref(), Some(TEXT));

    sleep(Duration::from_millis(2100)).await;
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].lease_path.as_deref(), Some(TEXT));
    assert_eq!(server.leases().get(TEXT).map(String::as_str), Some("aaa"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_document_identity_is_recovered() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start_with(&server, "aaa", "alice", LayerMode::Edit, None);
    settle().await;
    assert!(alice.connector.opens().is_empty());

    let result = alice.handle.request_lease(TEXT).await;
    assert!(matches!(result, Err(SyncError::NoDocument)));

    alice.editor.set_document_id(Some(DOC));
    sleep(Duration::from_millis(2100)).await;
    assert_eq!(server.leases().get(TEXT).map(String::as_str), Some("aaa"));

    alice.handle.reconnect().await.unwrap();
    settle().await;
    assert_eq!(alice.connector.opens().len(), 1);
    assert_eq!(alice.connector.opens()[0].query(), format!("uid=aaa&page={}", DOC));
}

#[tokio::test(start_paused = true)]
async fn test_stream_messages_update_leases() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    settle().await;
    assert_eq!(alice.handle.snapshot().await.unwrap().connection, ConnectionState::Open);

    alice.connector.send(&Message {
        setup: true,
        leases: vec![
            Lease { path: TEXT.to_string(), user: user("bob") },
            Lease { path: IMAGE.to_string(), user: user("carol") },
        ],
        ..Default::default()
    });
    settle().await;
    assert_eq!(alice.editor.leased().len(), 2);

    alice.connector.send(&Message {
        releases: vec![Release { paths: vec![IMAGE.to_string()] }],
        ..Default::default()
    });
    settle().await;
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.leases.keys().collect::<Vec<_>>(), vec![TEXT]);
    assert!(!alice.editor.leased().contains_key(IMAGE));

    // An empty setup snapshot drops everything
    alice.connector.send(&Message { setup: true, ..Default::default() });
    settle().await;
    assert!(alice.editor.leased().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_opens_fresh_stream() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    settle().await;

    alice.connector.disconnect();
    settle().await;
    assert_eq!(alice.handle.snapshot().await.unwrap().connection, ConnectionState::Disconnected);

    alice.handle.reconnect().await.unwrap();
    settle().await;
    let opens = alice.connector.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0], opens[1]);
    assert_eq!(alice.handle.snapshot().await.unwrap().connection, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_stays_disconnected() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    settle().await;

    alice.connector.refuse_next();
    alice.handle.reconnect().await.unwrap();
    settle().await;
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_updates_apply_once() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    let message = Message {
        updates: vec![update(5, &[TEXT])],
        ..Default::default()
    };
    let first = alice.handle.deliver(message.clone()).await.unwrap();
    assert_eq!(first.accepted_updates, 1);
    let report = first.settled().await.unwrap();
    assert_eq!(report.refreshed, vec![TEXT.to_string()]);
    assert_eq!(report.highlighted, vec![TEXT.to_string()]);

    let again = alice.handle.deliver(message).await.unwrap();
    assert_eq!(again.dropped_updates, 1);
    assert!(again.settled().await.is_none());

    let older = alice
        .handle
        .deliver(Message { updates: vec![update(4, &[TEXT])], ..Default::default() })
        .await
        .unwrap();
    assert_eq!(older.accepted_updates, 0);

    assert_eq!(alice.editor.log().refreshed, vec![TEXT.to_string()]);
    let markers = alice.handle.snapshot().await.unwrap().markers;
    assert_eq!(markers.get(TEXT), Some(&5));
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_path_refreshes_top_level() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    let dispatch = alice
        .handle
        .deliver(Message {
            updates: vec![update(1, &[TEXT]), update(2, &["/content/other/jcr:content/x"])],
            ..Default::default()
        })
        .await
        .unwrap();
    let report = dispatch.settled().await.unwrap();
    assert!(report.refresh_all);
    assert_eq!(report.refreshed, vec![ROOT.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_waits_for_local_save() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    // Edits only count while a save is pending
    assert_eq!(alice.handle.note_local_edits([TEXT]), 0);
    alice.handle.note_persistence();

    let start = Instant::now();
    let dispatch = alice
        .handle
        .deliver(Message { updates: vec![update(1, &[TEXT, IMAGE])], ..Default::default() })
        .await
        .unwrap();

    sleep(Duration::from_millis(2400)).await;
    assert_eq!(alice.handle.note_local_edits([TEXT]), 1);
    let report = dispatch.settled().await.unwrap();

    assert!(Instant::now() - start >= Duration::from_millis(2500));
    assert_eq!(report.suppressed, vec![TEXT.to_string()]);
    assert_eq!(report.refreshed, vec![IMAGE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_presence_grace_prevents_flicker() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Edit);

    me.handle
        .deliver(Message {
            setup: true,
            user_enter: vec![user("alice"), user("me"), user("bob")],
            ..Default::default()
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(me.presence.rendered(), vec!["me", "alice", "bob"]);
    assert!(me.presence.is_visible());

    let dispatch = me
        .handle
        .deliver(Message { user_exit: vec!["bob".to_string()], ..Default::default() })
        .await
        .unwrap();
    assert_eq!(dispatch.exits, vec!["bob".to_string()]);

    sleep(Duration::from_secs(1)).await;
    me.handle
        .deliver(Message { user_enter: vec![user("bob")], ..Default::default() })
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(me.presence.rendered(), vec!["me", "alice", "bob"]);
    assert!(!me.presence.ops().contains(&PresenceOp::SlideOut(user("bob"))));

    me.handle
        .deliver(Message { user_exit: vec!["alice".to_string()], ..Default::default() })
        .await
        .unwrap();
    sleep(Duration::from_millis(1900)).await;
    assert_eq!(me.presence.rendered(), vec!["me", "alice", "bob"]);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(me.presence.rendered(), vec!["me", "bob"]);
}

#[tokio::test(start_paused = true)]
async fn test_presence_follows_layer() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Edit);

    me.handle
        .deliver(Message { setup: true, user_enter: vec![user("alice")], ..Default::default() })
        .await
        .unwrap();
    settle().await;
    assert!(me.presence.is_visible());

    me.handle.set_layer(LayerMode::from_name("Preview")).await.unwrap();
    settle().await;
    assert!(!me.presence.is_visible());

    me.handle.set_layer(LayerMode::Layouting).await.unwrap();
    settle().await;
    assert!(me.presence.is_visible());
    assert_eq!(me.presence.rendered(), vec!["alice"]);
}

#[tokio::test(start_paused = true)]
async fn test_annotations_reconciled_in_annotate_layer() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Annotate);
    me.annotations.set_remote(TEXT, json!({"jcr:primaryType": "nt:unstructured", "n1": {"text": "hi"}}));

    let mut carrying = update(1, &[]);
    carrying.annotations = Some(AnnotationInfo { count: 1, components: vec![TEXT.to_string()] });
    let dispatch = me
        .handle
        .deliver(Message { updates: vec![carrying], ..Default::default() })
        .await
        .unwrap();
    let report = dispatch.settled().await.unwrap();

    let reconcile = report.reconcile;
    assert_eq!(reconcile.ops.len(), 1);
    assert!(matches!(&reconcile.ops[0], ReconcileOp::Add { .. }));
    assert_eq!(me.annotations.badge(), 1);
    assert_eq!(me.annotations.local_entries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_annotations_notify_outside_layer() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Edit);

    let mut carrying = update(1, &[]);
    carrying.annotations = Some(AnnotationInfo { count: 3, components: vec![TEXT.to_string()] });
    let dispatch = me
        .handle
        .deliver(Message { updates: vec![carrying], ..Default::default() })
        .await
        .unwrap();
    let reconcile = dispatch.settled().await.unwrap().reconcile;

    assert!(reconcile.notified);
    assert_eq!(me.annotations.notices(), 1);
    assert!(me.annotations.local_entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_ui_restores_marks() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Edit);

    me.handle
        .deliver(Message {
            setup: true,
            leases: vec![Lease { path: TEXT.to_string(), user: user("bob") }],
            ..Default::default()
        })
        .await
        .unwrap();
    me.editor.clear_marks();

    me.handle.refresh_ui().await.unwrap();
    settle().await;
    assert_eq!(me.editor.leased().get(TEXT).map(String::as_str), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn test_close_signals_held_lease() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    alice.handle.request_lease(TEXT).await.unwrap();
    alice.handle.close().await.unwrap();

    let closing = server.closing();
    assert_eq!(closing.len(), 1);
    assert_eq!(closing[0].page_path, DOC);
    assert!(server.leases().is_empty());

    settle().await;
    let after = alice.handle.snapshot().await;
    assert!(matches!(after, Err(SyncError::SessionClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_close_without_lease_is_silent() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);

    alice.handle.close().await.unwrap();
    assert!(server.closing().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_batch_refreshes_region_once_with_last_event_data() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Annotate);
    me.annotations.set_remote(TEXT, json!({}));

    let mut first = update(1, &[TEXT]);
    first.annotations = Some(AnnotationInfo { count: 5, components: vec![] });
    let mut second = update(2, &[TEXT]);
    second.direct_paths = vec![IMAGE.to_string()];
    second.annotations = Some(AnnotationInfo { count: 1, components: vec![TEXT.to_string()] });

    let dispatch = me
        .handle
        .deliver(Message { updates: vec![first, second], ..Default::default() })
        .await
        .unwrap();
    assert_eq!(dispatch.accepted_updates, 2);
    let report = dispatch.settled().await.unwrap();

    assert_eq!(report.refreshed, vec![TEXT.to_string()]);
    assert_eq!(report.highlighted, vec![IMAGE.to_string()]);
    assert_eq!(me.annotations.badge(), 1);
    assert_eq!(me.handle.snapshot().await.unwrap().markers.get(TEXT), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_server_release_clears_held_lease_without_warning() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    settle().await;

    assert_eq!(alice.handle.request_lease(TEXT).await.unwrap(), LeaseOutcome::Accepted);
    alice.connector.send(&Message {
        leases: vec![Lease { path: TEXT.to_string(), user: user("alice") }],
        ..Default::default()
    });
    settle().await;
    assert!(alice.editor.leased().contains_key(TEXT));

    sleep(Duration::from_secs(36)).await;
    let heartbeat = server.requests().pop().unwrap();
    assert_eq!(heartbeat.lease_path.as_deref(), Some(TEXT));

    alice.connector.send(&Message {
        releases: vec![Release { paths: vec![TEXT.to_string()] }],
        ..Default::default()
    });
    settle().await;

    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.intent, None);
    assert!(snapshot.leases.is_empty());
    assert!(!alice.editor.leased().contains_key(TEXT));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(alice.editor.log().warnings, 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_rejection_drops_taken_over_claim() {
    let server = Arc::new(MemoryLeaseServer::new());
    let alice = start(&server, "aaa", "alice", LayerMode::Edit);
    let bob = start(&server, "bbb", "bob", LayerMode::Edit);

    assert_eq!(bob.handle.request_lease(TEXT).await.unwrap(), LeaseOutcome::Accepted);

    // Server drops bob's claim and alice takes the region over
    server.send_closing(&ClosingSignal { uid: ClientId::from("bbb"), page_path: DOC.to_string() });
    sleep(Duration::from_secs(1)).await;
    assert_eq!(alice.handle.request_lease(TEXT).await.unwrap(), LeaseOutcome::Accepted);

    sleep(Duration::from_secs(35)).await;
    let snapshot = bob.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.intent, None);
    assert_eq!(bob.editor.log().warnings, 0);

    sleep(Duration::from_millis(1600)).await;
    assert_eq!(bob.editor.log().warnings, 1);
    assert_eq!(alice.editor.log().warnings, 0);
    assert_eq!(server.leases().get(TEXT).map(String::as_str), Some("aaa"));
}

#[tokio::test(start_paused = true)]
async fn test_annotations_removed_when_update_carries_none() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Annotate);
    me.annotations.set_remote(TEXT, json!({"n1": {"text": "hi"}}));

    let mut carrying = update(1, &[]);
    carrying.annotations = Some(AnnotationInfo { count: 1, components: vec![TEXT.to_string()] });
    let dispatch = me
        .handle
        .deliver(Message { updates: vec![carrying], ..Default::default() })
        .await
        .unwrap();
    dispatch.settled().await.unwrap();
    assert_eq!(me.annotations.local_entries().len(), 1);

    // Last annotation deleted: the server sends no snapshot at all
    let message: Message =
        serde_json::from_value(json!({"updates": [{"time": 2, "annotations": null}]})).unwrap();
    let report = me.handle.deliver(message).await.unwrap().settled().await.unwrap();

    assert!(matches!(&report.reconcile.ops[..], [ReconcileOp::Remove { .. }]));
    assert_eq!(me.annotations.badge(), 0);
    assert!(me.annotations.local_entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_batch_without_trailing_annotations_clears_badge() {
    let server = Arc::new(MemoryLeaseServer::new());
    let me = start(&server, "aaa", "me", LayerMode::Edit);

    let mut first = update(1, &[]);
    first.annotations = Some(AnnotationInfo { count: 4, components: vec![TEXT.to_string()] });
    let second = update(2, &[]);

    let dispatch = me
        .handle
        .deliver(Message { updates: vec![first, second], ..Default::default() })
        .await
        .unwrap();
    dispatch.settled().await.unwrap();

    assert_eq!(me.annotations.badge(), 0);
    assert!(me.annotations.owners().is_empty());
    assert_eq!(me.annotations.notices(), 0);
}
