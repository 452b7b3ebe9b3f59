use anyhow::{anyhow, Context, Result};
use clap::Args;
use collab_sync::memory::{
    MemoryAnnotations, MemoryEditor, MemoryLeaseServer, MemoryPresence, ScriptedConnector,
};
use collab_sync::model::{ClientId, Message};
use collab_sync::{
    paths, BatchReport, Collaborators, Dispatch, LayerMode, SessionOptions, SessionSnapshot,
    SseDecoder, SyncSession, SyncSettings,
};
use colored::Colorize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Captured text/event-stream file
    pub capture: PathBuf,

    /// Region rendered by the editor (repeatable); defaults to every path
    /// the capture names
    #[arg(short, long = "region")]
    pub regions: Vec<String>,

    /// Document path; derived from the regions when omitted
    #[arg(short, long)]
    pub document: Option<String>,

    /// Id of the local user
    #[arg(short, long)]
    pub user: Option<String>,

    /// Editor layer (Edit, Layouting, Annotate, ...)
    #[arg(short, long, default_value = "Edit")]
    pub layer: String,

    /// Directory holding the settings file (defaults to current directory)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}

pub async fn replay(args: ReplayArgs, cwd: &Path) -> Result<()> {
    let settings = SyncSettings::load(args.config_dir.as_deref().unwrap_or(cwd))?;
    let bytes = fs::read(&args.capture)
        .with_context(|| format!("Cannot read capture {}", args.capture.display()))?;

    let (messages, malformed) = decode_capture(&bytes);
    if messages.is_empty() {
        println!("{}", "⚠️  No messages in capture".yellow());
        return Ok(());
    }
    println!(
        "{}",
        format!("▶ Replaying {} messages", messages.len()).as_str().bright_blue().bold()
    );
    if malformed > 0 {
        println!("  {} {} malformed events skipped", "⚠️".yellow(), malformed);
    }

    let regions = if args.regions.is_empty() {
        referenced_paths(&messages)
    } else {
        args.regions.clone()
    };
    let document = args
        .document
        .clone()
        .or_else(|| regions.iter().find_map(|r| document_of(r)))
        .ok_or_else(|| anyhow!("Cannot derive the document path, pass --document"))?;

    let editor = Arc::new(MemoryEditor::with_regions(Some(document.as_str()), regions));
    let annotations = Arc::new(MemoryAnnotations::new());
    let collaborators = Collaborators {
        editor: editor.clone(),
        presence: Arc::new(MemoryPresence::new()),
        annotations: annotations.clone(),
        channel: Arc::new(MemoryLeaseServer::new()),
        connector: Arc::new(ScriptedConnector::new()),
    };
    let options = SessionOptions {
        client_id: ClientId::generate(),
        document_id: Some(document.clone()),
        user_id: args.user.clone(),
        layer: LayerMode::from_name(&args.layer),
    };
    let grace = settings.presence_grace();
    let (handle, task) = SyncSession::spawn(settings, options, collaborators);

    let mut pending_exits = false;
    for (index, message) in messages.into_iter().enumerate() {
        let dispatch = handle.deliver(message).await?;
        print_dispatch(index, &dispatch);
        pending_exits |= !dispatch.exits.is_empty();
        if let Some(report) = dispatch.settled().await {
            print_batch(&report);
        }
    }

    if pending_exits {
        tokio::time::sleep(grace).await;
    }

    let snapshot = handle.snapshot().await?;
    println!();
    print_snapshot(&snapshot);
    println!(
        "  {} {} refreshed, {} highlighted, {} annotations",
        "editor".bright_white(),
        editor.log().refreshed.len(),
        editor.log().highlighted.len(),
        annotations.badge()
    );

    handle.close().await?;
    task.await?;
    Ok(())
}

/// Messages of a capture, plus the number of events that failed to decode
fn decode_capture(bytes: &[u8]) -> (Vec<Message>, usize) {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.feed(bytes);
    // Flush an event the capture did not terminate
    events.extend(decoder.feed(b"\n\n"));

    let mut messages = Vec::new();
    let mut malformed = 0;
    for event in events {
        match event.message() {
            Some(Ok(message)) => messages.push(message),
            Some(Err(_)) => malformed += 1,
            None => {}
        }
    }
    (messages, malformed)
}

/// Every region path named by leases, releases and updates, in first-seen order
fn referenced_paths(messages: &[Message]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    let mut push = |path: &str| {
        if !paths::is_annotation_path(path) && seen.insert(path.to_string()) {
            result.push(path.to_string());
        }
    };

    for message in messages {
        for lease in &message.leases {
            push(lease.path.as_str());
        }
        for path in message.releases.iter().flat_map(|r| &r.paths) {
            push(path.as_str());
        }
        for update in &message.updates {
            for path in update.resolve_paths.iter().chain(&update.direct_paths) {
                push(path.as_str());
            }
        }
    }
    result
}

fn document_of(path: &str) -> Option<String> {
    path.find(paths::JCR_CONTENT).map(|idx| path[..idx].to_string())
}

fn print_dispatch(index: usize, dispatch: &Dispatch) {
    let mut parts = Vec::new();
    if !dispatch.leases.leased.is_empty() {
        parts.push(format!("{} leased", dispatch.leases.leased.len()).as_str().yellow().to_string());
    }
    if !dispatch.leases.released.is_empty() {
        parts.push(format!("{} released", dispatch.leases.released.len()).as_str().green().to_string());
    }
    if dispatch.accepted_updates + dispatch.dropped_updates > 0 {
        parts.push(format!(
            "{} updates ({} duplicate)",
            dispatch.accepted_updates + dispatch.dropped_updates,
            dispatch.dropped_updates
        ));
    }
    if !dispatch.presence.is_empty() {
        parts.push(format!("{} presence ops", dispatch.presence.len()).as_str().cyan().to_string());
    }
    if !dispatch.exits.is_empty() {
        parts.push(format!("leaving: {}", dispatch.exits.join(", ")).as_str().dimmed().to_string());
    }
    if parts.is_empty() {
        parts.push("no changes".dimmed().to_string());
    }
    println!("  {} #{:<3} {}", "✓".green(), index, parts.join(", "));
}

fn print_batch(report: &BatchReport) {
    let scope = if report.refresh_all { "full refresh" } else { "refresh" };
    println!(
        "       {} {}: {} ok, {} skipped, {} failed",
        "↻".bright_blue(),
        scope,
        report.refreshed.len(),
        report.suppressed.len(),
        report.failed.len()
    );
    for path in &report.failed {
        println!("         {} {}", "✗".red(), path);
    }
    let reconcile = &report.reconcile;
    if !reconcile.ops.is_empty() || reconcile.notified {
        println!(
            "       {} annotations: {} ops{}",
            "✎".bright_blue(),
            reconcile.ops.len(),
            if reconcile.notified { ", newer available" } else { "" }
        );
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    println!("{}", "Session state".bright_blue().bold());
    println!("  {} {}", "client".bright_white(), snapshot.client_id);
    if let Some(document) = &snapshot.document_id {
        println!("  {} {}", "document".bright_white(), document);
    }
    println!("  {} {}", "leases".bright_white(), snapshot.leases.len());
    for (path, user) in &snapshot.leases {
        println!("    {} {} ({})", "🔒".yellow(), path, user.name);
    }
    let users: Vec<&str> = snapshot.users.iter().map(|u| u.id.as_str()).collect();
    println!("  {} [{}]", "users".bright_white(), users.join(", "));
    println!("  {} {}", "markers".bright_white(), snapshot.markers.len());
}
