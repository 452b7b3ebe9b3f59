use anyhow::Result;
use clap::Args;
use collab_sync::{SyncSettings, DEFAULT_CONFIG_NAME};
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Directory holding the settings file (defaults to current directory)
    pub dir: Option<PathBuf>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn config(args: ConfigArgs, cwd: &Path) -> Result<()> {
    let dir = args.dir.unwrap_or_else(|| cwd.to_path_buf());
    let settings = SyncSettings::load(&dir)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    let source = if dir.join(DEFAULT_CONFIG_NAME).exists() {
        dir.join(DEFAULT_CONFIG_NAME).display().to_string()
    } else {
        "defaults".to_string()
    };
    println!("{} {}", "Settings from".bright_blue().bold(), source);
    print_row("heartbeat interval", format!("{:?}", settings.heartbeat_interval()));
    print_row("heartbeat recovery", format!("{:?}", settings.heartbeat_recover()));
    print_row("persistence debounce", format!("{:?}", settings.persistence_debounce()));
    print_row("presence grace", format!("{:?}", settings.presence_grace()));
    print_row("conflict warning delay", format!("{:?}", settings.rejection_warning_delay()));
    print_row(
        "marker ttl",
        settings
            .marker_ttl()
            .map(|ttl| format!("{:?}", ttl))
            .unwrap_or_else(|| "never".to_string()),
    );
    print_row("command buffer", settings.event_buffer.to_string());

    Ok(())
}

fn print_row(name: &str, value: String) {
    println!("  {:<24} {}", name.bright_white(), value);
}
