use anyhow::Result;
use clap::Args;
use collab_sync::{SyncSettings, DEFAULT_CONFIG_NAME};
use colored::Colorize;
use std::fs;
use std::path::Path;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Evict deduplication markers untouched for this many milliseconds
    #[arg(long)]
    pub marker_ttl_ms: Option<u64>,

    /// Force overwrite existing config
    #[arg(short, long)]
    pub force: bool,
}

pub fn init(args: InitArgs, cwd: &Path) -> Result<()> {
    let config_path = cwd.join(DEFAULT_CONFIG_NAME);

    if config_path.exists() && !args.force {
        println!(
            "{} {} already exists",
            "⚠️".yellow(),
            DEFAULT_CONFIG_NAME.bright_white()
        );
        println!("Use --force to overwrite");
        return Ok(());
    }

    let settings = SyncSettings {
        marker_ttl_ms: args.marker_ttl_ms,
        ..SyncSettings::default()
    };
    settings.validate()?;

    fs::write(&config_path, serde_json::to_string_pretty(&settings)?)?;

    println!("  {} Created {}", "✓".green(), DEFAULT_CONFIG_NAME);
    println!();
    println!("Next steps:");
    println!("  1. Adjust timings in {}", DEFAULT_CONFIG_NAME);
    println!("  2. Run: collab replay <capture>");

    Ok(())
}
