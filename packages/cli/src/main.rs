mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{config, init, replay, ConfigArgs, InitArgs, ReplayArgs};

/// Collab CLI - inspect and replay collaborative editing sessions
#[derive(Parser, Debug)]
#[command(name = "collab")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log session internals (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a settings file with default timings
    Init(InitArgs),

    /// Show the effective session settings
    Config(ConfigArgs),

    /// Replay a captured event stream through a session
    Replay(ReplayArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "collab_sync=debug,info",
        _ => "collab_sync=trace,debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            eprintln!("{} Cannot get current directory: {}", "Error:".red().bold(), err);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Init(args) => init(args, &cwd),
        Command::Config(args) => config(args, &cwd),
        Command::Replay(args) => replay(args, &cwd).await,
    };

    if let Err(err) = result {
        eprintln!();
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        eprintln!();
        std::process::exit(1);
    }
}
