//! groupsync CLI
//!
//! Command-line tools for the groupsync engine.
//!
//! # Commands
//!
//! - `tables` - Print and validate every state machine table
//! - `classify` - Show how the transport treats an HTTP status
//! - `run` - Sync one account against a live server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use url::Url;

/// groupsync command-line tools.
#[derive(Parser)]
#[command(name = "groupsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every state machine table and validate it
    Tables {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show how the transport treats an HTTP status
    Classify {
        /// HTTP status code
        status: u16,

        /// Response header as `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Sync one account
    Run {
        /// Server endpoint
        #[arg(long)]
        url: Url,

        /// User name
        #[arg(long)]
        user: String,

        /// Device id
        #[arg(long)]
        device_id: String,

        /// Password
        #[arg(long, env = "GROUPSYNC_PASSWORD")]
        password: Option<String>,

        /// JSON store snapshot, loaded before and saved after the run
        #[arg(long)]
        store: Option<PathBuf>,

        /// Stop as soon as the account is idle
        #[arg(long)]
        once: bool,

        /// Poll interval in seconds while idle
        #[arg(long)]
        poll: Option<u64>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Tables { format } => {
            commands::tables::run(&format)?;
        }
        Commands::Classify {
            status,
            headers,
            format,
        } => {
            commands::classify::run(status, &headers, &format)?;
        }
        Commands::Run {
            url,
            user,
            device_id,
            password,
            store,
            once,
            poll,
        } => {
            let options = commands::run::RunOptions {
                url,
                user,
                device_id,
                password,
                store,
                once,
                poll,
            };
            commands::run::run(options)?;
        }
        Commands::Version => {
            println!("groupsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
