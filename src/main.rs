//! AVIAN-OS daemon entry point.
//!
//! # Usage
//!
//! ```bash
//! # Run the detection daemon with ./avian.toml (or AVIAN_CONFIG)
//! avian-os run
//!
//! # Produce a scrubbed diagnostics archive
//! avian-os collect --log /var/log/avian-os.log
//!
//! # Emit a test notification
//! avian-os notify --type detection --priority high \
//!     --title "Test" --message "hello" --metadata confidence=0.9
//! ```
//!
//! # Environment Variables
//!
//! - `AVIAN_CONFIG`: path to the TOML settings file
//! - `RUST_LOG`: logging filter (default: info)

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use avian_os::analysis::NoopClassifier;
use avian_os::cli::{Cli, Command};
use avian_os::config::{self, Settings};
use avian_os::daemon::Daemon;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    config::init(Settings::load());
    let settings = config::get();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            // The neural classifier is an external collaborator; without a
            // wired integration the daemon runs the full pipeline with no
            // detections.
            tracing::warn!("no classifier integration configured; using no-op classifier");
            Daemon::new(settings).run(Arc::new(NoopClassifier)).await
        }
        Command::Collect(args) => avian_os::cli::run_collect(args, settings),
        Command::Notify(args) => avian_os::cli::run_notify(args).await,
    }
}
