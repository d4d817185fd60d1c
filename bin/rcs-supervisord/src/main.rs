//! ---
//! rcs_section: "03-supervisor-binary"
//! rcs_subsection: "binary"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "Binary entrypoint for the reCamera supervisor."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use rcs_common::config::AppConfig;
use rcs_common::logging::init_tracing;
use rcs_common::version::VersionInfo;
use rcs_upgrade::{SessionOutcome, ShellExecutor, UpgradeManager};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/recamera.conf/supervisor.toml";
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "reCamera supervisor",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show the configured update channel")]
    Channel,
    #[command(about = "Select the update channel; 0 is the official channel")]
    SetChannel {
        channel_id: i32,
        #[arg(help = "Manifest URL of a custom channel")]
        url: Option<String>,
    },
    #[command(about = "Resolve the latest release for the current channel")]
    Check,
    #[command(about = "Report whether a newer release is known")]
    Status,
    #[command(about = "Download and install the latest release; Ctrl-C cancels")]
    Update,
    #[command(about = "Show progress of the current or last upgrade")]
    Progress,
    #[command(about = "Cancel a running upgrade download")]
    Cancel,
    #[command(about = "Restore factory state on next boot")]
    FactoryReset,
    #[command(about = "Show the bank the bootloader starts next")]
    ActiveBank,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.banner());
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
    let loaded = AppConfig::load_with_source(&candidates).context("loading configuration")?;
    let config = loaded.config;
    init_tracing("rcs-supervisord", &config.logging).context("initialising tracing")?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), version = %version.semver, "configuration loaded"),
        None => info!(version = %version.semver, "using built-in configuration"),
    }

    let manager = UpgradeManager::new(&config, Arc::new(ShellExecutor))
        .context("initialising upgrade manager")?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Channel => print_json(&manager.get_channel())?,
        Commands::SetChannel { channel_id, url } => {
            let channel = manager
                .update_channel(channel_id, url)
                .context("updating channel")?;
            print_json(&channel)?
        }
        Commands::Check => {
            let entry = manager
                .query_latest_version()
                .await
                .context("querying latest release")?;
            println!("{} {} ({})", entry.os_name, entry.os_version, entry.file_name);
        }
        Commands::Status => {
            // A short-lived process cannot wait on the background query.
            if !manager.is_upgrading() && manager.store().read_version().is_none() {
                if let Err(err) = manager.query_latest_version().await {
                    warn!(error = %err, "latest version query failed");
                }
            }
            let record = manager.latest_version_status();
            print_json(&record)?;
            if manager.is_upgrade_done() {
                info!("upgrade installed, restart to boot it");
            }
        }
        Commands::Update => run_update(&manager).await?,
        Commands::Progress => print_json(&manager.progress())?,
        Commands::Cancel => manager.cancel_update().context("cancelling upgrade")?,
        Commands::FactoryReset => manager.factory_reset().context("requesting factory reset")?,
        Commands::ActiveBank => {
            let bank = manager.active_bank().context("reading boot environment")?;
            println!("{bank}");
        }
    }

    Ok(())
}

async fn run_update(manager: &UpgradeManager) -> Result<()> {
    let session = manager
        .update_system()
        .context("starting upgrade session")?
        .wait();
    tokio::pin!(session);
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut cancel_sent = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut session => break outcome,
            _ = ticker.tick() => {
                let progress = manager.progress();
                info!(percent = progress.percent, status = %progress.status, "upgrade progress");
            }
            result = signal::ctrl_c(), if !cancel_sent => {
                result?;
                warn!("interrupt received, cancelling upgrade");
                manager.cancel_update()?;
                cancel_sent = true;
            }
        }
    };

    print_json(&manager.progress())?;
    match outcome {
        SessionOutcome::Done => {
            info!("upgrade installed, restart to boot the new release");
            Ok(())
        }
        SessionOutcome::Cancelled => bail!("upgrade cancelled"),
        SessionOutcome::Failed(reason) => bail!("upgrade failed: {reason}"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
