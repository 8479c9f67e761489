use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ftpmirror::config::{Config, RemoteConfig, SyncDirection};
use ftpmirror::error::SyncError;
use ftpmirror::fs::{FtpTransport, LocalBackend, Transport};
use ftpmirror::logging::init_tracing;
use ftpmirror::sync::{Engine, RunReport};

#[derive(Parser, Debug)]
#[command(name = "ftpmirror", version, about = "Mirror a directory tree to or from an FTP server")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Authoritative side: local-to-remote or remote-to-local
    #[arg(short, long)]
    direction: Option<SyncDirection>,

    /// Local root, overriding the configuration
    #[arg(long)]
    local: Option<PathBuf>,

    /// Remote root, overriding the configuration
    #[arg(long)]
    remote: Option<String>,

    /// Reconcile once and exit instead of watching
    #[arg(long)]
    once: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    if let Some(direction) = cli.direction {
        config.sync.direction = direction;
    }
    if let Some(local) = cli.local {
        config.sync.local_root = local;
    }
    if let Some(remote) = cli.remote {
        config.sync.remote_root = remote;
    }
    config.validate().context("invalid configuration")?;

    let (transport, ftp) = connect(&config.remote).await?;
    let engine = Engine::new(config.sync.clone(), transport)?;

    let report = if cli.once {
        engine.reconcile_once().await
    } else {
        let token = CancellationToken::new();
        tokio::spawn({
            let token = token.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("interrupt received, shutting down"),
                    Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
                }
                token.cancel();
            }
        });
        engine.run(token).await
    };

    if let Some(ftp) = ftp {
        ftp.quit().await;
    }
    print_summary(&report?);
    Ok(())
}

async fn connect(remote: &RemoteConfig) -> Result<(Arc<dyn Transport>, Option<Arc<FtpTransport>>)> {
    match remote {
        RemoteConfig::Ftp(ftp) => {
            let transport = FtpTransport::connect(ftp.settings())
                .await
                .map_err(SyncError::Connection)
                .with_context(|| format!("connecting to {}:{}", ftp.host, ftp.port))?;
            let transport = Arc::new(transport);
            let shared: Arc<dyn Transport> = transport.clone();
            Ok((shared, Some(transport)))
        }
        RemoteConfig::Local { path } => {
            let transport: Arc<dyn Transport> = Arc::new(LocalBackend::new(path.clone()));
            Ok((transport, None))
        }
    }
}

fn print_summary(report: &RunReport) {
    let stats = &report.stats;
    let failures = if stats.failures == 0 {
        stats.failures.to_string().green()
    } else {
        stats.failures.to_string().red()
    };
    println!(
        "{} {} uploaded, {} downloaded, {} deleted, {} directories created, {} failed ({} in {:.1?})",
        "done:".bold(),
        stats.uploads,
        stats.downloads,
        stats.deletes,
        stats.dirs_created,
        failures,
        humansize::format_size(stats.bytes, humansize::BINARY),
        report.elapsed,
    );
}
