//! magikmigrate - live container migration CLI
//!
//! ## Usage
//!
//! ```sh
//! # destination host
//! magikmigrate serve --listen 0.0.0.0:7788
//!
//! # source host
//! magikmigrate migrate <container-id> --to <host> [--mode live|restart]
//! ```
//!
//! Settings come from `~/.config/magikmigrate/config.toml` (or `--config`);
//! command-line flags override the file.
//!
//! ## Exit Codes
//!
//! - `0`: migration committed / server stopped cleanly
//! - `1`: environment or tooling failure
//! - `2`: source and destination are incompatible

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use magikmigrate::{
    CheckpointInvoker, Config, CriuCli, DockerWorkerProvider, ErrorKind, LayerResolver,
    LocalImageManager, LocalRestoreTarget, MigrationMode, MigrationSession, PeerClient,
    PeerServer, PreDumpMode, RsyncDriverProvider, SessionDeps,
};
use magikmigrate::rsync::Rsync;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const EXIT_FAULT: u8 = 1;
const EXIT_INCOMPATIBLE: u8 = 2;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "magikmigrate", version, about = "Live container migration")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Migrate a running container to another host.
    Migrate(MigrateArgs),
    /// Accept migrations on this host.
    Serve {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<String>,
    },
}

#[derive(Debug, Args)]
struct MigrateArgs {
    /// Container id or unique prefix (at least 3 characters).
    container: String,
    /// Destination host.
    #[arg(long)]
    to: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<MigrationMode>,
    /// Skip every compatibility check.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    skip_cpu_check: bool,
    #[arg(long)]
    skip_tool_version_check: bool,
    #[arg(long, value_enum)]
    pre_dump: Option<PreDumpMode>,
    /// Container engine storage root.
    #[arg(long)]
    docker_root: Option<PathBuf>,
    /// Checkpoint image work directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Destination control port.
    #[arg(long)]
    port: Option<u16>,
}

impl MigrateArgs {
    fn apply(self, config: &mut Config) -> String {
        let migration = &mut config.migration;
        if let Some(to) = self.to {
            migration.options.to = to;
        }
        if let Some(mode) = self.mode {
            migration.mode = mode;
        }
        if let Some(pre_dump) = self.pre_dump {
            migration.options.pre_dump = pre_dump;
        }
        migration.options.force |= self.force;
        migration.options.skip_cpu_check |= self.skip_cpu_check;
        migration.options.skip_tool_version_check |= self.skip_tool_version_check;
        if let Some(root) = self.docker_root {
            config.storage.docker_root = root;
        }
        if let Some(dir) = self.work_dir {
            config.transfer.work_dir = dir;
        }
        if let Some(port) = self.port {
            config.peer.port = port;
        }
        self.container
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_migrate(config: Config, container: String) -> anyhow::Result<()> {
    let options = config.migration.options.clone();
    let storage = &config.storage;
    let resolver = LayerResolver::new(storage.layout()).with_options(storage.resolver_options());

    let checkpoint = &config.checkpoint;
    let invoker = CheckpointInvoker::new(&checkpoint.docker_bin)
        .with_log_dir(&checkpoint.log_dir)
        .with_timeout(checkpoint.timeout);

    let transfer = &config.transfer;
    let rsync = Rsync::new(&transfer.rsync_bin).with_timeout(transfer.timeout);
    let images = LocalImageManager::new(&transfer.work_dir, rsync)
        .with_context(|| {
            format!(
                "cannot create image directory under {}",
                transfer.work_dir.display()
            )
        })?
        .keep_images(transfer.keep_images);

    let peer_addr = format!("{}:{}", options.to, config.peer.port);
    let peer = PeerClient::new(&peer_addr)
        .with_timeout(config.peer.timeout)
        .with_restore_timeout(checkpoint.timeout);

    let deps = SessionDeps {
        workers: Box::new(DockerWorkerProvider::new(resolver, invoker)),
        fs: Box::new(RsyncDriverProvider::new(
            &transfer.rsync_bin,
            transfer.timeout,
            &options.to,
        )),
        images: Box::new(images),
        service: Box::new(CriuCli::new(&checkpoint.criu_bin)),
        peer: Box::new(peer),
    };

    let mut session =
        MigrationSession::open(&container, config.migration.mode, options, deps).await?;
    let report = session.run().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_serve(config: Config, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or(config.peer.listen);
    let invoker = CheckpointInvoker::new(&config.checkpoint.docker_bin)
        .with_log_dir(&config.checkpoint.log_dir)
        .with_timeout(config.checkpoint.timeout);
    let target = LocalRestoreTarget::new(CriuCli::new(&config.checkpoint.criu_bin), invoker);

    std::fs::create_dir_all(&config.transfer.work_dir).with_context(|| {
        format!(
            "cannot create work directory {}",
            config.transfer.work_dir.display()
        )
    })?;

    let server = PeerServer::new(&config.transfer.work_dir, Arc::new(target))
        .with_request_timeout(config.peer.timeout);
    server.run(&listen, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for interrupt");
        std::future::pending::<()>().await;
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Config::load_default().context("loading default configuration"),
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<magikmigrate::Error>() {
        Some(e) if e.kind() == ErrorKind::Validation => EXIT_INCOMPATIBLE,
        _ => EXIT_FAULT,
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
        return ExitCode::from(EXIT_FAULT);
    }

    let result = match load_config(cli.config.as_ref()) {
        Ok(mut config) => match cli.command {
            Command::Migrate(args) => {
                let container = args.apply(&mut config);
                cmd_migrate(config, container).await
            }
            Command::Serve { listen } => {
                info!(version = env!("CARGO_PKG_VERSION"), "magikmigrate serving");
                cmd_serve(config, listen).await
            }
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
