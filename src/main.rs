//! Backup session agent
//!
//! Main entry point. Runs the session controllers as a long-lived sidecar,
//! or one of the one-shot commands used by the restore init-container, the
//! snapshot backup Job and operators.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backup_session_agent::{
    adapters::{ChrootRunner, ProcRootLocator, Restic},
    cluster::KubeCluster,
    config::{AgentConfig, Overrides},
    controllers, metrics,
    reconcilers::{backup, restore},
    session::Context,
};

/// Backup and restore agent for BackupSession and RestoreSession resources
#[derive(Parser)]
#[command(name = "backup-session-agent", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch BackupSession and RestoreSession resources for this target
    Server,
    /// RestoreSession commands
    Restoresession {
        #[command(subcommand)]
        action: RestoreSessionAction,
    },
    /// BackupSession commands
    Backupsession {
        #[command(subcommand)]
        action: BackupSessionAction,
    },
    /// Backup snapshot commands
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum RestoreSessionAction {
    /// Restore the target's snapshot from the restore init-container
    Start(SessionArgs),
}

#[derive(Subcommand)]
enum BackupSessionAction {
    /// Back up the target's snapshot volumes from the backup Job
    Backup(SessionArgs),
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Forget a snapshot and prune the repository
    Delete {
        /// BackupConfiguration owning the repository
        #[arg(long)]
        config: String,

        /// Snapshot to delete
        #[arg(long)]
        snapshot_id: String,

        /// Namespace of the BackupConfiguration
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Session name
    #[arg(long)]
    name: String,

    /// Session namespace
    #[arg(long)]
    namespace: String,

    /// Target to act for
    #[arg(long)]
    target_name: String,
}

impl Command {
    fn overrides(&self) -> Overrides {
        match self {
            Command::Server => Overrides::default(),
            Command::Restoresession {
                action: RestoreSessionAction::Start(args),
            }
            | Command::Backupsession {
                action: BackupSessionAction::Backup(args),
            } => Overrides {
                target_name: Some(args.target_name.clone()),
                namespace: Some(args.namespace.clone()),
            },
            Command::Snapshot {
                action: SnapshotAction::Delete { namespace, .. },
            } => Overrides {
                target_name: None,
                namespace: namespace.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AgentConfig::from_env(cli.command.overrides())?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_port = config.metrics_port;
    let context = Arc::new(build_context(client.clone(), config));

    match cli.command {
        Command::Server => run_server(client, context, metrics_port).await,
        Command::Restoresession {
            action: RestoreSessionAction::Start(args),
        } => {
            let outcome =
                restore::restore_from_init_container(&context, &args.namespace, &args.name, &args.target_name)
                    .await?;
            info!(name = %args.name, outcome = ?outcome, "Restore finished");
            Ok(())
        }
        Command::Backupsession {
            action: BackupSessionAction::Backup(args),
        } => {
            let outcome =
                backup::backup_from_snapshot_job(&context, &args.namespace, &args.name, &args.target_name)
                    .await?;
            info!(name = %args.name, outcome = ?outcome, "Snapshot backup finished");
            Ok(())
        }
        Command::Snapshot {
            action: SnapshotAction::Delete {
                config,
                snapshot_id,
                ..
            },
        } => {
            let namespace = context.namespace().to_string();
            backup::delete_snapshot(&context, &namespace, &config, &snapshot_id).await?;
            Ok(())
        }
    }
}

fn build_context(client: Client, config: AgentConfig) -> Context {
    let locator = ProcRootLocator::new(config.proc_root.clone());
    Context::new(
        Arc::new(KubeCluster::new(client)),
        Arc::new(ChrootRunner::new(locator)),
        Arc::new(Restic::new(config.restic_exec.clone())),
        config,
    )
}

async fn run_server(client: Client, context: Arc<Context>, metrics_port: u16) -> anyhow::Result<()> {
    info!(
        target_name = %context.target_name(),
        namespace = %context.namespace(),
        "Starting backup session agent"
    );

    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));

    let backup_controller =
        controllers::run_backup_session_controller(client.clone(), context.clone());
    let restore_controller = controllers::run_restore_session_controller(client, context);

    tokio::select! {
        _ = backup_controller => {
            error!("BackupSession controller exited unexpectedly");
        }
        _ = restore_controller => {
            error!("RestoreSession controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping agent");
        }
    }

    info!("Backup session agent stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
