use std::{sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::{Client, CustomResourceExt};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vmcluster_controller::{
    api::VmCluster, config::ControllerConfig, provider::vmop::VmOperatorProvider, reconcilers,
};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the cluster reconciliation loop
    Reconcile(ReconcileArgs),
    /// Output the K8s manifest for the VmCluster CRD
    CrdManifest,
}

#[derive(Debug, Clone, Args)]
struct ReconcileArgs {
    /// Only manage clusters in this namespace
    #[arg(long, env = "VMCLUSTER_NAMESPACE")]
    namespace: Option<String>,
    /// Seconds between reconciles of a settled cluster
    #[arg(long, env = "VMCLUSTER_REQUEUE_SECS", default_value_t = 60)]
    requeue_secs: u64,
    /// Seconds before retrying a failed reconcile
    #[arg(long, env = "VMCLUSTER_ERROR_REQUEUE_SECS", default_value_t = 10)]
    error_requeue_secs: u64,
    /// Deadline for a single reconcile cycle, in seconds
    #[arg(long, env = "VMCLUSTER_CYCLE_TIMEOUT_SECS", default_value_t = 300)]
    cycle_timeout_secs: u64,
}

impl From<ReconcileArgs> for ControllerConfig {
    fn from(args: ReconcileArgs) -> Self {
        ControllerConfig {
            namespace: args.namespace,
            requeue_interval: Duration::from_secs(args.requeue_secs),
            error_requeue: Duration::from_secs(args.error_requeue_secs),
            cycle_timeout: Duration::from_secs(args.cycle_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Reconcile(args)) => run_controller(args.into()).await?,
        Some(Commands::CrdManifest) => {
            println!("{}", serde_yaml_ng::to_string(&VmCluster::crd())?);
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let provider = Arc::new(VmOperatorProvider::new(client.clone()));

    tracing::info!(?config, "Starting cluster controller");

    reconcilers::cluster::control_loop(client, provider, config)
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("Reconciled cluster {:?}", o),
                Err(e) => tracing::error!("Cluster reconcile failed: {:?}", e),
            }
        })
        .await;

    tracing::info!("controller terminated");
    Ok(())
}
