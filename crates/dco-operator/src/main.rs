//! Distributed compute operator - runs Dask clusters on Kubernetes

mod crds;

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tracing::{info, warn};

use dco_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use dco_common::telemetry::{init_telemetry, TelemetryConfig};
use dco_common::{EventPublisher, KubeEventPublisher};
use dco_reconciler::{KubeObjectClient, ObjectClient, RunConfig, WATCH_TIMEOUT_SECS};

/// dco - Kubernetes operator for distributed compute clusters
#[derive(Parser, Debug)]
#[command(name = "dco", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers
    Start(StartArgs),
    /// Install or update the custom resource definitions
    CrdApply,
    /// Delete the custom resource definitions
    CrdDelete,
    /// Print the custom resource definitions as YAML
    CrdPrint,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Namespaces to watch (comma separated); all namespaces when empty
    #[arg(long, env = "DCO_NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Custom resources reconciled in parallel per controller
    #[arg(long, env = "DCO_MAX_CONCURRENT_RECONCILES", default_value_t = 4)]
    max_concurrent_reconciles: u16,

    /// Run only while holding the leader lease
    #[arg(long, env = "DCO_LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace of the leader lease; defaults to the pod's namespace
    #[arg(long, env = "DCO_LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    /// Request admission webhooks for the custom resources
    #[arg(long, env = "DCO_ENABLE_WEBHOOKS")]
    enable_webhooks: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "DCO_DEVELOPMENT")]
    development: bool,

    /// Server-side timeout of watch requests, in seconds
    #[arg(long, env = "DCO_WATCH_TIMEOUT_SECS", default_value_t = WATCH_TIMEOUT_SECS)]
    watch_timeout_secs: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start(args).await,
        Commands::CrdApply => {
            let telemetry = init_telemetry(TelemetryConfig::default())?;
            let result = crds::apply(Client::try_default().await?).await;
            telemetry.shutdown();
            result
        }
        Commands::CrdDelete => {
            let telemetry = init_telemetry(TelemetryConfig::default())?;
            let result = crds::delete(Client::try_default().await?).await;
            telemetry.shutdown();
            result
        }
        Commands::CrdPrint => {
            print!("{}", crds::manifests()?);
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let telemetry = init_telemetry(TelemetryConfig {
        development: args.development,
        ..Default::default()
    })?;
    let result = run_controllers(args).await;
    telemetry.shutdown();
    result
}

async fn run_controllers(args: StartArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    info!(
        namespaces = ?args.namespaces,
        concurrency = args.max_concurrent_reconciles,
        webhooks = args.enable_webhooks,
        "Starting distributed compute operator"
    );

    let mut leadership = if args.leader_elect {
        let namespace = args
            .leader_election_namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| "default".to_string());
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("dco-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &namespace,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let objects: Arc<dyn ObjectClient> = Arc::new(KubeObjectClient::new(client.clone()));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), dco_dask::CONTROLLER_NAME));
    let mut dask = dco_dask::builder(objects, events);
    if args.enable_webhooks {
        dask = dask.with_webhooks();
    }
    let dask = dask.build()?;

    let config = RunConfig {
        namespaces: args.namespaces,
        concurrency: args.max_concurrent_reconciles,
        watch_timeout_secs: args.watch_timeout_secs,
    };
    let controllers = dask.run(client, config);

    match leadership.as_mut() {
        Some(guard) => {
            let lost = tokio::select! {
                _ = controllers => false,
                _ = guard.lost() => true,
            };
            if lost {
                return Err(anyhow::anyhow!("leadership lost, exiting so a standby can take over"));
            }
            if let Err(e) = guard.release().await {
                warn!(error = %e, "Failed to release leader lease");
            }
        }
        None => controllers.await,
    }

    info!("Operator stopped");
    Ok(())
}
