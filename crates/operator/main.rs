use ais_cluster::api::v1beta1::aistore::ClusterState;
use ais_cluster::controllers::cluster_controller::{self, State};
use ais_cluster::controllers::operations::{ClusterOperations, ScaleTarget};
use ais_cluster::util::retry::RetryPolicy;
use ais_cluster::util::settings::ControllerSettings;
use ais_cluster::util::telemetry::{self, LogFormat};
use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::Client;
use std::time::Duration;
use tracing::info;

mod handlers;
mod server;

#[derive(Parser, Debug)]
#[command(name = "operator", version, about = "Lifecycle operator for AIStore clusters")]
struct Cli {
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = Format::Compact, global = true)]
    log_format: Format,

    #[command(flatten)]
    run: RunArgs,

    /// Without a subcommand the controller and its HTTP endpoints run.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Compact,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grow or shrink a cluster.
    Scale {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// `cluster`, `proxy` or `target`
        #[arg(long, default_value = "cluster")]
        role: ScaleTarget,
        #[arg(long, allow_hyphen_values = true)]
        delta: i32,
    },
    /// Scale both roles to zero, keeping config and data.
    Shutdown {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Bring a shut down cluster back.
    Resume {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Replace the daemon and/or init images.
    Upgrade {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[arg(long)]
        node_image: Option<String>,
        #[arg(long)]
        init_image: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(long, env = "OPERATOR_BIND", default_value = "0.0.0.0:8080")]
    bind: String,
    #[arg(long, env = "REQUEUE_CONVERGING_SECS", default_value_t = 10)]
    requeue_converging_secs: u64,
    #[arg(long, env = "REQUEUE_READY_SECS", default_value_t = 300)]
    requeue_ready_secs: u64,
    #[arg(long, env = "BACKOFF_BASE_SECS", default_value_t = 5)]
    backoff_base_secs: u64,
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,
    /// Consecutive failures before a cluster is reported as Failed.
    #[arg(long, env = "FAILURE_THRESHOLD", default_value_t = 10)]
    failure_threshold: u32,
    #[arg(long, env = "MEMBERSHIP_ATTEMPTS", default_value_t = 5)]
    membership_attempts: u32,
    #[arg(long, env = "MEMBERSHIP_INTERVAL_SECS", default_value_t = 2)]
    membership_interval_secs: u64,
    #[arg(long, env = "MEMBERSHIP_TIMEOUT_SECS", default_value_t = 15)]
    membership_timeout_secs: u64,
    /// Accept self-signed proxy certificates when querying the cluster map.
    #[arg(long, env = "INSECURE_SKIP_VERIFY", default_value_t = true, action = ArgAction::Set)]
    insecure_skip_verify: bool,
}

impl From<&RunArgs> for ControllerSettings {
    fn from(args: &RunArgs) -> Self {
        ControllerSettings {
            requeue_converging: Duration::from_secs(args.requeue_converging_secs),
            requeue_ready: Duration::from_secs(args.requeue_ready_secs),
            backoff_base: Duration::from_secs(args.backoff_base_secs),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
            failure_threshold: args.failure_threshold,
            membership: RetryPolicy {
                max_attempts: args.membership_attempts,
                interval: Duration::from_secs(args.membership_interval_secs),
                timeout: Duration::from_secs(args.membership_timeout_secs),
            },
            insecure_skip_verify: args.insecure_skip_verify,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ClusterArgs {
    /// Name of the AIStore resource.
    name: String,
    #[arg(long, short, env = "NAMESPACE", default_value = "default")]
    namespace: String,
    /// Block until the controller reports the expected state.
    #[arg(long)]
    wait: bool,
    #[arg(long, default_value_t = 600)]
    wait_timeout_secs: u64,
}

impl ClusterArgs {
    fn wait_policy(&self) -> RetryPolicy {
        let interval = Duration::from_secs(5);
        RetryPolicy {
            max_attempts: (self.wait_timeout_secs / interval.as_secs()).max(1) as u32,
            interval,
            timeout: Duration::from_secs(self.wait_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = match cli.log_format {
        Format::Compact => LogFormat::Compact,
        Format::Json => LogFormat::Json,
    };
    telemetry::init(format).map_err(|e| anyhow!(e))?;

    let Some(command) = cli.command else {
        return run(cli.run).await;
    };
    match command {
        Command::Scale { cluster, role, delta } => {
            let ops = operations(&cluster).await?;
            let updated = ops.scale(role, delta).await?;
            if cluster.wait {
                ops.wait_for_ready(&updated, &cluster.wait_policy()).await?;
            }
            Ok(())
        }
        Command::Shutdown { cluster } => {
            let ops = operations(&cluster).await?;
            let updated = ops.shutdown().await?;
            if cluster.wait {
                let policy = cluster.wait_policy();
                ops.wait_for_state(ClusterState::Shutdown, updated.metadata.generation, &policy)
                    .await?;
                ops.wait_for_pods(0, &policy).await?;
            }
            Ok(())
        }
        Command::Resume { cluster } => {
            let ops = operations(&cluster).await?;
            let updated = ops.resume().await?;
            if cluster.wait {
                ops.wait_for_ready(&updated, &cluster.wait_policy()).await?;
            }
            Ok(())
        }
        Command::Upgrade {
            cluster,
            node_image,
            init_image,
        } => {
            if node_image.is_none() && init_image.is_none() {
                return Err(anyhow!("pass --node-image and/or --init-image"));
            }
            let ops = operations(&cluster).await?;
            let updated = ops.upgrade(node_image.as_deref(), init_image.as_deref()).await?;
            if cluster.wait {
                ops.wait_for_ready(&updated, &cluster.wait_policy()).await?;
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let state = State::new(ControllerSettings::from(&args));
    info!("Starting controller, serving on {}", args.bind);

    let controller = cluster_controller::run(state.clone());
    let server = server::start_server(state, &args.bind);

    // both stop on SIGTERM
    let (controller, server) = tokio::join!(controller, server);
    controller?;
    server
}

async fn operations(cluster: &ClusterArgs) -> anyhow::Result<ClusterOperations> {
    let client = Client::try_default().await?;
    Ok(ClusterOperations::new(client, &cluster.namespace, &cluster.name))
}
