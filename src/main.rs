//! kube-workflow - start ad-hoc containers on a cluster and watch them

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_workflow::config::{Configuration, Timing};
use kube_workflow::location::Location;
use kube_workflow::recipe::{EnvVar, StartupConfig};
use kube_workflow::recipes::{GenericContainerConfig, GenericContainerRecipe};
use kube_workflow::workflow::{RunningContainers, StartupWorkflow, WorkflowCreator};

/// Ephemeral workload orchestration for distributed tests on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kube-workflow", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true, env = "KUBE_WORKFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Use the long timeout set (15 minutes, polling every 10 seconds)
    #[arg(long, global = true)]
    long_timeouts: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start containers from an image and watch them until Ctrl-C or a crash
    ///
    /// All containers run in one pod. Ports get an environment variable
    /// `{TAG}_PORT` holding the allocated number.
    Run(RunArgs),

    /// Delete a test namespace and wait until it is gone
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Image to run
    #[arg(long)]
    image: String,

    /// Application name used for the pod label
    #[arg(long, default_value = "app")]
    name: String,

    /// Number of containers
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Tag of a port reachable from outside the cluster (repeatable)
    #[arg(long = "port")]
    ports: Vec<String>,

    /// Tag of a pod-local port (repeatable)
    #[arg(long = "internal-port")]
    internal_ports: Vec<String>,

    /// Environment variable as KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env_var)]
    env: Vec<EnvVar>,

    /// Pin the pod to the node with this hostname
    #[arg(long)]
    node: Option<String>,

    /// Lines of log to print for crashed containers
    #[arg(long, default_value_t = 100)]
    log_tail: i64,

    /// Delete the namespace after stopping
    #[arg(long)]
    cleanup: bool,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    /// Namespace to delete
    #[arg(long)]
    namespace: String,
}

fn parse_env_var(value: &str) -> Result<EnvVar, String> {
    match value.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok(EnvVar::new(name, value)),
        _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.long_timeouts)?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Cleanup(args) => cleanup(config, args).await,
    }
}

fn load_config(path: Option<&std::path::Path>, long_timeouts: bool) -> anyhow::Result<Configuration> {
    let mut config = match path {
        Some(path) => Configuration::from_file(path)?,
        None => Configuration::default(),
    };
    if long_timeouts {
        config.timing = Timing::long();
    }
    Ok(config)
}

async fn run(config: Configuration, args: RunArgs) -> anyhow::Result<()> {
    let creator = WorkflowCreator::connect(config).await?;
    let workflow = creator.create_workflow();

    let startup = StartupConfig::new().with(GenericContainerConfig {
        exposed_ports: args.ports,
        internal_ports: args.internal_ports,
        env: args.env,
        ..Default::default()
    });
    let location = args.node.map(Location::Node).unwrap_or_default();
    let recipe = GenericContainerRecipe::new(args.name, args.image);

    let running = workflow
        .start(args.count, &location, &recipe, &startup)
        .await?;
    print_running(&running);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("interrupted, stopping containers");
        }
        _ = first_terminal_watcher(&running) => {
            warn!("a container crashed, stopping containers");
        }
    }

    print_crash_logs(&workflow, &running, args.log_tail).await;
    workflow.stop(running, true).await?;

    if args.cleanup {
        workflow.delete_all_resources().await?;
    }
    Ok(())
}

async fn cleanup(mut config: Configuration, args: CleanupArgs) -> anyhow::Result<()> {
    config.namespace = Some(args.namespace);
    config.validate()?;

    let creator = WorkflowCreator::connect(config).await?;
    creator.create_workflow().delete_all_resources().await?;
    info!(namespace = %creator.namespace(), "namespace deleted");
    Ok(())
}

async fn first_terminal_watcher(running: &RunningContainers) {
    let watchers = running
        .containers()
        .iter()
        .map(|c| Box::pin(c.crash_watcher().wait_for_terminal()));
    futures::future::select_all(watchers).await;
}

fn print_running(running: &RunningContainers) {
    println!(
        "{} (namespace {}, pod {} at {})",
        running.deployment_name(),
        running.namespace(),
        running.pod().name,
        running.pod().ip
    );
    for container in running.containers() {
        println!("  {}", container);
        for address in container.addresses() {
            match &address.external {
                Some(external) => println!(
                    "    {:<16} {} (external {})",
                    address.port.tag, address.internal, external
                ),
                None => println!("    {:<16} {}", address.port.tag, address.internal),
            }
        }
    }
}

async fn print_crash_logs(workflow: &StartupWorkflow, running: &RunningContainers, tail: i64) {
    for container in running.crashed() {
        if let Some(report) = container.crash_watcher().crash_report() {
            println!("{} crashed: {}", container.name(), report.reason);
        }
        let mut print = |line: &str| println!("  | {}", line);
        if let Err(e) = workflow
            .download_container_log(container, &mut print, Some(tail))
            .await
        {
            warn!(container = %container.name(), error = %e, "failed to download log");
        }
    }
}
