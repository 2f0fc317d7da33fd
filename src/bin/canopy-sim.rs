//! Runs a simulated cluster on an in-memory coordination ensemble.
//!
//! Starts several processes, lets them race on a shared counter and hand a
//! lock around, then expires one session and reports what the survivors saw.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use canopy::ClusterConfig;
use canopy::ClusterManager;
use canopy::coordination::MembershipEvent;
use canopy::logging::init_tracing;
use canopy::store::InMemoryEnsemble;
use canopy::store::InMemorySession;
use clap::Parser;
use tracing::info;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "canopy-sim")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated processes.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Counter increments issued by each process.
    #[arg(long, default_value_t = 10)]
    increments: u32,

    /// Lock acquisition budget in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    lock_timeout_ms: u64,
}

struct SimNode {
    session: Arc<InMemorySession>,
    manager: Arc<ClusterManager<InMemorySession>>,
}

fn load_config(args: &Args) -> Result<ClusterConfig> {
    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_toml_file(path)?,
        None => ClusterConfig::load_with_layers()?,
    };
    config.apply_env_overrides()?;
    // Keep simulated retries short regardless of the configured service.
    config.retry.initial_sleep_ms = config.retry.initial_sleep_ms.min(50);
    config.retry.max_sleep_ms = config.retry.max_sleep_ms.min(200).max(config.retry.initial_sleep_ms);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    if args.nodes < 2 {
        bail!("at least two nodes are needed to observe membership changes");
    }
    let base = load_config(&args)?;
    let ensemble = InMemoryEnsemble::new();

    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        let session = ensemble.connect();
        let config = ClusterConfig {
            node_id: Some(format!("sim-{index}")),
            ..base.clone()
        };
        let manager = Arc::new(ClusterManager::new(Arc::clone(&session), config)?);
        manager.join().await.with_context(|| format!("node sim-{index} failed to join"))?;
        nodes.push(SimNode { session, manager });
    }
    info!(members = ?nodes[0].manager.nodes(), "all nodes joined");

    let mut tasks = Vec::new();
    for node in &nodes {
        let manager = Arc::clone(&node.manager);
        let increments = args.increments;
        tasks.push(tokio::spawn(async move {
            let counter = manager.counter("sim-hits");
            for _ in 0..increments {
                counter.increment_and_get().await?;
            }
            Ok::<_, canopy::coordination::CoordinationError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    let total = nodes[0].manager.counter("sim-hits").get().await?;
    info!(total, expected = args.nodes as u64 * u64::from(args.increments), "counter settled");

    let timeout = Duration::from_millis(args.lock_timeout_ms);
    let mut tasks = Vec::new();
    for node in &nodes {
        let manager = Arc::clone(&node.manager);
        tasks.push(tokio::spawn(async move {
            let guard = manager.lock_with_timeout("sim-lock", timeout).await?;
            info!(node_id = %manager.node_id(), fencing_token = %guard.fencing_token(), "lock held");
            tokio::time::sleep(Duration::from_millis(10)).await;
            guard.release().await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let observer = &nodes[0];
    let mut events = observer.manager.membership_events();
    let victim = &nodes[nodes.len() - 1];
    info!(node_id = %victim.manager.node_id(), "expiring session");
    victim.session.expire();

    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Ok(MembershipEvent::Left(id))) => info!(observer = %observer.manager.node_id(), left = %id, "departure observed"),
        Ok(Ok(other)) => warn!(?other, "unexpected membership event"),
        Ok(Err(e)) => warn!(error = %e, "membership event stream failed"),
        Err(_) => warn!("no departure observed within 5s"),
    }
    info!(members = ?observer.manager.nodes(), "surviving view");

    for node in &nodes {
        if let Err(e) = node.manager.leave().await {
            warn!(node_id = %node.manager.node_id(), error = %e, "leave failed");
        }
    }
    Ok(())
}
