use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use nslife_controller::{mark_terminating, AdapterRegistry, CascadeReport, Controller, ControllerConfig};
use nslife_core::fanout::join_bounded;
use nslife_core::prelude::*;
use nslife_core::wait::{poll_until, WaitError};
use nslife_store::{pods, service_accounts, services, MemoryStore, MemoryStoreConfig};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nslifectl", version, about = "Namespace lifecycle controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until Ctrl-C
    Run {
        /// Use an in-memory store instead of the current kube context
        #[arg(long = "sim", action = ArgAction::SetTrue)]
        sim: bool,
        /// Override NSLIFE_WORKERS
        #[arg(long = "workers")]
        workers: Option<usize>,
    },
    /// Request deletion of a namespace
    Delete {
        name: String,
    },
    /// Show one namespace
    Get {
        name: String,
    },
    /// List namespaces
    Ls {
        /// Only namespaces whose name contains this string
        #[arg(long = "filter")]
        filter: Option<String>,
    },
    /// Create many namespaces, delete them all, and wait for the controller to drain them
    Extinguish {
        #[arg(long = "total", default_value_t = 100)]
        total: usize,
        /// Succeed once at most this many remain
        #[arg(long = "max-remaining", default_value_t = 10)]
        max_remaining: usize,
        #[arg(long = "max-secs", default_value_t = 150)]
        max_secs: u64,
        #[arg(long = "prefix", default_value = "nslifetest")]
        prefix: String,
        /// Pause between creation and deletion
        #[arg(long = "settle-secs", default_value_t = 10)]
        settle_secs: u64,
        #[arg(long = "sim", action = ArgAction::SetTrue)]
        sim: bool,
        /// Override NSLIFE_WORKERS
        #[arg(long = "workers")]
        workers: Option<usize>,
    },
}

fn init_tracing() {
    let env = std::env::var("NSLIFE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NSLIFE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NSLIFE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Store plus the adapters that drain it.
struct Backend {
    store: Arc<dyn NamespaceStore>,
    registry: AdapterRegistry,
    /// Set for the in-memory store so scenarios can seed items.
    memory: Option<Arc<MemoryStore>>,
}

async fn backend(sim: bool) -> Result<Backend> {
    if sim {
        let mem = MemoryStore::new(MemoryStoreConfig { provision_service_account: Some(Duration::from_millis(50)) });
        let mut builder = AdapterRegistry::builder();
        for kind in [pods(), services(), service_accounts()] {
            mem.register_kind(&kind);
        }
        for adapter in mem.adapters() {
            builder = builder.register(adapter)?;
        }
        info!("using in-memory store");
        return Ok(Backend { store: mem.clone(), registry: builder.build(), memory: Some(mem) });
    }
    let client = nslife_kubehub::client().await?;
    let mut builder = AdapterRegistry::builder();
    for adapter in nslife_kubehub::discover_adapters(client.clone()).await? {
        builder = builder.register(adapter)?;
    }
    Ok(Backend { store: Arc::new(nslife_kubehub::KubeNamespaceStore::new(client)), registry: builder.build(), memory: None })
}

fn config(workers: Option<usize>) -> ControllerConfig {
    let mut cfg = ControllerConfig::from_env();
    if let Some(w) = workers {
        cfg.workers = w.max(1);
    }
    cfg
}

fn age(creation_ts: i64) -> String {
    let secs = (nslife_core::now_ts() - creation_ts).max(0);
    match secs {
        s if s < 120 => format!("{}s", s),
        s if s < 7200 => format!("{}m", s / 60),
        s if s < 172_800 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

fn print_namespaces(output: Output, items: &[Namespace]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<32} {:<12} {:<6} PENDING", "NAME", "PHASE", "AGE");
            for ns in items {
                println!("{:<32} {:<12} {:<6} {}", ns.name, ns.phase, age(ns.creation_ts), ns.finalizers.join(","));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn print_report(output: Output, report: &CascadeReport) -> Result<()> {
    match output {
        Output::Human => {
            println!("completed: {}  failed passes: {}  stuck: {}", report.completed, report.failed_passes, report.stuck);
            for c in &report.cascades {
                let flag = if c.stuck { " STUCK" } else { "" };
                println!(
                    "  {:<32} {:?}{} passes={} retries={} deleted={} pending=[{}] {}",
                    c.namespace,
                    c.stage,
                    flag,
                    c.passes,
                    c.retries,
                    c.deleted,
                    c.pending_kinds.join(","),
                    c.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct ExtinguishSummary {
    total: usize,
    remaining: usize,
    max_remaining: usize,
    elapsed_secs: u64,
    ok: bool,
}

#[allow(clippy::too_many_arguments)]
async fn extinguish(output: Output, total: usize, max_remaining: usize, max_secs: u64, prefix: &str, settle: Duration, sim: bool, workers: Option<usize>) -> Result<()> {
    let Backend { store, registry, memory } = backend(sim).await?;
    let ctl = Controller::new(store.clone(), registry, config(workers));
    let handle = ctl.start();

    info!(total, prefix = %prefix, "creating namespaces");
    join_bounded(20, (0..total).map(|i| {
        let store = store.clone();
        let memory = memory.clone();
        let name = format!("{}-{}", prefix, i);
        async move {
            store.create_namespace(&name).await?;
            if let Some(mem) = memory {
                mem.create_item(&pods(), &name, "test-pod")?;
                mem.create_item(&services(), &name, "test-service")?;
            }
            Ok::<_, StoreError>(())
        }
    }))
    .await
    .map_err(|e| anyhow!("creating namespaces: {}", e))?;

    tokio::time::sleep(settle).await;

    let targets = store.list_namespaces(Some(prefix)).await?;
    info!(count = targets.len(), "requesting deletion");
    let tracker = ctl.tracker();
    join_bounded(20, targets.iter().map(|ns| {
        let tracker = tracker.clone();
        let name = ns.name.clone();
        async move { tracker.request_deletion(&name).await }
    }))
    .await
    .map_err(|e| anyhow!("requesting deletion: {}", e))?;

    let started = Instant::now();
    let max_wait = Duration::from_secs(max_secs);
    let waited = poll_until(Duration::from_secs(2), max_wait, || {
        let store = store.clone();
        let prefix = prefix.to_string();
        async move {
            let left = store.list_namespaces(Some(&prefix)).await?.len();
            info!(remaining = left, "waiting for namespaces to drain");
            Ok::<_, StoreError>(left <= max_remaining)
        }
    })
    .await;

    let remaining = store.list_namespaces(Some(prefix)).await?.len();
    let summary = ExtinguishSummary { total, remaining, max_remaining, elapsed_secs: started.elapsed().as_secs(), ok: waited.is_ok() };
    match output {
        Output::Human => println!("{} of {} namespaces remaining after {}s (allowed {})", remaining, total, summary.elapsed_secs, max_remaining),
        Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    if remaining > 0 {
        print_report(output, &ctl.status().current())?;
    }
    handle.shutdown_and_wait().await?;
    match waited {
        Ok(()) => Ok(()),
        Err(WaitError::Timeout(d)) => Err(anyhow!("{} namespaces still present after {:?}", remaining, d)),
        Err(WaitError::Condition(e)) => Err(anyhow!(e).context("polling remaining namespaces")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { sim, workers } => {
            let Backend { store, registry, .. } = backend(sim).await?;
            info!(kinds = ?registry.keys(), "adapters registered");
            let ctl = Controller::new(store, registry, config(workers));
            let handle = ctl.start();
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down");
            handle.shutdown_and_wait().await?;
            print_report(cli.output, &ctl.status().current())?;
        }
        Commands::Delete { name } => {
            let Backend { store, registry, .. } = backend(false).await?;
            match mark_terminating(store.as_ref(), &name, &registry.finalizers()).await {
                Ok(ns) => print_namespaces(cli.output, &[ns])?,
                Err(e) => {
                    error!(ns = %name, error = %e, "delete failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Get { name } => {
            let client = nslife_kubehub::client().await?;
            let store = nslife_kubehub::KubeNamespaceStore::new(client);
            let ns = store.get_namespace(&name).await?;
            print_namespaces(cli.output, &[ns])?;
        }
        Commands::Ls { filter } => {
            let client = nslife_kubehub::client().await?;
            let store = nslife_kubehub::KubeNamespaceStore::new(client);
            let items = store.list_namespaces(filter.as_deref()).await?;
            print_namespaces(cli.output, &items)?;
        }
        Commands::Extinguish { total, max_remaining, max_secs, prefix, settle_secs, sim, workers } => {
            extinguish(cli.output, total, max_remaining, max_secs, &prefix, Duration::from_secs(settle_secs), sim, workers).await?;
        }
    }
    Ok(())
}
