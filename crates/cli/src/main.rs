//! kilnctl: run the kiln controllers, or inspect and dry-run their dependent graphs.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kiln_apply::{KubeCluster, MemoryCluster};
use kiln_core::{EmptyCache, Primary, StatusSink};
use kiln_apps::SecretSeed;
use kiln_engine::{AppController, AppDefinition, Engine, EngineConfig, PassOutcome, WorkQueue};
use kiln_store::Multiplexer;
use kube::core::DynamicObject;
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kilnctl", version, about = "Kiln operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict watches to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "KILN_NAMESPACE")]
    namespace: Option<String>,

    /// Key that generated app secrets are derived from; keep it stable across restarts
    #[arg(long = "secret-seed", global = true, env = "KILN_SECRET_SEED", hide_env_values = true)]
    secret_seed: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the managed applications
    Apps,
    /// Print an app's dependent graph in reconcile order
    Graph {
        /// App name or primary kind, e.g. "plane"
        app: String,
    },
    /// Run one pass for a primary manifest against an in-memory cluster
    Plan {
        app: String,
        /// Primary manifest (YAML or JSON)
        #[arg(short = 'f', long = "file")]
        file: std::path::PathBuf,
    },
    /// Run controllers against the current kube context until Ctrl-C
    Run {
        /// Apps to run (repeatable); default: all
        #[arg(long = "app")]
        apps: Vec<String>,
        /// Concurrent passes per app
        #[arg(long = "workers", env = "KILN_WORKERS")]
        workers: Option<usize>,
        /// Per-dependent apply timeout in seconds
        #[arg(long = "apply-timeout", env = "KILN_APPLY_TIMEOUT_SECS")]
        apply_timeout_secs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

fn lookup(name: &str, seed: &SecretSeed) -> Result<AppDefinition> {
    match kiln_apps::find_app(name, Some(seed))? {
        Some(app) => Ok(app),
        None => bail!("unknown app {:?}; see `kilnctl apps`", name),
    }
}

fn print_apps(output: Output) -> Result<()> {
    let apps = kiln_apps::all_apps(None)?;
    match output {
        Output::Human => {
            for a in &apps {
                println!("{} • {} • {} nodes", a.name, a.primary_type, a.graph.len());
            }
        }
        Output::Json => {
            let rows: Vec<_> = apps
                .iter()
                .map(|a| json!({ "name": a.name, "primaryType": a.primary_type.gvk_key(), "nodes": a.graph.len() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

fn print_graph(app: &AppDefinition, output: Output) -> Result<()> {
    let rows: Vec<_> = app
        .graph
        .ordered()
        .map(|n| {
            json!({
                "node": n.name(),
                "type": n.type_key().gvk_key(),
                "dependsOn": n.hard_deps(),
                "after": n.soft_deps(),
                "precondition": n.precondition().is_some(),
                "readyCheck": n.postcondition().is_some(),
            })
        })
        .collect();
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Output::Human => {
            for (i, n) in app.graph.ordered().enumerate() {
                let mut line = format!("{:>2}. {} ({})", i + 1, n.name(), n.type_key());
                if !n.hard_deps().is_empty() {
                    line.push_str(&format!(" depends_on=[{}]", n.hard_deps().join(", ")));
                }
                if !n.soft_deps().is_empty() {
                    line.push_str(&format!(" after=[{}]", n.soft_deps().join(", ")));
                }
                if n.precondition().is_some() {
                    line.push_str(" [gated]");
                }
                if n.postcondition().is_some() {
                    line.push_str(" [ready-check]");
                }
                println!("{}", line);
            }
        }
    }
    Ok(())
}

/// Load a primary manifest into a fresh in-memory cluster so it gets a uid like a real one.
fn load_primary(app: &AppDefinition, cluster: &MemoryCluster, path: &std::path::Path) -> Result<Primary> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut obj: DynamicObject = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(kind) = obj.types.as_ref().map(|t| t.kind.as_str()) {
        if kind != app.primary_type.kind {
            bail!("{} is a {}, but app {} manages {}", path.display(), kind, app.name, app.primary_type.kind);
        }
    }
    let name = obj.metadata.name.clone().context("manifest has no metadata.name")?;
    let ns = obj.metadata.namespace.get_or_insert_with(|| "default".to_string()).clone();
    cluster.insert(&app.primary_type, obj);
    let stored = cluster.object(&app.primary_type, Some(&ns), &name).context("primary vanished from memory cluster")?;
    Ok(Primary::from_dynamic(&app.primary_type, &stored)?)
}

fn print_plan(app: &AppDefinition, primary: &Primary, pass: &PassOutcome, output: Output) -> Result<()> {
    let mut status = app.status.aggregate(&pass.observed);
    status.observed_generation = primary.generation;
    match output {
        Output::Json => {
            let nodes: Vec<_> = app
                .graph
                .ordered()
                .map(|n| {
                    let state = pass.observed.state(n.name()).cloned().unwrap_or_default();
                    json!({
                        "node": n.name(),
                        "state": state.label(),
                        "detail": state.to_string(),
                        "object": n.dependent().object_name(primary),
                    })
                })
                .collect();
            let out = json!({ "primary": primary.reference.to_string(), "requeue": pass.requeue.as_str(), "nodes": nodes, "status": status.to_json() });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Output::Human => {
            println!("{} → {}", primary.reference, pass.requeue.as_str());
            for n in app.graph.ordered() {
                let state = pass.observed.state(n.name()).cloned().unwrap_or_default();
                println!("  {:<28} {:<16} {} {}", n.name(), state.label(), n.type_key().kind, n.dependent().object_name(primary));
                if let kiln_core::NodeState::Skipped(_) | kiln_core::NodeState::Failed(_) = state {
                    println!("  {:<28} ↳ {}", "", state);
                }
            }
            for (component, c) in &status.components {
                let detail = c.detail.as_deref().unwrap_or("");
                println!("  status.{:<21} ready={} {}", component, c.ready, detail);
            }
        }
    }
    Ok(())
}

async fn plan(app: AppDefinition, file: &std::path::Path, output: Output) -> Result<()> {
    let cluster = Arc::new(MemoryCluster::new());
    let primary = load_primary(&app, &cluster, file)?;
    let engine = Engine::new(cluster.clone(), EngineConfig::from_env().apply_timeout);
    let pass = engine.reconcile(&primary, &app.graph, &EmptyCache).await;
    print_plan(&app, &primary, &pass, output)
}

async fn run(selected: Vec<AppDefinition>, cfg: EngineConfig) -> Result<()> {
    let cluster = Arc::new(KubeCluster::try_default().await?);
    let client = cluster.client();
    let mux = Multiplexer::new(cfg.queue_cap);
    let engine = Engine::new(cluster.clone(), cfg.apply_timeout);
    let status: Arc<dyn StatusSink> = cluster.clone();

    let mut queues = Vec::new();
    for app in selected {
        let app = Arc::new(app);
        let controller = AppController::new(app.clone(), engine.clone(), mux.clone(), status.clone(), cfg.status_conflict_retries);
        let queue = WorkQueue::spawn(Arc::new(controller), cfg.policy.clone(), cfg.workers, cfg.queue_cap);
        for tk in app.graph.type_keys() {
            kiln_kubehub::ensure_type_watcher(&client, &mux, &tk, cfg.namespace.clone());
            mux.subscribe(&tk, &app.primary_type.kind, queue.sender());
        }
        tokio::spawn({
            let (client, tk, ns, tx) = (client.clone(), app.primary_type.clone(), cfg.namespace.clone(), queue.sender());
            async move {
                if let Err(e) = kiln_kubehub::watch_primaries(client, tk.clone(), ns, tx).await {
                    error!(gvk = %tk, error = ?e, "primary watcher failed");
                }
            }
        });
        info!(app = %app.name, primary = %app.primary_type, nodes = app.graph.len(), workers = cfg.workers, "controller started");
        queues.push(queue);
    }
    info!(types = mux.registered().len(), ns = ?cfg.namespace, "kiln running; Ctrl-C to stop");

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    let drain = async {
        for q in &queues {
            q.shutdown().await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("in-flight passes did not finish within 10s");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let configured = cli.secret_seed.as_deref().and_then(SecretSeed::new);

    match cli.command {
        Commands::Apps => print_apps(cli.output)?,
        Commands::Graph { app } => print_graph(&lookup(&app, &SecretSeed::ephemeral())?, cli.output)?,
        Commands::Plan { app, file } => {
            let seed = configured.unwrap_or_else(SecretSeed::ephemeral);
            plan(lookup(&app, &seed)?, &file, cli.output).await?
        }
        Commands::Run { apps, workers, apply_timeout_secs } => {
            let Some(seed) = configured else {
                bail!("KILN_SECRET_SEED (or --secret-seed) is required to run controllers");
            };
            let selected = if apps.is_empty() {
                kiln_apps::all_apps(Some(&seed))?
            } else {
                apps.iter().map(|a| lookup(a, &seed)).collect::<Result<Vec<_>>>()?
            };
            let mut cfg = EngineConfig::from_env();
            if let Some(w) = workers {
                cfg.workers = w.max(1);
            }
            if let Some(s) = apply_timeout_secs {
                cfg.apply_timeout = Duration::from_secs(s);
            }
            if cli.namespace.is_some() {
                cfg.namespace = cli.namespace.clone();
            }
            run(selected, cfg).await?;
        }
    }
    Ok(())
}
