#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use relctl_controller::{BackoffConfig, ControllerConfig, EnqueueHandler, ReleaseController, ReleaseManager, RetryQueue};
use relctl_core::{Delta, Release, ReleaseKey};
use relctl_manager::{Manager, ManagerConfig};
use relctl_persist::{default_db_path, Ledger, SqliteLedger};
use relctl_store::{spawn_ingest, DeletedRelease, EventHandler, ReleaseLister};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "relctl", version, about = "Release reconciliation controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", alias = "ns", env = "RELCTL_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Capacity of the watcher → cache channel
    #[arg(long = "queue-cap", env = "RELCTL_QUEUE_CAP", global = true, default_value_t = 2048)]
    queue_cap: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile releases until interrupted
    Run(RunArgs),
    /// Print the conditions of one release, e.g. "apps/web", or "web" with --namespace
    Conditions {
        key: String,
        /// Give up if the cache has not synced by then
        #[arg(long = "wait-secs", env = "RELCTL_WAIT_SECS", default_value_t = 8)]
        wait_secs: u64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Ledger database (default: ~/.relctl/ledger.db)
    #[arg(long = "db-path", env = "RELCTL_DB_PATH")]
    db_path: Option<String>,
    /// Concurrent reconcile workers
    #[arg(long = "workers", env = "RELCTL_WORKERS", default_value_t = 1)]
    workers: usize,
    /// Fail startup if the release cache has not synced by then
    #[arg(long = "sync-timeout-secs", env = "RELCTL_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,
    /// Repeat the orphan sweep when workers have been idle this long
    #[arg(long = "sweep-period-secs", env = "RELCTL_SWEEP_PERIOD_SECS")]
    sweep_period_secs: Option<u64>,
    #[arg(long = "backoff-base-ms", env = "RELCTL_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,
    #[arg(long = "backoff-max-secs", env = "RELCTL_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,
    /// Field manager for server-side apply
    #[arg(long = "field-manager", env = "RELCTL_FIELD_MANAGER", default_value = "relctl")]
    field_manager: String,
    #[arg(long = "max-yaml-bytes", env = "RELCTL_MAX_YAML_BYTES", default_value_t = 1_000_000)]
    max_yaml_bytes: usize,
    #[arg(long = "max-yaml-nodes", env = "RELCTL_MAX_YAML_NODES", default_value_t = 100_000)]
    max_yaml_nodes: usize,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            sync_timeout: self.sync_timeout_secs.map(Duration::from_secs),
            sweep_period: self.sweep_period_secs.filter(|s| *s > 0).map(Duration::from_secs),
            ..ControllerConfig::default()
        }
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig { base: Duration::from_millis(self.backoff_base_ms), max: Duration::from_secs(self.backoff_max_secs) }
    }

    fn manager_config(&self, namespace: Option<String>) -> ManagerConfig {
        ManagerConfig {
            field_manager: self.field_manager.clone(),
            max_yaml_bytes: self.max_yaml_bytes,
            max_yaml_nodes: self.max_yaml_nodes,
            namespace,
        }
    }
}

/// Handler for read-only commands that only need the cache.
struct Discard;

impl EventHandler for Discard {
    fn on_add(&self, _obj: &Release) {}
    fn on_update(&self, _old: &Release, _new: &Release) {}
    fn on_delete(&self, _obj: &DeletedRelease) {}
}

fn init_tracing() {
    let env = std::env::var("RELCTL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RELCTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RELCTL_METRICS_ADDR; expected host:port");
        }
    }
}

fn spawn_watcher(client: kube::Client, namespace: Option<String>, tx: mpsc::Sender<Delta>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = relctl_kubehub::start_watcher(client, namespace.as_deref(), tx).await {
            error!(error = ?e, "watcher failed");
        }
    })
}

fn open_ledger(args: &RunArgs) -> Result<SqliteLedger> {
    let path = args.db_path.clone().unwrap_or_else(default_db_path);
    let ledger = SqliteLedger::open(&path).with_context(|| format!("opening ledger at {path}"))?;
    info!(db = %path, "ledger opened");
    Ok(ledger)
}

/// `<namespace>/<name>`, or a bare name inside `--namespace`. A key in another
/// namespace than `--namespace` is rejected.
fn parse_key(raw: &str, namespace: Option<&str>) -> Result<ReleaseKey> {
    let key = match namespace {
        Some(ns) if !raw.contains('/') => ReleaseKey::new(ns, raw),
        _ => ReleaseKey::from_raw(raw),
    };
    let (ns, _) = key.split().with_context(|| format!("expected <namespace>/<name>, got {raw:?}"))?;
    if let Some(flag) = namespace {
        if flag != ns {
            bail!("release {raw:?} is not in namespace {flag:?}");
        }
    }
    Ok(key)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => run_controller(&cli, args).await,
        Commands::Conditions { key, wait_secs } => show_conditions(&cli, key, *wait_secs).await,
    }
}

async fn run_controller(cli: &Cli, args: &RunArgs) -> Result<()> {
    info!(ns = ?cli.namespace, workers = args.workers, "run invoked");
    let client = relctl_kubehub::get_kube_client().await?;
    let ledger: Arc<dyn Ledger> = Arc::new(open_ledger(args)?);

    let queue = RetryQueue::new(args.backoff());
    let handler = Arc::new(EnqueueHandler::new(queue.clone()));
    let (delta_tx, cache) = spawn_ingest(cli.queue_cap, handler.clone());
    let lister: Arc<dyn ReleaseLister> = Arc::new(cache);
    let manager: Arc<dyn ReleaseManager> =
        Arc::new(Manager::for_cluster(client.clone(), ledger, lister.clone(), &args.manager_config(cli.namespace.clone())));
    let controller = Arc::new(ReleaseController::new(queue, handler, manager, lister, args.controller_config()));

    let watcher = spawn_watcher(client, cli.namespace.clone(), delta_tx);

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received; shutting down");
                    stop.cancel();
                }
                Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
            }
        }
    });

    let res = controller.run(stop).await;
    watcher.abort();
    res.map_err(Into::into)
}

async fn show_conditions(cli: &Cli, raw: &str, wait_secs: u64) -> Result<()> {
    let key = parse_key(raw, cli.namespace.as_deref())?;
    let (ns, name) = key.split()?;
    let client = relctl_kubehub::get_kube_client().await?;
    let (delta_tx, cache) = spawn_ingest(cli.queue_cap, Arc::new(Discard));
    let watcher = spawn_watcher(client, Some(ns.to_string()), delta_tx);

    let synced = tokio::time::timeout(Duration::from_secs(wait_secs), cache.wait_for_sync()).await.unwrap_or(false);
    watcher.abort();
    if !synced {
        return Err(anyhow!("release cache did not sync within {wait_secs}s"));
    }
    let release = cache.get(ns, name)?.ok_or_else(|| anyhow!("release {key} not found"))?;

    match cli.output {
        Output::Human => {
            let current = release.authoritative_condition();
            println!("  TYPE         REASON       AGE      MESSAGE");
            for c in release.conditions() {
                let mark = if current == Some(c) { "*" } else { " " };
                let age = render_age(c.last_transition_time.0.timestamp());
                println!("{} {:<12} {:<12} {:<8} {}", mark, format!("{:?}", c.type_), c.reason.as_str(), age, c.message);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(release.conditions())?),
    }
    Ok(())
}

fn render_age(ts: i64) -> String {
    if ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_map_to_configs() {
        let cli = Cli::try_parse_from([
            "relctl", "run", "--workers", "4", "--sync-timeout-secs", "30", "--sweep-period-secs", "0",
            "--backoff-base-ms", "10", "--backoff-max-secs", "60",
        ])
        .unwrap();
        let Commands::Run(args) = &cli.command else { panic!("expected run") };
        let cfg = args.controller_config();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.sync_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.sweep_period, None);
        let b = args.backoff();
        assert_eq!((b.base, b.max), (Duration::from_millis(10), Duration::from_secs(60)));
        let mcfg = args.manager_config(cli.namespace.clone());
        assert_eq!(mcfg.field_manager, "relctl");
        assert_eq!(mcfg.namespace, None);
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["relctl", "conditions", "apps/web", "-o", "json", "--ns", "apps"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("apps"));
        assert!(matches!(cli.command, Commands::Conditions { ref key, .. } if key == "apps/web"));
    }

    #[test]
    fn keys_must_name_namespace_and_release() {
        assert!(parse_key("apps/web", None).is_ok());
        assert!(parse_key("bad::key::format", None).is_err());
        assert!(parse_key("web", None).is_err());
    }

    #[test]
    fn namespace_flag_scopes_the_key() {
        assert_eq!(parse_key("web", Some("apps")).unwrap(), ReleaseKey::new("apps", "web"));
        assert!(parse_key("apps/web", Some("apps")).is_ok());
        let err = parse_key("other/web", Some("apps")).unwrap_err();
        assert!(err.to_string().contains("not in namespace"), "{err}");
    }

    #[test]
    fn run_passes_the_watched_namespace_to_the_manager() {
        let cli = Cli::try_parse_from(["relctl", "run", "--namespace", "apps"]).unwrap();
        let Commands::Run(args) = &cli.command else { panic!("expected run") };
        assert_eq!(args.manager_config(cli.namespace.clone()).namespace.as_deref(), Some("apps"));
    }

    #[test]
    fn render_age_buckets() {
        assert_eq!(render_age(0), "-");
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        assert!(render_age(now - 90).ends_with('m'));
        assert!(render_age(now - 3 * 86_400).starts_with("3d"));
    }
}
