use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kustodian_apply::{manifest, KubeEngine};
use kustodian_core::{Action, Change, Error};
use kustodian_inventory::{codec, InventoryStore, KubeInventoryStore};
use kustodian_reconcile::{ReconcileConfig, Reconciler, Reporter};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kustodian", version, about = "Apply, prune and delete named inventories of Kubernetes objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the inventory record
    #[arg(short = 'n', long = "namespace", global = true, env = "KUSTODIAN_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Bound for the whole run, e.g. 90s, 5m
    #[arg(long = "timeout", global = true, value_parser = parse_duration, default_value = "60s")]
    timeout: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply manifests as inventory NAME
    Apply {
        name: String,
        /// Manifest files or directories
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        /// Delete objects removed since the previous apply
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        /// Wait for objects to become ready
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Recreate objects with immutable field changes
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// URL of the manifest source, recorded on the inventory
        #[arg(long = "source")]
        source: Option<String>,
        /// Source revision, recorded on the inventory
        #[arg(long = "revision")]
        revision: Option<String>,
        /// Create the inventory namespace if missing
        #[arg(long = "create-namespace", action = ArgAction::SetTrue)]
        create_namespace: bool,
    },
    /// Print manifests in apply order
    Build {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        /// List container images instead of objects
        #[arg(long = "container-images", action = ArgAction::SetTrue)]
        container_images: bool,
    },
    /// Delete every object owned by inventory NAME, then the inventory
    Delete {
        name: String,
        /// Wait for deleted objects to terminate
        #[arg(long = "wait", action = ArgAction::Set, default_value_t = true)]
        wait: bool,
    },
    /// Show the stored inventory NAME
    Inspect { name: String },
}

fn init_tracing() {
    let env = std::env::var("KUSTODIAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUSTODIAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUSTODIAN_METRICS_ADDR; expected host:port");
        }
    }
}

fn poll_interval() -> Duration {
    let ms = std::env::var("KUSTODIAN_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(2000);
    Duration::from_millis(ms.max(100))
}

/// `90`, `90s`, `500ms`, `5m` or `1h`.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().with_context(|| format!("invalid duration {:?}", s))?;
    let secs = |per: u64| {
        n.checked_mul(per).map(Duration::from_secs).ok_or_else(|| anyhow!("duration {:?} is too large", s))
    };
    let d = match unit {
        "" | "s" => Duration::from_secs(n),
        "ms" => Duration::from_millis(n),
        "m" => secs(60)?,
        "h" => secs(3600)?,
        other => return Err(anyhow!("invalid duration unit {:?} in {:?}", other, s)),
    };
    if d.is_zero() {
        return Err(anyhow!("duration must be greater than zero"));
    }
    Ok(d)
}

/// Prints each change on stdout as it happens; progress goes to stderr.
struct PrintReporter;

impl Reporter for PrintReporter {
    fn change(&self, change: &Change) { println!("{}", change); }
    fn progress(&self, message: &str) { eprintln!("◎ {}", message); }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { name, files, prune, wait, force, source, revision, create_namespace } => {
            let manifests = manifest::load(&files)?;
            info!(inventory = %name, objects = manifests.objects.len(), "apply invoked");
            let mut config = ReconcileConfig::new(name, cli.namespace.clone());
            config.source = source;
            config.revision = revision;
            config.prune = prune;
            config.wait = wait;
            config.force = force;
            config.timeout = cli.timeout;
            config.poll_interval = poll_interval();
            config.validate()?;

            let client = kustodian_kubehub::get_kube_client().await?;
            let store = KubeInventoryStore::new(client.clone()).with_create_namespace(create_namespace);
            let reconciler = Reconciler::new(KubeEngine::new(client), store, config).with_reporter(PrintReporter);
            let report = reconciler.apply(manifests.objects, manifests.digests).await?;
            eprintln!(
                "✔ inventory {}: {} applied, {} pruned",
                report.inventory.key(),
                report.applied.len() - report.applied.count(Action::Unchanged),
                report.pruned.count(Action::Deleted)
            );
        }
        Commands::Build { files, container_images } => {
            let mut manifests = manifest::load(&files)?;
            kustodian_plan::cede_replicas(&mut manifests.objects);
            let ordered = kustodian_plan::plan(manifests.objects)?.into_ordered();
            if container_images {
                let images: BTreeSet<String> = ordered.iter().flat_map(|o| o.container_images()).collect();
                match cli.output {
                    Output::Human => {
                        for image in images {
                            println!("{}", image);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&images)?),
                }
                return Ok(());
            }
            match cli.output {
                Output::Human => {
                    for obj in &ordered {
                        print!("---\n{}", serde_yaml::to_string(obj.raw())?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&ordered)?),
            }
        }
        Commands::Delete { name, wait } => {
            info!(inventory = %name, "delete invoked");
            let mut config = ReconcileConfig::new(name, cli.namespace.clone());
            config.wait = wait;
            config.timeout = cli.timeout;
            config.poll_interval = poll_interval();
            config.validate()?;

            let client = kustodian_kubehub::get_kube_client().await?;
            let store = KubeInventoryStore::new(client.clone());
            let reconciler = Reconciler::new(KubeEngine::new(client), store, config).with_reporter(PrintReporter);
            let report = reconciler.delete().await?;
            eprintln!(
                "✔ inventory {} deleted: {} object(s) removed",
                report.inventory.key(),
                report.deleted.count(Action::Deleted)
            );
        }
        Commands::Inspect { name } => {
            let client = kustodian_kubehub::get_kube_client().await?;
            let store = KubeInventoryStore::new(client);
            let inv = store
                .load(&name, &cli.namespace)
                .await?
                .ok_or_else(|| Error::InventoryNotFound(format!("{}/{}", cli.namespace, name)))?;
            match cli.output {
                Output::Human => {
                    println!("inventory: {}", inv.key());
                    if let Some(source) = &inv.source {
                        println!("source:    {}", source);
                    }
                    if let Some(revision) = &inv.revision {
                        println!("revision:  {}", revision);
                    }
                    for digest in &inv.digests {
                        println!("digest:    {}", digest);
                    }
                    println!("objects:   {}", inv.len());
                    for obj in inv.objects() {
                        println!("  {} ({})", obj, obj.api_version());
                    }
                }
                Output::Json => {
                    let doc: serde_json::Value = serde_json::from_str(&codec::encode(&inv)?)?;
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
        }
    }

    Ok(())
}
