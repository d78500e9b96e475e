use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use fleet_api::{DeploymentPlan, LifecycleClient, MockSynchronizer};
use fleet_appcontext::AppContext;
use fleet_core::{Config, Scope};
use fleet_persist::{ContextDb, DocStore, SqliteStore};
use fleet_state::{LifecycleEvent, StateClient};
use fleet_status::{Aggregator, OutputMode, StatusQuery, StatusType};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fleetctl", version, about = "Fleet CLI: inspect contexts, lifecycle logs and status")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite file holding documents and contexts
    #[arg(long = "db", global = true, env = "FLEET_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum KeyKind { Dig, LogicalCloud, Cluster, CaCertProvider, CaCertLc }

#[derive(Args, Debug)]
struct KeyArgs {
    /// Kind of managed resource
    #[arg(value_enum)]
    kind: KeyKind,
    /// Slash separated path, e.g. "proj/app/v1/dig" or "provider/cluster"
    path: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum TypeArg { Ready, Deployed, Rsync, Cluster }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg { Summary, All, Detail }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum EventArg { Instantiate, Terminate }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Action { Instantiate, Update, Terminate }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored contexts with their status
    Contexts,
    /// Dump the handles of one context
    Handles {
        context_id: String,
        /// Print stored values next to handles
        #[arg(long = "values", action = ArgAction::SetTrue)]
        values: bool,
    },
    /// Show the lifecycle log of a resource
    State {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Query aggregated status of a resource
    Status {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Ready)]
        status_type: TypeArg,
        #[arg(long = "mode", value_enum, default_value_t = ModeArg::All)]
        mode: ModeArg,
        /// Historical context id to report on
        #[arg(long = "instance")]
        instance: Option<String>,
        #[arg(long = "app")]
        apps: Vec<String>,
        /// Cluster filter, "provider+cluster"
        #[arg(long = "cluster")]
        clusters: Vec<String>,
        #[arg(long = "resource")]
        resources: Vec<String>,
    },
    /// Check whether a lifecycle event is allowed now. Instantiating over a
    /// terminated context deletes that context.
    Verify {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(value_enum)]
        event: EventArg,
    },
    /// Run a lifecycle flow against a local synchronizer that reports every
    /// resource as applied
    Simulate {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(value_enum)]
        action: Action,
        /// Deployment plan (YAML or JSON); required for instantiate and update
        #[arg(long = "plan")]
        plan: Option<std::path::PathBuf>,
    },
    /// Check that the store answers
    Health,
}

fn init_tracing() {
    let env = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(cfg: &Config) {
    if let Some(addr) = &cfg.metrics_addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FLEET_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_scope(kind: KeyKind, path: &str) -> Result<Scope> {
    let parts: Vec<String> = path.split('/').map(str::to_string).collect();
    if parts.iter().any(String::is_empty) {
        bail!("empty path element in {:?}", path);
    }
    let scope = match (kind, parts.as_slice()) {
        (KeyKind::Dig, [project, composite_app, version, dig]) => Scope::DeploymentIntentGroup {
            project: project.clone(),
            composite_app: composite_app.clone(),
            version: version.clone(),
            deployment_intent_group: dig.clone(),
        },
        (KeyKind::LogicalCloud, [project, lc]) => Scope::LogicalCloud { project: project.clone(), logical_cloud: lc.clone() },
        (KeyKind::Cluster, [provider, cluster]) => Scope::Cluster { cluster_provider: provider.clone(), cluster: cluster.clone() },
        (KeyKind::CaCertProvider, [provider, cert]) => Scope::CaCertClusterProvider { cluster_provider: provider.clone(), cert: cert.clone() },
        (KeyKind::CaCertLc, [project, cert]) => Scope::CaCertLogicalCloud { project: project.clone(), cert: cert.clone() },
        _ => bail!("path {:?} does not fit a {:?} key", path, kind),
    };
    Ok(scope)
}

fn read_plan(path: &std::path::Path) -> Result<DeploymentPlan> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading plan {}", path.display()))?;
    let plan = serde_yaml::from_str(&raw).with_context(|| format!("decoding plan {}", path.display()))?;
    Ok(plan)
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn context_ids(db: &dyn ContextDb) -> Result<BTreeSet<String>> {
    let keys = db.keys(fleet_appcontext::handle::CONTEXT_PREFIX)?;
    Ok(keys.iter().filter_map(|k| k.split('/').nth(2)).filter(|s| !s.is_empty()).map(str::to_string).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(db) = cli.db.clone() {
        cfg.db_path = db;
    }
    init_metrics(&cfg);

    let store = Arc::new(SqliteStore::open(&cfg.db_path)?);
    let docs: Arc<dyn DocStore> = store.clone();
    let contexts: Arc<dyn ContextDb> = store.clone();
    info!(db = %cfg.db_path, "store opened");

    match cli.command {
        Commands::Contexts => {
            let ids = context_ids(contexts.as_ref())?;
            let rows: Vec<(String, String)> = ids
                .into_iter()
                .map(|id| {
                    let status = fleet_state::app_context_status(&contexts, &id).map(|s| s.status.to_string()).unwrap_or_else(|_| "-".to_string());
                    (id, status)
                })
                .collect();
            match cli.output {
                Output::Human => {
                    println!("{:<34} STATUS", "CONTEXT");
                    for (id, status) in rows {
                        println!("{:<34} {}", id, status);
                    }
                }
                Output::Json => {
                    let items: Vec<_> = rows.iter().map(|(id, status)| serde_json::json!({"contextId": id, "status": status})).collect();
                    print_json(&items)?;
                }
            }
        }
        Commands::Handles { context_id, values } => {
            let ac = AppContext::open(contexts.clone(), &context_id)?;
            let handles = ac.all_handles(ac.root()?)?;
            match cli.output {
                Output::Human => {
                    for h in handles {
                        if values {
                            let v = ac.get_value(&h).map(|v| v.to_string()).unwrap_or_default();
                            println!("{}  {}", h, v);
                        } else {
                            println!("{}", h);
                        }
                    }
                }
                Output::Json => {
                    let mut out = serde_json::Map::new();
                    for h in handles {
                        out.insert(h.to_string(), ac.get_value(&h).unwrap_or(serde_json::Value::Null));
                    }
                    print_json(&out)?;
                }
            }
        }
        Commands::State { key } => {
            let scope = parse_scope(key.kind, &key.path)?;
            let s = StateClient::new(docs, contexts, scope).get()?;
            match cli.output {
                Output::Human => {
                    println!("status context: {}", s.status_context_id().unwrap_or("-"));
                    println!("{:<5} {:<18} {:<34} TIME", "REV", "STATE", "CONTEXT");
                    for a in &s.actions {
                        let ctx = if a.context_id.is_empty() { "-" } else { a.context_id.as_str() };
                        println!("{:<5} {:<18} {:<34} {}", a.revision, a.state, ctx, a.time_stamp);
                    }
                }
                Output::Json => print_json(&s)?,
            }
        }
        Commands::Status { key, status_type, mode, instance, apps, clusters, resources } => {
            let scope = parse_scope(key.kind, &key.path)?;
            let status_type = match status_type {
                TypeArg::Ready => StatusType::Ready,
                TypeArg::Deployed => StatusType::Deployed,
                TypeArg::Rsync => StatusType::Rsync,
                TypeArg::Cluster => StatusType::Cluster,
            };
            let mode = match mode {
                ModeArg::Summary => OutputMode::Summary,
                ModeArg::All => OutputMode::All,
                ModeArg::Detail => OutputMode::Detail,
            };
            let q = StatusQuery { instance, apps, clusters, resources, ..StatusQuery::new(status_type, mode) };
            let s = StateClient::new(docs, contexts.clone(), scope.clone()).get()?;
            let mut r = Aggregator::new(contexts).status(&s, &q)?;
            r.name = scope.name().to_string();
            match cli.output {
                Output::Human => {
                    let value = r.context_status().map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                    println!("{} {}: {}", scope.kind(), scope.name(), value);
                    if let Some(ready) = r.ready_status {
                        println!("ready: {}", ready);
                    }
                    for (k, n) in r.deployment_counts().iter().chain(r.readiness_counts().iter()) {
                        println!("  {:<14} {}", k, n);
                    }
                    for app in &r.apps {
                        for c in &app.clusters {
                            for res in &c.resources {
                                let state = res.readiness().or(res.deployment()).unwrap_or("-");
                                println!("{:<16} {}+{:<20} {:<12} {:<28} {}", app.name, c.cluster_provider, c.cluster, res.gvk.kind, res.name, state);
                            }
                        }
                    }
                }
                Output::Json => print_json(&r)?,
            }
        }
        Commands::Verify { key, event } => {
            let scope = parse_scope(key.kind, &key.path)?;
            let event = match event {
                EventArg::Instantiate => LifecycleEvent::Instantiate,
                EventArg::Terminate => LifecycleEvent::Terminate,
            };
            let state = StateClient::new(docs, contexts, scope);
            match state.verify_state(event) {
                Ok(ctx) => match cli.output {
                    Output::Human => println!("{} allowed (context: {})", event, ctx.as_deref().unwrap_or("-")),
                    Output::Json => print_json(&serde_json::json!({"allowed": true, "contextId": ctx}))?,
                },
                Err(e) => match cli.output {
                    Output::Human => {
                        println!("{} refused: {}", event, e);
                        std::process::exit(1);
                    }
                    Output::Json => {
                        print_json(&serde_json::json!({"allowed": false, "code": e.code(), "error": e.to_string()}))?;
                        std::process::exit(1);
                    }
                },
            }
        }
        Commands::Simulate { key, action, plan } => {
            let scope = parse_scope(key.kind, &key.path)?;
            let sync = Arc::new(MockSynchronizer::new(contexts.clone()));
            let client = LifecycleClient::new(docs, contexts, sync, &cfg);
            if let Err(e) = client.state(&scope).get() {
                if e.is_not_found() {
                    client.create(&scope)?;
                } else {
                    return Err(e.into());
                }
            }
            let need_plan = || -> Result<DeploymentPlan> {
                let path = plan.as_deref().context("--plan is required for this action")?;
                read_plan(path)
            };
            let ctx = match action {
                Action::Instantiate => Some(client.instantiate(&scope, &need_plan()?).await?),
                Action::Update => Some(client.update(&scope, &need_plan()?).await?),
                Action::Terminate => {
                    client.terminate(&scope).await?;
                    None
                }
            };
            match cli.output {
                Output::Human => println!("{:?} done{}", action, ctx.map(|c| format!(" (context: {})", c)).unwrap_or_default()),
                Output::Json => print_json(&serde_json::json!({"action": format!("{:?}", action).to_lowercase(), "contextId": ctx}))?,
            }
        }
        Commands::Health => {
            contexts.health_check()?;
            println!("ok");
        }
    }
    Ok(())
}
