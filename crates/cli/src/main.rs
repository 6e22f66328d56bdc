use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info};

use funk_cluster::{ClusterClient, KubeCluster, LogOptions};
use funk_invoke::Invoker;
use funk_manifest::TriggerBinder;
use funk_reconcile::{Deployer, ReconcileConfig, ReconcileState};
use funk_spec::DeploymentSpec;

#[derive(Parser, Debug)]
#[command(name = "funkctl", version, about = "funk CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: "default", or the deployment file's)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a deployment file and wait for every function to converge
    Deploy {
        /// Path to a funk deployment YAML file
        file: String,
    },
    /// Show the reconcile state of one function
    Info {
        name: String,
    },
    /// Remove a function's resources (trigger first, then the function)
    Remove {
        name: String,
    },
    /// Invoke a ready function over its resolved endpoint
    Invoke {
        name: String,
        /// JSON payload; omitting it sends a GET
        #[arg(long = "data")]
        data: Option<String>,
    },
    /// Stream logs from a function's backing instances
    Logs {
        name: String,
        /// Keep the stream open and follow new lines
        #[arg(short = 'f', long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
        /// Tail last n lines
        #[arg(long = "tail")]
        tail: Option<i64>,
    },
}

fn init_tracing() {
    let env = std::env::var("FUNK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FUNK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FUNK_METRICS_ADDR; expected host:port");
        }
    }
}

async fn deployer_for(namespace: &str) -> Result<Deployer> {
    let client = kube::Client::try_default().await.context("loading kube client from environment")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(client, namespace));
    Ok(Deployer::with_config(cluster, TriggerBinder::all(), namespace, ReconcileConfig::from_env()))
}

fn print_state(state: &ReconcileState, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {}", state.name, state.phase);
            if let Some(ep) = &state.endpoint {
                println!("{:<20} endpoint: {}", "", ep);
            }
            if let Some(f) = &state.failure {
                println!("{:<20} failed in {}: {}", "", f.phase, f.message);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(state)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Deploy { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let mut spec: DeploymentSpec = serde_yaml::from_str(&text).with_context(|| format!("parsing {file}"))?;
            if let Some(ns) = &cli.namespace {
                spec.namespace = ns.clone();
            }
            info!(file = %file, ns = %spec.namespace, functions = spec.functions.len(), "deploy invoked");
            let deployer = deployer_for(&spec.namespace).await?;
            match deployer.submit(&spec).await {
                Ok(states) => {
                    match cli.output {
                        Output::Human => {
                            for s in &states {
                                print_state(s, Output::Human)?;
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&states)?),
                    }
                    if states.iter().any(|s| s.failure.is_some()) {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    error!(error = %e, "deploy failed");
                    eprintln!("deploy error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Info { name } => {
            let ns = cli.namespace.as_deref().unwrap_or("default");
            let deployer = deployer_for(ns).await?;
            match deployer.status(&name).await {
                Ok(state) => print_state(&state, cli.output)?,
                Err(e) => {
                    eprintln!("info error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Remove { name } => {
            let ns = cli.namespace.as_deref().unwrap_or("default");
            info!(function = %name, ns = %ns, "remove invoked");
            let deployer = deployer_for(ns).await?;
            match deployer.remove(&name).await {
                Ok(()) => println!("{name} removed"),
                Err(e) => {
                    error!(error = %e, function = %name, "remove failed");
                    eprintln!("remove error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Invoke { name, data } => {
            let ns = cli.namespace.as_deref().unwrap_or("default");
            let payload = match data.as_deref() {
                Some(text) => Some(serde_json::from_str(text).context("parsing --data as JSON")?),
                None => None,
            };
            let deployer = deployer_for(ns).await?;
            let state = match deployer.status(&name).await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("invoke error: {e}");
                    std::process::exit(1);
                }
            };
            let invoker = Invoker::new().map_err(|e| anyhow::anyhow!("{e}"))?;
            match invoker.invoke(&state, payload.as_ref()).await {
                Ok(res) => match cli.output {
                    Output::Human => println!("{}", res.body),
                    Output::Json => println!(
                        "{}",
                        serde_json::json!({ "status": res.status, "body": res.body })
                    ),
                },
                Err(e) => {
                    eprintln!("invoke error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Logs { name, follow, tail } => {
            let ns = cli.namespace.as_deref().unwrap_or("default");
            let deployer = deployer_for(ns).await?;
            let opts = LogOptions { follow, tail_lines: tail, since_seconds: None };
            let mut handle = match deployer.stream_logs(&name, opts).await {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("logs error: {e}");
                    std::process::exit(1);
                }
            };
            loop {
                tokio::select! {
                    maybe = handle.rx.recv() => {
                        match maybe {
                            Some(line) => println!("{}", line.line),
                            None => break,
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; closing log stream");
                        handle.cancel.cancel();
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
