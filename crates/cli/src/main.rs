use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use oam_apply::{departures, ApplyConfig, ApplyError, ScopeJoin, WorkloadApplicator, Workloads};
use oam_core::{Document, Workload, WorkloadStatus};
use oam_kubehub::KubeStore;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "oamctl", version, about = "Apply OAM workloads, traits and scope memberships")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for every object in the pass file (default: as written in the file)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one apply pass against the current kube context
    Apply {
        /// YAML file with `workloads` and optional prior `status`
        file: PathBuf,
        /// Join the first attached scope only, or all of them
        #[arg(long = "scope-join", env = "OAM_SCOPE_JOIN")]
        scope_join: Option<ScopeJoin>,
        /// Server-side apply field manager
        #[arg(long = "field-manager", env = "OAM_FIELD_MANAGER")]
        field_manager: Option<String>,
        /// Per-call timeout in milliseconds (0 disables)
        #[arg(long = "timeout-ms", env = "OAM_CALL_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
    },
    /// Print the scope departures a pass would perform, without writing
    Departures {
        file: PathBuf,
    },
    /// Resolve each trait's workload reference path from its definition
    Definition {
        file: PathBuf,
    },
}

/// Input of one pass.
#[derive(Debug, Deserialize)]
struct PassFile {
    #[serde(default)]
    status: Vec<WorkloadStatus>,
    workloads: Vec<Workload>,
}

fn init_tracing() {
    let env = std::env::var("OAM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OAM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid OAM_METRICS_ADDR; expected host:port");
        }
    }
}

fn set_namespace(doc: &mut Document, ns: &str) {
    if let Some(obj) = doc.0.as_object_mut() {
        let meta = obj.entry("metadata").or_insert(serde_json::json!({}));
        if let Some(m) = meta.as_object_mut() {
            m.insert("namespace".into(), serde_json::Value::String(ns.to_string()));
        }
    }
}

fn load_pass(path: &Path, ns_override: Option<&str>) -> Result<PassFile> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_pass(&raw, ns_override).with_context(|| format!("parsing {}", path.display()))
}

fn parse_pass(raw: &str, ns_override: Option<&str>) -> Result<PassFile> {
    let mut pass: PassFile = serde_yaml::from_str(raw)?;
    if let Some(ns) = ns_override {
        for wl in pass.workloads.iter_mut() {
            set_namespace(&mut wl.workload, ns);
            wl.traits.iter_mut().chain(wl.scopes.iter_mut()).for_each(|d| set_namespace(d, ns));
        }
    }
    Ok(pass)
}

/// Cancel the pass on Ctrl-C; in-flight scope writes either land whole or not at all.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling apply pass");
            token.cancel();
        }
    });
    cancel
}

fn exit_code(err: &ApplyError) -> i32 {
    if err.is_cancelled() {
        130
    } else if err.is_transient() {
        // EX_TEMPFAIL: re-run the pass
        75
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Apply { file, scope_join, field_manager, timeout_ms } => {
            let pass = load_pass(&file, ns)?;
            let mut cfg = ApplyConfig::from_env();
            if let Some(j) = scope_join { cfg.scope_join = j; }
            if let Some(fm) = field_manager { cfg.apply.field_manager = fm; }
            if let Some(ms) = timeout_ms {
                cfg.call_timeout = if ms == 0 { None } else { Some(Duration::from_millis(ms)) };
            }
            info!(file = %file.display(), workloads = pass.workloads.len(), scope_join = ?cfg.scope_join, "apply invoked");

            let store = KubeStore::try_default().await?;
            let app = Workloads::new(store.clone(), store, cfg);
            let cancel = cancel_on_ctrl_c();
            match app.apply(&cancel, &pass.status, &pass.workloads).await {
                Ok(summary) => match cli.output {
                    Output::Human => {
                        println!("workloads applied:  {}", summary.workloads_applied);
                        println!("traits applied:     {} ({} stamped)", summary.traits_applied, summary.traits_stamped);
                        println!("scopes joined:      {} ({} already member)", summary.scopes_joined, summary.joins_skipped);
                        if summary.scopes_unprocessed > 0 {
                            println!("scopes not joined:  {} (scope-join=first)", summary.scopes_unprocessed);
                        }
                        println!("scopes left:        {} ({} already gone)", summary.scopes_left, summary.leaves_skipped);
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                },
                Err(e) => {
                    let code = exit_code(&e);
                    let retry = if e.is_transient() { " (retryable)" } else { "" };
                    eprintln!("apply error{}: {:#}", retry, anyhow::Error::new(e));
                    std::process::exit(code);
                }
            }
        }
        Commands::Departures { file } => {
            let pass = load_pass(&file, ns)?;
            let out = departures(&pass.status, &pass.workloads);
            match cli.output {
                Output::Human => {
                    if out.is_empty() { println!("no scope departures"); }
                    for d in &out {
                        println!("{} leaves {}", d.workload, d.scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Definition { file } => {
            let pass = load_pass(&file, ns)?;
            let store = KubeStore::try_default().await?;
            let app = Workloads::new(store.clone(), store, ApplyConfig::from_env());
            let cancel = cancel_on_ctrl_c();
            let mut rows = Vec::new();
            for wl in &pass.workloads {
                for t in &wl.traits {
                    let path = app.workload_ref_path(&cancel, t).await?;
                    rows.push(serde_json::json!({
                        "trait": t.typed_reference(),
                        "workload": wl.reference(),
                        "workloadRefPath": path,
                    }));
                    if cli.output == Output::Human {
                        println!("{} -> {}", t.typed_reference(), path.as_deref().unwrap_or("-"));
                    }
                }
            }
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
    }
    Ok(())
}
