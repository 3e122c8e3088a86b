use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics::counter;
use polsync_client::ResourceClient;
use polsync_core::model::KvPair;
use polsync_core::options::{GetOptions, ListOptions};
use polsync_core::{Backend, Kind, Resource, Revision, WatchEvent};
use polsync_kubehub::{KubeBackend, KubeConfig};
use polsync_syncer::{
    bgp_peer_processor, ChannelCallbacks, ProfileProcessor, SyncStatus, Syncer, SyncerConfig, SyncerOutput,
};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "polsyncctl", version, about = "polsync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (cluster-scoped when omitted)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// API group serving the custom resources
    #[arg(long = "group", global = true, env = "POLSYNC_GROUP")]
    group: Option<String>,

    /// API version serving the custom resources
    #[arg(long = "api-version", global = true, env = "POLSYNC_VERSION")]
    api_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List resources of a kind
    Ls {
        /// Resource kind, e.g. "Profile" or "BGPPeer"
        kind: String,
    },
    /// Show one resource
    Get {
        kind: String,
        name: String,
    },
    /// Watch a kind and print +/~/- events
    Watch {
        kind: String,
        /// Resume after this revision instead of starting from a snapshot
        #[arg(long = "from")]
        from: Option<String>,
    },
    /// Run the syncer over Profile and BGPPeer and print the KV stream
    Sync {
        /// Start a new generation after a failure instead of exiting
        #[arg(long = "restart", action = ArgAction::SetTrue)]
        restart: bool,
        /// Delay before restarting a failed generation
        #[arg(long = "restart-delay-ms", default_value_t = 1000)]
        restart_delay_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("POLSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("POLSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid POLSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

/// Known kinds match case-insensitively; anything else is taken verbatim.
fn parse_kind(raw: &str) -> Kind {
    [Kind::PROFILE, Kind::BGP_PEER]
        .into_iter()
        .find(|k| k.as_str().eq_ignore_ascii_case(raw))
        .unwrap_or_else(|| Kind::new(raw))
}

/// Environment first, explicit flags on top.
fn kube_config(cli: &Cli) -> KubeConfig {
    let mut cfg = KubeConfig::from_env();
    if let Some(g) = cli.group.clone().filter(|s| !s.is_empty()) {
        cfg.group = g;
    }
    if let Some(v) = cli.api_version.clone().filter(|s| !s.is_empty()) {
        cfg.version = v;
    }
    cfg
}

fn client_for(backend: &Arc<dyn Backend>, kind: Kind, ns: Option<&str>) -> ResourceClient {
    let c = ResourceClient::for_kind(Arc::clone(backend), kind);
    match ns {
        Some(ns) => c.namespaced(ns),
        None => c,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let kube = KubeBackend::try_default(kube_config(&cli)).await?;
    let backend: Arc<dyn Backend> = Arc::new(kube);
    let ns = cli.namespace.as_deref();

    match &cli.command {
        Commands::Ls { kind } => {
            let kind = parse_kind(kind);
            info!(kind = %kind, ns = ?ns, "ls invoked");
            let list = client_for(&backend, kind.clone(), ns)
                .list(ListOptions::default())
                .await
                .with_context(|| format!("listing {kind}"))?;
            match cli.output {
                Output::Human => {
                    println!("{:<11} {:<28} {:<12} AGE", "NAMESPACE", "NAME", "REVISION");
                    for r in &list.items {
                        let ns_col = r.metadata.namespace.as_deref().unwrap_or("-");
                        let rev = r.revision().map(Revision::as_str).unwrap_or("-");
                        println!("{:<11} {:<28} {:<12} {}", ns_col, r.metadata.name, rev, render_age(r.metadata.creation_timestamp));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list.items)?),
            }
        }
        Commands::Get { kind, name } => {
            let kind = parse_kind(kind);
            info!(kind = %kind, name = %name, "get invoked");
            let r = client_for(&backend, kind.clone(), ns)
                .get(name, GetOptions::default())
                .await
                .with_context(|| format!("getting {kind} {name}"))?;
            match cli.output {
                Output::Human => {
                    println!("{}  rev={}", r.key(), r.revision().map(Revision::as_str).unwrap_or("-"));
                    println!("{}", serde_json::to_string_pretty(&r.spec)?);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
            }
        }
        Commands::Watch { kind, from } => {
            let kind = parse_kind(kind);
            info!(kind = %kind, from = ?from, "watch invoked");
            let opts = ListOptions { resource_version: from.clone().map(Revision::from), ..ListOptions::default() };
            let mut stream =
                client_for(&backend, kind.clone(), ns).watch(opts).await.with_context(|| format!("watching {kind}"))?;
            loop {
                tokio::select! {
                    ev = stream.next() => match ev {
                        Some(ev) => print_event(cli.output, &ev)?,
                        None => {
                            warn!("watch stream closed");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            stream.stop();
        }
        Commands::Sync { restart, restart_delay_ms } => {
            let syncer = Syncer::builder()
                .with_config(SyncerConfig::from_env())
                .register(client_for(&backend, Kind::PROFILE, ns), ProfileProcessor::new())
                .and_then(|b| b.register(client_for(&backend, Kind::BGP_PEER, ns), bgp_peer_processor()))
                .and_then(|b| b.build())
                .context("configuring syncer")?;
            run_sync(&syncer, cli.output, *restart, Duration::from_millis(*restart_delay_ms)).await?;
        }
    }

    Ok(())
}

async fn run_sync(syncer: &Syncer, output: Output, restart: bool, delay: Duration) -> Result<()> {
    loop {
        let (cb, mut rx) = ChannelCallbacks::new();
        let handle = syncer.start(Arc::new(cb))?;
        let interrupted = loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(out) => {
                        let ended = matches!(out, SyncerOutput::Status(SyncStatus::Error | SyncStatus::Idle));
                        print_output(output, &out)?;
                        if ended {
                            break false;
                        }
                    }
                    None => break false,
                },
                _ = signal::ctrl_c() => {
                    info!("Ctrl-C received; stopping syncer");
                    break true;
                }
            }
        };
        if interrupted {
            return handle.stop_and_wait().await.context("stopping syncer");
        }
        match handle.wait().await {
            Ok(()) => return Ok(()),
            Err(e) if restart => {
                error!(error = %e, delay_ms = delay.as_millis() as u64, "sync generation failed; restarting");
                counter!("cli_sync_restarts_total", 1u64);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("sync generation failed"),
        }
    }
}

fn print_event(output: Output, ev: &WatchEvent) -> Result<()> {
    if output == Output::Json {
        #[derive(serde::Serialize)]
        struct Row<'a> {
            #[serde(rename = "type")]
            kind: String,
            object: Option<&'a Resource>,
            revision: Option<&'a Revision>,
        }
        let row = Row { kind: format!("{:?}", ev.event_type()), object: ev.object().or(ev.previous()), revision: ev.revision() };
        println!("{}", serde_json::to_string(&row)?);
        return Ok(());
    }
    match ev {
        WatchEvent::Added(r) => println!("+ {}", r.key()),
        WatchEvent::Modified { object, .. } => println!("~ {}", object.key()),
        WatchEvent::Deleted { previous, .. } => println!("- {}", previous.key()),
        WatchEvent::Error(e) => eprintln!("! {e}"),
    }
    Ok(())
}

fn print_output(output: Output, out: &SyncerOutput) -> Result<()> {
    match (output, out) {
        (Output::Human, SyncerOutput::Status(s)) => eprintln!("status: {s}"),
        (Output::Human, SyncerOutput::InitialBatch(batch)) => {
            eprintln!("initial batch: {} keys", batch.len());
            for kv in batch {
                print_pair(kv)?;
            }
        }
        (Output::Human, SyncerOutput::Update(kv)) => print_pair(kv)?,
        (Output::Json, SyncerOutput::Status(s)) => println!("{}", serde_json::json!({ "status": s.to_string() })),
        (Output::Json, SyncerOutput::InitialBatch(batch)) => println!("{}", serde_json::json!({ "initial": batch })),
        (Output::Json, SyncerOutput::Update(kv)) => println!("{}", serde_json::json!({ "update": kv })),
    }
    Ok(())
}

fn print_pair(kv: &KvPair) -> Result<()> {
    match &kv.value {
        Some(v) => println!("+ {} {}", kv.key, serde_json::to_string(v)?),
        None => println!("- {}", kv.key),
    }
    Ok(())
}

fn render_age(created: Option<DateTime<Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_ignore_case() {
        assert_eq!(parse_kind("bgppeer"), Kind::BGP_PEER);
        assert_eq!(parse_kind("PROFILE"), Kind::PROFILE);
        assert_eq!(parse_kind("NetworkSet").as_str(), "NetworkSet");
    }

    #[test]
    fn age_is_compact() {
        assert_eq!(render_age(None), "-");
        let created = Utc::now() - chrono::Duration::seconds(3 * 3600 + 5 * 60);
        assert_eq!(render_age(Some(created)), "3h5m");
    }

    #[test]
    fn flags_override_env_defaults() {
        let cli = Cli::parse_from(["polsyncctl", "--group", "example.org", "ls", "Profile"]);
        let cfg = kube_config(&cli);
        assert_eq!(cfg.group, "example.org");
        assert!(matches!(cli.command, Commands::Ls { .. }));
    }
}
