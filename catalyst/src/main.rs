use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use catalyst_core::bus::{ClusterBus, InMemoryBus, RedisBus};
use catalyst_core::config::Config;
use catalyst_core::directory::{NullDirectory, StreamDirectory};
use catalyst_core::intake::{spawn_dispatcher, NoopForwardedEventHandler};
use catalyst_core::lease::LeaseManager;
use catalyst_core::logging::init_logging;
use catalyst_core::ratelimit::DirectoryLookupLimiter;
use catalyst_core::registry::{Node, NodeRegistry, RegistryTimeouts};
use catalyst_core::stats::{HttpStreamsCollector, ProcSystemStatsCollector};
use catalyst_core::telemetry::TelemetryPublisher;

use catalyst_http::AppState;

#[derive(Parser, Debug)]
#[command(name = "catalyst", about = "Playback request router and origin-discovery core")]
struct Cli {
    /// Path to a YAML config file; CATALYST_-prefixed env vars always win.
    #[arg(long, env = "CATALYST_CONFIG")]
    config: Option<String>,
}

/// Prefers the POD_NAME environment variable (set by Kubernetes' downward
/// API) for stable node identity; falls back to hostname + local IP + a
/// random suffix for bare-metal and local runs.
fn generate_node_id() -> String {
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        if !pod_name.is_empty() {
            return pod_name;
        }
    }

    use std::net::UdpSocket;

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let local_ip = UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.ip().to_string());

    let suffix = nanoid::nanoid!(6);
    format!("{hostname}_{local_ip}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration.
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if config.node.name.is_empty() {
        config.node.name = generate_node_id();
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        anyhow::bail!("{} configuration error(s)", errors.len());
    }
    let config = Arc::new(config);

    // 2. Logging.
    init_logging(&config.logging).context("initializing logging")?;
    info!(node = %config.node.name, http = %config.server.http_address(), "catalyst starting");

    let cancel_token = CancellationToken::new();
    let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    let self_node = Node {
        name: config.node.name.clone(),
        tags: std::collections::HashMap::new(),
    };

    // 3. Cluster bus: Redis-backed for real fleets, in-memory loopback for
    // single-node deployments and local runs.
    let (bus, bus_events): (Arc<dyn ClusterBus>, tokio::sync::broadcast::Receiver<catalyst_core::bus::BusEvent>) =
        if config.cluster.redis_url.is_empty() {
            let (inner, rx) = InMemoryBus::new(self_node.clone());
            (Arc::new(inner), rx)
        } else {
            let heartbeat_ttl = Duration::from_secs(config.cluster.heartbeat_ttl_secs.max(1));
            let redis_bus = RedisBus::new(&config.cluster.redis_url, self_node.clone(), heartbeat_ttl)
                .context("constructing redis cluster bus")?;
            let rx = redis_bus.subscribe();
            background.extend(redis_bus.start());
            (redis_bus, rx)
        };

    // 4. Node registry + event intake dispatcher.
    let registry = NodeRegistry::new(RegistryTimeouts {
        metric_timeout: Duration::from_secs(config.timeouts.metric_timeout_secs),
        ingest_stream_timeout: Duration::from_secs(config.timeouts.ingest_stream_timeout_secs),
    });
    background.push(spawn_dispatcher(
        registry.clone(),
        bus_events,
        Arc::new(NoopForwardedEventHandler),
        cancel_token.clone(),
    ));

    // 5. External stream directory: only meaningful with a pull lease store
    // configured; push-only fleets run with no directory at all.
    let directory: Arc<dyn StreamDirectory> = if config.cluster.redis_url.is_empty() {
        Arc::new(NullDirectory)
    } else {
        match LeaseManager::new(&config.cluster.redis_url) {
            Ok(_leases) => {
                // No external StreamLookup is wired in this deployment shape
                // yet; fall back to NullDirectory rather than guessing at an
                // undocumented lookup endpoint.
                warn!("no stream lookup source configured, pull arbitration runs in push-only mode");
                Arc::new(NullDirectory)
            }
            Err(e) => {
                warn!(error = %e, "failed to initialize pull lease manager, running push-only");
                Arc::new(NullDirectory)
            }
        }
    };

    // 6. Telemetry publisher: samples this node's own CPU/RAM/load and
    // active-stream lists, broadcasting both on independent tickers.
    let stats_collector = ProcSystemStatsCollector::new(config.node.lat, config.node.lon);
    let http_client = reqwest::Client::new();
    let streams_collector = HttpStreamsCollector::new(
        http_client.clone(),
        &config.media_server.base_url,
        &config.media_server.streams_path,
    );
    let publisher = TelemetryPublisher::new(
        config.node.name.clone(),
        bus.clone(),
        stats_collector,
        streams_collector,
        Duration::from_secs(config.timeouts.update_node_stats_every_secs.max(1)),
        Duration::from_secs(config.timeouts.update_streams_every_secs.max(1)),
    );
    background.extend(publisher.start(cancel_token.clone()));

    // 7. Keep membership current from the bus's own view, independent of the
    // telemetry/event loops above.
    background.push(spawn_membership_refresh(
        registry.clone(),
        bus.clone(),
        cancel_token.clone(),
    ));

    // 8. Build the HTTP router and serve it.
    let state = AppState {
        registry,
        bus,
        directory,
        config: config.clone(),
        http_client,
        lookup_limiter: Arc::new(DirectoryLookupLimiter::new(Duration::from_secs(
            config.timeouts.directory_lookup_rate_limit_secs,
        ))),
    };
    let router = catalyst_http::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.http_address())
        .await
        .context("binding http listener")?;
    info!(address = %config.server.http_address(), "listening");

    let serve_cancel = cancel_token.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        serve_cancel.cancelled().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                warn!(error = %e, "http server exited with error");
            }
        }
        () = shutdown_signal() => {
            info!("shutdown signal received, draining background tasks");
            cancel_token.cancel();
        }
    }

    cancel_token.cancel();
    for handle in background {
        let _ = handle.await;
    }
    info!("catalyst stopped");
    Ok(())
}

/// Polls the cluster bus's own membership view into the registry. Distinct
/// from the event-driven intake dispatcher: this is the periodic
/// reconciliation pass that catches membership changes the gossip layer
/// didn't (or couldn't) push as an event.
fn spawn_membership_refresh(
    registry: NodeRegistry,
    bus: Arc<dyn ClusterBus>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => return,
                _ = ticker.tick() => {
                    match bus.members().await {
                        Ok(members) => registry.replace_membership(members),
                        Err(e) => warn!(error = %e, "failed to refresh membership, keeping previous view"),
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C"),
            Err(e) => warn!(error = %e, "failed to install Ctrl+C handler"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("received SIGTERM");
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
