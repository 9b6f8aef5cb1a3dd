mod analytics;
mod config;
mod models;
mod monitor;
mod protection;
mod proxy;
mod storage;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analytics::alerting::{AlertEvent, AlertManager};
use crate::analytics::retention::RetentionSweeper;
use crate::config::settings::{LoggingConfig, ProtocolConfig, Settings};
use crate::config::validation::{build_count_rules, build_rules, resolve_forward, validate_bandwidth};
use crate::models::protocol::Protocol;
use crate::monitor::backpressure::{AcceptFlag, BackpressureController};
use crate::monitor::bandwidth::BandwidthMonitor;
use crate::monitor::counters::SystemCounters;
use crate::protection::admission::{AccessPolicy, AdmissionGate};
use crate::protection::brute_force::BruteForceCounter;
use crate::protection::geoip::{CachedGeo, GeoLookup, MaxMindGeo};
use crate::proxy::group::ServerGroup;
use crate::proxy::listener::family_supported;
use crate::proxy::server::ServerContext;
use crate::storage::ban_cache::BanCache;
use crate::storage::sqlite::SqliteStore;

/// Parse the `--config` CLI flag. Defaults to `/etc/bastion-gate/bastion-gate.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from("/etc/bastion-gate/bastion-gate.toml");

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            if let Some(path) = args.get(i + 1) {
                config_path = path.clone();
            }
            i += 2;
        } else {
            i += 1;
        }
    }

    config_path
}

/// Stdout plus a non-blocking file writer. The returned guard flushes the
/// file on drop and must live until exit.
fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    let path = Path::new(&logging.file);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("bastion-gate.log");
    std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},bastion_gate=debug", logging.level)))
        .context("invalid [logging].level filter")?;

    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(true);

    let (json_file, plain_file) = if logging.json {
        let layer = fmt::layer().json().with_writer(file_writer).with_target(true);
        (Some(layer), None)
    } else {
        let layer = fmt::layer().with_writer(file_writer).with_ansi(false).with_target(true);
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(json_file)
        .with(plain_file)
        .init();

    Ok(guard)
}

/// Shared pieces every protocol group is built from.
struct Shared {
    store: Arc<SqliteStore>,
    bans: Arc<BanCache>,
    geo: Arc<dyn GeoLookup>,
    alerts: Arc<AlertManager>,
    unresolved_isp_markers: Vec<String>,
    ipv4_supported: bool,
    ipv6_supported: bool,
}

fn build_group(
    protocol: Protocol,
    cfg: &ProtocolConfig,
    settings: &Settings,
    shared: &Shared,
    accept: Arc<AcceptFlag>,
) -> Result<Arc<ServerGroup>> {
    let section = protocol.as_str();
    let policy = AccessPolicy {
        rules: build_rules(&cfg.rules).with_context(|| format!("[{}] rules", section))?,
        default_banned: cfg.default_banned,
        always_allow_intranet: cfg.always_allow_intranet,
        always_allow_loopback: cfg.always_allow_loopback,
    };

    let is_ssh = protocol == Protocol::Ssh;
    let count_rules = if is_ssh {
        build_count_rules(&cfg.count_rules).with_context(|| format!("[{}] count_rules", section))?
    } else {
        Vec::new()
    };

    let forwards = cfg
        .forward
        .iter()
        .map(resolve_forward)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("[{}] forward", section))?;

    let brute_force = is_ssh.then(|| BruteForceCounter::new(shared.store.clone(), shared.bans.clone()));
    let gate = AdmissionGate::new(
        protocol,
        policy,
        shared.store.clone(),
        shared.geo.clone(),
        brute_force,
        shared.unresolved_isp_markers.clone(),
    );

    let ctx = Arc::new(ServerContext {
        protocol,
        gate: Arc::new(gate),
        store: shared.store.clone(),
        alerts: shared.alerts.clone(),
        accept: (!is_ssh).then(|| accept.clone()),
        count_rules,
        connect_timeout: Duration::from_millis(settings.server.connect_timeout_ms),
        shutdown_grace: Duration::from_secs(settings.server.shutdown_grace_secs),
        proxy_header_timeout: Duration::from_millis(settings.server.proxy_header_timeout_ms),
        ipv4_supported: shared.ipv4_supported,
        ipv6_supported: shared.ipv6_supported,
    });

    info!(protocol = %protocol, forwards = forwards.len(), "Server group configured");
    Ok(Arc::new(ServerGroup::new(forwards, ctx, accept)))
}

/// Evicts expired entries from the in-process ban and geo caches.
async fn cleanup_loop(bans: Arc<BanCache>, geo: Arc<CachedGeo>, token: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                bans.cleanup();
                geo.cleanup();
            }
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("installing Ctrl+C handler")?;
                info!("Received SIGINT");
            }
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("installing Ctrl+C handler")?;
        info!("Received SIGINT");
    }

    Ok(())
}

async fn join_background(name: &'static str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        if e.is_panic() {
            error!(task = name, "Background task panicked");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let config_path = parse_config_path();
    let settings = Settings::load(&config_path)?;

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    let _log_guard = init_tracing(&settings.logging)?;

    info!("Starting bastion-gate forwarding proxy");
    info!("Config loaded from {}", config_path);

    validate_bandwidth(&settings.bandwidth).context("[bandwidth]")?;

    // ---------------------------------------------------------------
    // 3. Storage
    // ---------------------------------------------------------------
    let store = Arc::new(
        SqliteStore::new(&settings.storage.sqlite_path)
            .with_context(|| format!("opening SQLite store at {}", settings.storage.sqlite_path))?,
    );
    let bans = Arc::new(BanCache::new());

    info!("Storage layer initialised");

    // ---------------------------------------------------------------
    // 4. Geo lookup and alerting
    // ---------------------------------------------------------------
    let geo = Arc::new(CachedGeo::new(
        Arc::new(MaxMindGeo::new(&settings.geoip.city_db, &settings.geoip.asn_db)),
        Duration::from_secs(settings.geoip.cache_ttl_secs),
    ));

    let alerts = Arc::new(AlertManager::new(
        settings.alerting.webhook_url.clone(),
        settings.alerting.enabled,
        settings.alerting.quiet,
    ));
    if settings.alerting.enabled {
        info!("Alerting enabled");
    } else {
        info!("Alerting disabled");
    }

    // ---------------------------------------------------------------
    // 5. Bandwidth monitor
    // ---------------------------------------------------------------
    let monitor = Arc::new(
        BandwidthMonitor::new(settings.bandwidth.clone(), store.clone(), Arc::new(SystemCounters::new()))
            .context("initialising bandwidth monitor")?,
    );

    // ---------------------------------------------------------------
    // 6. Server groups
    // ---------------------------------------------------------------
    let shared = Shared {
        store: store.clone(),
        bans: bans.clone(),
        geo: geo.clone(),
        alerts: alerts.clone(),
        unresolved_isp_markers: settings.geoip.unresolved_isp_markers.clone(),
        ipv4_supported: family_supported(false),
        ipv6_supported: family_supported(true),
    };
    info!(
        ipv4 = shared.ipv4_supported,
        ipv6 = shared.ipv6_supported,
        "Address family support detected"
    );

    let tcp_accept = Arc::new(AcceptFlag::new());
    let tcp_group = build_group(Protocol::Tcp, &settings.tcp, &settings, &shared, tcp_accept.clone())?;
    let ssh_group = build_group(Protocol::Ssh, &settings.ssh, &settings, &shared, Arc::new(AcceptFlag::new()))?;

    let backpressure = if monitor.is_enabled() {
        let rx = monitor.add_subscriber("tcp").context("subscribing TCP group to bandwidth")?;
        let controller = BackpressureController::new(&settings.bandwidth, tcp_accept, alerts.clone());
        Some((controller, rx))
    } else {
        None
    };

    // ---------------------------------------------------------------
    // 7. Start everything
    // ---------------------------------------------------------------
    monitor.start();
    tcp_group.start(backpressure).await;
    ssh_group.start(None).await;

    let background = CancellationToken::new();
    let cleanup_handle = tokio::spawn(cleanup_loop(bans.clone(), geo.clone(), background.clone()));
    let retention = RetentionSweeper::new(&settings.retention, store.clone());
    let retention_token = background.clone();
    let retention_handle = tokio::spawn(async move { retention.run(retention_token).await });

    alerts.notify(AlertEvent::ServiceStarted, "bastion-gate started");
    info!("bastion-gate is ready");

    // ---------------------------------------------------------------
    // 8. Shutdown
    // ---------------------------------------------------------------
    shutdown_signal().await?;
    info!("Shutting down");

    tokio::join!(ssh_group.stop(), tcp_group.stop());
    monitor.stop().await;

    background.cancel();
    join_background("cache-cleanup", cleanup_handle).await;
    join_background("retention", retention_handle).await;

    if settings.alerting.enabled {
        alerts.send_alert(AlertEvent::ServiceStopped, "bastion-gate stopped").await;
    }

    info!("bastion-gate stopped");
    Ok(())
}
