pub mod dbbouncer;

pub use crate::dbbouncer::*;

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info, info_span, Level};
use tracing::Instrument;
use tracing_subscriber::FmtSubscriber;

use crate::dbbouncer::acceptor::{ConnectionLimiter, Listener};
use crate::dbbouncer::common::{coarse_monotonic_clock_updater, Result};
use crate::dbbouncer::config::{load_config, Settings};
use crate::dbbouncer::directory::RoutingDirectory;
use crate::dbbouncer::health::{HealthChecker, HealthMap};
use crate::dbbouncer::metrics::{MetricsSink, TracingMetrics};
use crate::dbbouncer::pool::PoolManager;
use crate::dbbouncer::relay::{mysql_session, pg_session, RelayContext};
use crate::dbbouncer::tls::TlsManager;

pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stdout.
        .with_max_level(max_level)
        // completes the builder.
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Load the configuration settings from dbbouncer.yaml.
/// See dbbouncer::config::load_config for more info.
pub fn init_settings() -> Result<Settings> {
    load_config("dbbouncer.yaml")
}

pub fn init_runtime(_settings: &Settings) -> io::Result<Runtime> {
    let workers = num_cpus::get().max(1);
    Builder::new_multi_thread().worker_threads(workers).enable_all().build()
}

/// Everything the accept loops need to admit and serve a connection, bundled
/// so it can be cheaply `Arc`-cloned into every spawned session task.
pub struct Server {
    pub settings: Arc<Settings>,
    pub directory: Arc<RoutingDirectory>,
    pub pools: Arc<PoolManager>,
    pub health: Arc<HealthMap>,
    pub metrics: Arc<dyn MetricsSink>,
    pub tls: Option<Arc<TlsManager>>,
    pub limiter: Arc<ConnectionLimiter>,
}

impl Server {
    pub fn build(settings: Settings) -> Result<Arc<Self>> {
        let settings = Arc::new(settings);
        let directory = Arc::new(RoutingDirectory::new(&settings));
        let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
        let pools = PoolManager::new(directory.clone(), metrics.clone());
        let health = Arc::new(HealthMap::new(settings.unhealthy_threshold));
        let tls = TlsManager::load(&settings.tls)?.map(Arc::new);
        let limiter = ConnectionLimiter::new(settings.max_proxy_connections);
        Ok(Arc::new(Server { settings, directory, pools, health, metrics, tls, limiter }))
    }

    fn relay_context(&self) -> Arc<RelayContext> {
        Arc::new(RelayContext {
            directory: self.directory.clone(),
            pools: self.pools.clone(),
            health: self.health.clone(),
            metrics: self.metrics.clone(),
            tls: self.tls.clone(),
            settings: self.settings.clone(),
        })
    }

    async fn run_pg(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let listener = Listener::bind(self.settings.listen_address_pg()).await?;
        info!(address = %listener.address, "postgres proxy listening");
        loop {
            let (sock, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Some(pair) => pair,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let Some(slot) = self.limiter.try_acquire() else {
                continue;
            };
            let ctx = self.relay_context();
            let span = info_span!("pg_conn", peer = %peer);
            tokio::spawn(
                async move {
                    let _slot = slot;
                    if let Err(e) = pg_session::handle_connection(sock, ctx).await {
                        error!(error = %e, peer = %peer, "postgres session ended with error");
                    }
                }
                .instrument(span),
            );
        }
        Ok(())
    }

    async fn run_mysql(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let listener = Listener::bind(self.settings.listen_address_mysql()).await?;
        info!(address = %listener.address, "mysql proxy listening");
        loop {
            let (sock, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Some(pair) => pair,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let Some(slot) = self.limiter.try_acquire() else {
                continue;
            };
            let ctx = self.relay_context();
            let span = info_span!("mysql_conn", peer = %peer);
            tokio::spawn(
                async move {
                    let _slot = slot;
                    if let Err(e) = mysql_session::handle_connection(sock, ctx).await {
                        error!(error = %e, peer = %peer, "mysql session ended with error");
                    }
                }
                .instrument(span),
            );
        }
        Ok(())
    }
}

/// Probe a tenant's backend once, outside the periodic health checker. Used
/// by the admin surface's synchronous "ping this tenant now" operation.
pub async fn probe_tenant(directory: &RoutingDirectory, tenant_id: &str) -> bool {
    match directory.resolve(tenant_id) {
        Some(tenant) => TcpStream::connect(format!("{}:{}", tenant.host, tenant.port)).await.is_ok(),
        None => false,
    }
}

pub fn run_servers(server: Arc<Server>, runtime: &Runtime) {
    runtime.block_on(async move {
        // Update the coarse monotonic clock on a periodic basis.
        tokio::spawn(coarse_monotonic_clock_updater());

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut handles = Vec::new();

        if server.settings.pg_port != 0 {
            let server = server.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { server.run_pg(rx).await }));
        }
        if server.settings.mysql_port != 0 {
            let server = server.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { server.run_mysql(rx).await }));
        }

        server.pools.prewarm_all().await;

        {
            let pools = server.pools.clone();
            let interval = std::time::Duration::from_secs(server.settings.idle_reap_interval_secs);
            tokio::spawn(async move { pools.run_idle_reaper(interval).await });
        }
        {
            let pools = server.pools.clone();
            let interval = std::time::Duration::from_secs(server.settings.stats_interval_secs);
            tokio::spawn(async move { pools.run_stats_reporter(interval).await });
        }
        {
            let checker = HealthChecker::new(
                server.directory.clone(),
                server.health.clone(),
                server.metrics.clone(),
                &server.settings,
            );
            tokio::spawn(checker.run());
        }

        let shutdown = shutdown_signal();
        let mut join_handles = futures::future::join_all(handles);
        tokio::select! {
            _ = shutdown => {
                info!("shutdown signal received, draining pools");
                let _ = shutdown_tx.send(true);
                let deadline = std::time::Duration::from_secs(server.settings.shutdown_timeout_secs);
                let _ = tokio::time::timeout(deadline, &mut join_handles).await;
                let _ = tokio::time::timeout(deadline, server.pools.close_all()).await;
            }
            _ = &mut join_handles => {}
        }
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
