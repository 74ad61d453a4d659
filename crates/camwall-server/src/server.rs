//! Ingest server: producer listener, render loop, admin HTTP and shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use camwall_core::{run_render_loop, ConnectionAcceptor, IngestMetrics, SlotTable};

use crate::admin::AdminApi;
use crate::config::ServerConfig;
use crate::snapshot::SnapshotRenderer;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Addresses actually bound, useful when the config asks for port 0
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub producers: SocketAddr,
    pub admin: Option<SocketAddr>,
}

pub struct IngestServer {
    config: ServerConfig,
    table: Arc<SlotTable>,
    metrics: Arc<IngestMetrics>,
}

impl IngestServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let metrics = Arc::new(IngestMetrics::new().context("Failed to register metrics")?);
        let table = Arc::new(SlotTable::new(config.slots));
        Ok(Self {
            config,
            table,
            metrics,
        })
    }

    pub fn table(&self) -> Arc<SlotTable> {
        self.table.clone()
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Run until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        let shutdown_signal = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received, starting graceful shutdown");
        };
        self.run_until(shutdown_signal, |_| {}).await
    }

    /// Run until `shutdown` completes. `on_bound` is called once every listener is up.
    pub async fn run_until<F>(self, shutdown: F, on_bound: impl FnOnce(BoundAddrs)) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        let acceptor = ConnectionAcceptor::bind(
            config.listen_addr,
            self.table.clone(),
            self.metrics.clone(),
            config.to_session_config(),
        )
        .await
        .with_context(|| format!("Failed to bind producer listener on {}", config.listen_addr))?;
        let producers = acceptor.local_addr()?;

        info!(
            addr = %producers,
            slots = config.slots,
            channel_order = %config.channel_order,
            "camwall server listening"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let admin = match config.admin_addr {
            Some(addr) => {
                let (bound, task) = self.spawn_admin(addr, stop_rx.clone()).await?;
                tasks.push(task);
                Some(bound)
            }
            None => None,
        };

        if let Some(dir) = &config.snapshot_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;
            info!(dir = %dir.display(), "writing slot snapshots");
        }
        let renderer = SnapshotRenderer::new(
            config.slots,
            config.snapshot_dir.clone(),
            config.snapshot_interval(),
            config.stats_interval(),
        );
        let table = self.table.clone();
        let render_stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut renderer = run_render_loop(table, renderer, render_stop).await;
            let flushed = renderer.flush().await;
            if flushed > 0 {
                info!("Waited for {} snapshot writes", flushed);
            }
        }));
        tasks.push(tokio::spawn(acceptor.run(stop_rx)));

        on_bound(BoundAddrs { producers, admin });

        shutdown.await;
        let _ = stop_tx.send(true);

        let evicted = self.table.evict_all();
        if evicted > 0 {
            info!("Evicted {} active sessions", evicted);
        }
        self.graceful_shutdown().await;

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Server task ended abnormally: {}", e);
            }
        }

        info!("camwall server stopped");
        Ok(())
    }

    async fn spawn_admin(
        &self,
        addr: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let router = AdminApi::new(self.table.clone(), self.metrics.clone()).router();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin listener on {}", addr))?;
        let bound = listener.local_addr()?;
        info!("Admin API listening on {}", bound);

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            });
            if let Err(e) = serve.await {
                error!("Admin HTTP server error: {}", e);
            }
        });
        Ok((bound, task))
    }

    /// Wait for sessions to notice their eviction and release their slots.
    async fn graceful_shutdown(&self) {
        let start = Instant::now();
        loop {
            let active = self.table.occupied();
            if active == 0 {
                info!("All sessions closed");
                break;
            }
            if start.elapsed() > SHUTDOWN_TIMEOUT {
                warn!("Shutdown timeout reached, {} sessions still active", active);
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }
}
