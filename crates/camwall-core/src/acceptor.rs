//! Producer connection acceptor.
//!
//! Accepts TCP connections, assigns each one a slot and spawns its
//! session. A connection that finds every slot taken is closed straight
//! away; nothing is queued and nothing is written back.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::IngestMetrics;
use crate::session::{SessionConfig, SessionHandler, SessionReport};
use crate::slots::SlotTable;

/// Pause after a failed `accept` (e.g. file descriptor exhaustion) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop for producer connections
pub struct ConnectionAcceptor {
    listener: TcpListener,
    table: Arc<SlotTable>,
    metrics: Arc<IngestMetrics>,
    config: SessionConfig,
}

impl ConnectionAcceptor {
    pub fn new(
        listener: TcpListener,
        table: Arc<SlotTable>,
        metrics: Arc<IngestMetrics>,
        config: SessionConfig,
    ) -> Self {
        Self {
            listener,
            table,
            metrics,
            config,
        }
    }

    /// Bind a listener on `addr` and wrap it.
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<SlotTable>,
        metrics: Arc<IngestMetrics>,
        config: SessionConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, table, metrics, config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` changes or its sender is dropped.
    ///
    /// Sessions already running are left alone; stopping them is up to the
    /// owner of the slot table.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "accepting producer connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.admit(stream, peer);
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("acceptor stopped");
    }

    /// Assign `stream` a slot and spawn its session, or close it if the table is full.
    pub fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Option<JoinHandle<SessionReport>> {
        let admission = match self.table.acquire(peer.ip()) {
            Ok(admission) => admission,
            Err(e) => {
                warn!(peer = %peer, "rejecting connection: {}", e);
                self.metrics.record_rejected();
                drop(stream);
                return None;
            }
        };

        let slot = admission.lease.slot_id();
        if admission.replaced {
            info!(slot, peer = %peer, "producer reconnected, evicting its previous session");
            self.metrics.record_eviction();
        }
        self.metrics.record_accepted();
        info!(slot, peer = %peer, "connection accepted");

        let handler = SessionHandler::new(
            stream,
            peer,
            admission.lease,
            admission.eviction,
            self.table.clone(),
            self.metrics.clone(),
            self.config,
        );
        Some(tokio::spawn(handler.run()))
    }
}
