//! Connection hub: owns the session registry and the broadcast task that
//! copies every sampler snapshot into it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use threadscope_core::{Registry, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::session::{Session, SessionSummary};

/// Shared between the router and the broadcast task. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    registry: Registry,
    config: SessionConfig,
    shutdown: CancellationToken,
    accepted: AtomicU64,
}

impl Hub {
    /// `shutdown` cancels the broadcast task and every open session.
    pub fn new(config: SessionConfig, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Registry::new(),
                config,
                shutdown,
                accepted: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Sessions currently registered for delivery.
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Sessions accepted since startup.
    pub fn accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Forward every snapshot from `source` to all registered sessions.
    ///
    /// Ends when `source` closes (the sampler stopped) or on shutdown.
    pub fn spawn_dispatch(&self, source: Subscription) -> JoinHandle<()> {
        let registry = self.inner.registry.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(dispatch_loop(registry, source, shutdown))
    }

    /// Register a new session. Call only after the handshake succeeded.
    pub fn open_session(&self) -> Session {
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        Session::open(
            &self.inner.registry,
            self.inner.config.clone(),
            &self.inner.shutdown,
        )
    }

    /// Serve one upgraded WebSocket until it closes.
    pub async fn accept(&self, socket: WebSocket) -> SessionSummary {
        let session = self.open_session();
        let (writer, reader) = socket.split();
        session.run(writer, reader).await
    }
}

async fn dispatch_loop(registry: Registry, mut source: Subscription, shutdown: CancellationToken) {
    let mut forwarded = 0u64;
    loop {
        let snapshot = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = source.recv() => match next {
                Some(snapshot) => snapshot,
                None => {
                    log::info!("snapshot source closed");
                    break;
                }
            },
        };

        let report = registry.dispatch(&snapshot);
        forwarded += 1;
        if report.dropped > 0 {
            log::debug!(
                "snapshot #{}: {} delivered, {} dropped on full buffers",
                snapshot.seq,
                report.delivered,
                report.dropped
            );
        }
    }
    log::info!("broadcast stopped after {forwarded} snapshots");
}
