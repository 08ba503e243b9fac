//! Server front end
//!
//! Owns the shared pieces (registry, worker pool, authenticator) and runs
//! the two accept loops: the NetBIOS session service and direct-hosted TCP.
//! A periodic sweep task enforces the keep-alive budget.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::SmbResult;
use crate::registry::SessionRegistry;
use crate::transport::TransportKind;
use crate::worker::{CommandDispatcher, WorkerPool};

pub struct SmbServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    pool: Arc<WorkerPool>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: Notify,
    direct_local: Mutex<Option<SocketAddr>>,
    netbios_local: Mutex<Option<SocketAddr>>,
}

impl SmbServer {
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new(config.keep_alive_initial());
        let pool = WorkerPool::new(config.max_workers, dispatcher);
        Arc::new(Self {
            config,
            registry,
            pool,
            authenticator,
            shutdown: Notify::new(),
            direct_local: Mutex::new(None),
            netbios_local: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Address the direct listener actually bound (set once running)
    pub fn direct_local_addr(&self) -> Option<SocketAddr> {
        *self.direct_local.lock()
    }

    /// Address the session-service listener actually bound
    pub fn netbios_local_addr(&self) -> Option<SocketAddr> {
        *self.netbios_local.lock()
    }

    /// Change the keep-alive budget at runtime. Applies to every live
    /// session as well as to sessions created afterwards.
    pub fn set_keep_alive(&self, ticks: u32) {
        let initial = if ticks == 0 { u32::MAX } else { ticks };
        self.registry.correct_keep_alive(initial);
    }

    /// Stop accepting and drop every live session.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        self.registry.disconnect_all().await;
    }

    /// Bind the listeners and serve until [`SmbServer::stop`] is called.
    pub async fn run(self: Arc<Self>) -> SmbResult<()> {
        let direct = TcpListener::bind(self.config.direct_addr).await?;
        let direct_addr = direct.local_addr()?;
        *self.direct_local.lock() = Some(direct_addr);
        info!(addr = %direct_addr, "direct listener up");

        let netbios = match self.config.netbios_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let bound = listener.local_addr()?;
                *self.netbios_local.lock() = Some(bound);
                info!(addr = %bound, "session-service listener up");
                Some(listener)
            }
            None => None,
        };

        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(sweeper.config.sweep_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.notified() => break,
                    _ = ticker.tick() => {
                        sweeper.registry.sweep().await;
                    }
                }
            }
        });

        match netbios {
            Some(listener) => {
                tokio::select! {
                    result = self.accept_loop(direct, TransportKind::DirectTcp) => result,
                    result = self.accept_loop(listener, TransportKind::NetBios) => result,
                    _ = self.shutdown.notified() => Ok(()),
                }
            }
            None => {
                tokio::select! {
                    result = self.accept_loop(direct, TransportKind::DirectTcp) => result,
                    _ = self.shutdown.notified() => Ok(()),
                }
            }
        }
    }

    async fn accept_loop(&self, listener: TcpListener, kind: TransportKind) -> SmbResult<()> {
        let listener_addr = listener.local_addr()?;
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let local_addr = stream.local_addr().unwrap_or(listener_addr);
            info!(%peer_addr, ?kind, "connection accepted");

            let connection = Connection::new(
                stream,
                kind,
                local_addr,
                peer_addr,
                self.registry.clone(),
                self.pool.clone(),
                self.authenticator.clone(),
                &self.config,
            );
            tokio::spawn(async move {
                if let Err(err) = connection.run().await {
                    warn!(%peer_addr, %err, "connection ended with error");
                }
            });
        }
    }
}
