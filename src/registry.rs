//! Session registry
//!
//! Every live session is registered here under a dense server-wide id.
//! The registry also runs the cross-session maintenance: the keep-alive
//! sweep, live rewrites of a changed keep-alive budget, and the single-VC
//! reconnection check that drops a client's stale earlier session when it
//! dials in again.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::session::Session;

pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
    keep_alive_initial: AtomicU32,
    rx_retired: AtomicU64,
    tx_retired: AtomicU64,
}

impl SessionRegistry {
    pub fn new(keep_alive_initial: u32) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            keep_alive_initial: AtomicU32::new(keep_alive_initial),
            rx_retired: AtomicU64::new(0),
            tx_retired: AtomicU64::new(0),
        })
    }

    /// Allocate the id for a session about to be created.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, session: Arc<Session>) {
        debug!(session = session.id, peer = %session.peer_addr, "session registered");
        self.sessions.insert(session.id, session);
    }

    /// Unregister a session, folding its byte counters into the
    /// server-wide totals.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        let session = self.sessions.remove(&id).map(|(_, session)| session)?;
        let (rx, tx) = session.byte_counts();
        self.rx_retired.fetch_add(rx, Ordering::Relaxed);
        self.tx_retired.fetch_add(tx, Ordering::Relaxed);
        Some(session)
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Server-wide bytes received and sent: every live session plus
    /// everything retired through [`SessionRegistry::remove`].
    pub fn byte_totals(&self) -> (u64, u64) {
        let mut rx = self.rx_retired.load(Ordering::Relaxed);
        let mut tx = self.tx_retired.load(Ordering::Relaxed);
        for entry in self.sessions.iter() {
            let (r, t) = entry.byte_counts();
            rx += r;
            tx += t;
        }
        (rx, tx)
    }

    /// One keep-alive tick across every session. Sessions whose idle
    /// budget ran out are disconnected; returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.keep_alive_tick())
            .map(|entry| entry.clone())
            .collect();

        for session in &expired {
            info!(session = session.id, peer = %session.peer_addr, "idle timeout");
            session.disconnect().await;
        }
        expired.len()
    }

    /// Apply a changed keep-alive budget to every live session.
    pub fn correct_keep_alive(&self, initial: u32) {
        self.keep_alive_initial.store(initial, Ordering::Relaxed);
        for entry in self.sessions.iter() {
            entry.set_keep_alive_max(initial);
        }
    }

    /// Current keep-alive starting budget
    pub fn keep_alive_initial(&self) -> u32 {
        self.keep_alive_initial.load(Ordering::Relaxed)
    }

    /// Disconnect every live session. Used on server shutdown; sessions
    /// unregister themselves as their connection tasks drain.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| entry.clone()).collect();
        for session in sessions {
            session.disconnect().await;
        }
    }

    /// Single-VC reconnection: when a client declares its new connection
    /// to be its only virtual circuit (SessionSetup VC number 0), earlier
    /// sessions with the same machine name against the same server
    /// address are stale and get dropped. Only strictly older records
    /// (smaller id, not opened later) from the same peer address qualify.
    /// Invoked by the command dispatcher when it parses the declaration;
    /// a session that never declared is left alone, so clients running
    /// several circuits keep them all.
    pub async fn reconnection_check(&self, incoming: &Arc<Session>) {
        if !incoming.is_sole_connection() {
            return;
        }
        let workstation = incoming.workstation();
        if workstation.is_empty() {
            return;
        }

        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.id < incoming.id
                    && entry.peer_addr.ip() == incoming.peer_addr.ip()
                    && entry.local_addr.ip() == incoming.local_addr.ip()
                    && entry.opened_at() <= incoming.opened_at()
                    && entry.workstation().eq_ignore_ascii_case(&workstation)
            })
            .map(|entry| entry.clone())
            .collect();

        for session in stale {
            info!(
                session = session.id,
                replaced_by = incoming.id,
                workstation = %workstation,
                "dropping superseded session"
            );
            session.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRequest, AuthResponse, Authenticator};
    use crate::config::ServerConfig;
    use crate::error::SmbResult;
    use crate::session::SessionState;
    use crate::transport::TransportKind;
    use async_trait::async_trait;

    struct NoopAuthenticator;

    #[async_trait]
    impl Authenticator for NoopAuthenticator {
        async fn authenticate(&self, _request: &AuthRequest) -> SmbResult<AuthResponse> {
            unreachable!("not used in these tests")
        }
    }

    fn make_session(
        registry: &SessionRegistry,
        peer: &str,
        workstation: &str,
    ) -> Arc<Session> {
        let (_client, server) = tokio::io::duplex(4096);
        let (_read, write) = tokio::io::split(server);
        let session = Session::new(
            registry.next_id(),
            TransportKind::NetBios,
            "10.0.0.1:139".parse().unwrap(),
            peer.parse().unwrap(),
            Box::new(write),
            Arc::new(NoopAuthenticator),
            &ServerConfig::new(),
        );
        session.set_workstation(workstation);
        registry.insert(session.clone());
        session
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_sessions() {
        let registry = SessionRegistry::new(2);
        let session = make_session(&registry, "10.0.0.2:50000", "client1");
        session.set_keep_alive_max(2);

        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(session.state(), SessionState::Disconnected);

        // already expired sessions are not reported again
        assert_eq!(registry.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_defers_expiry() {
        let registry = SessionRegistry::new(2);
        let session = make_session(&registry, "10.0.0.2:50000", "client1");
        session.set_keep_alive_max(2);

        assert_eq!(registry.sweep().await, 0);
        session.refresh_keep_alive();
        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_correct_keep_alive_rewrites_live_sessions() {
        let registry = SessionRegistry::new(5400);
        let session = make_session(&registry, "10.0.0.2:50000", "client1");

        registry.correct_keep_alive(u32::MAX);
        assert_eq!(registry.keep_alive_initial(), u32::MAX);
        for _ in 0..5 {
            assert_eq!(registry.sweep().await, 0);
        }
        assert_ne!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnection_drops_stale_session() {
        let registry = SessionRegistry::new(5400);
        let old = make_session(&registry, "10.0.0.2:50000", "client1");
        let other = make_session(&registry, "10.0.0.3:50000", "client1");
        let incoming = make_session(&registry, "10.0.0.2:50001", "CLIENT1");
        incoming.declare_sole_connection();

        registry.reconnection_check(&incoming).await;

        assert_eq!(old.state(), SessionState::Disconnected);
        // different peer address survives
        assert_ne!(other.state(), SessionState::Disconnected);
        // the incoming session itself survives
        assert_ne!(incoming.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnection_ignores_other_workstations() {
        let registry = SessionRegistry::new(5400);
        let other = make_session(&registry, "10.0.0.2:50000", "client2");
        let incoming = make_session(&registry, "10.0.0.2:50001", "client1");
        incoming.declare_sole_connection();

        registry.reconnection_check(&incoming).await;
        assert_ne!(other.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnection_requires_declaration() {
        let registry = SessionRegistry::new(5400);
        let old = make_session(&registry, "10.0.0.2:50000", "client1");
        let incoming = make_session(&registry, "10.0.0.2:50001", "client1");

        // a client that never declared itself single-VC may run several
        // circuits; none of them is stale
        registry.reconnection_check(&incoming).await;
        assert_ne!(old.state(), SessionState::Disconnected);
        assert_ne!(incoming.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnection_requires_workstation() {
        let registry = SessionRegistry::new(5400);
        let old = make_session(&registry, "10.0.0.2:50000", "");
        let incoming = make_session(&registry, "10.0.0.2:50001", "");
        incoming.declare_sole_connection();

        registry.reconnection_check(&incoming).await;
        assert_ne!(old.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_remove_and_lookup() {
        let registry = SessionRegistry::new(5400);
        let session = make_session(&registry, "10.0.0.2:50000", "client1");
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(session.id).is_some());

        let removed = registry.remove(session.id).unwrap();
        assert_eq!(removed.id, session.id);
        assert!(registry.is_empty());
        assert!(registry.remove(session.id).is_none());
    }

    #[tokio::test]
    async fn test_byte_totals_span_sessions_and_survive_removal() {
        let registry = SessionRegistry::new(5400);
        let a = make_session(&registry, "10.0.0.2:50000", "client1");
        let b = make_session(&registry, "10.0.0.3:50000", "client2");
        a.add_rx(100);
        a.add_tx(40);
        b.add_rx(7);

        assert_eq!(registry.byte_totals(), (107, 40));

        // a departing session's traffic stays in the server totals
        registry.remove(a.id);
        assert_eq!(registry.byte_totals(), (107, 40));
        registry.remove(b.id);
        assert_eq!(registry.byte_totals(), (107, 40));
    }
}
