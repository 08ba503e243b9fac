//! Bounded request execution
//!
//! Admitted requests are handed to a pool of worker tasks bounded by a
//! semaphore. Admission is never blocked by execution capacity: the permit
//! is acquired inside the spawned task, so a busy pool queues work instead
//! of stalling the receive loop. Raw writes bypass the pool and run inline
//! on the receive loop, which must not read ahead of them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{SessionError, SmbResult};
use crate::protocol::SmbCommand;
use crate::request::Request;
use crate::session::Session;

/// Command execution seam. The session layer admits, sequences, and
/// cancels requests; what a command actually does lives behind this trait.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Execute one request. `Ok(Some(reply))` is sent back as a session
    /// message; `Ok(None)` suppresses the reply (the dispatcher sent its
    /// own or the command has none).
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        request: &Arc<Request>,
    ) -> SmbResult<Option<Bytes>>;
}

/// Semaphore-bounded worker pool shared by every session.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, dispatcher: Arc<dyn CommandDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            dispatcher,
        })
    }

    /// Hand a submitted request to a worker task. A cancel runs without a
    /// pool permit: it only flips request state, and making it queue for
    /// capacity could park it behind the very request it has to cancel.
    pub fn submit(self: &Arc<Self>, session: Arc<Session>, request: Arc<Request>) {
        let pool = self.clone();
        let needs_permit =
            SmbCommand::from_u8(request.header.command) != Some(SmbCommand::NtCancel);
        tokio::spawn(async move {
            let _permit = if needs_permit {
                pool.permits.clone().acquire_owned().await.ok()
            } else {
                None
            };
            pool.run(&session, &request).await;
        });
    }

    /// Execute a request on the caller's task, without a pool permit. Used
    /// for raw writes, which must finish before the receive loop reads the
    /// raw data that follows them.
    pub async fn execute_inline(&self, session: &Arc<Session>, request: &Arc<Request>) {
        self.run(session, request).await;
    }

    async fn run(&self, session: &Arc<Session>, request: &Arc<Request>) {
        if request.activate() {
            if SmbCommand::from_u8(request.header.command) == Some(SmbCommand::NtCancel) {
                // a cancel targets the session's own list and has no reply,
                // so it never reaches the dispatcher
                let hit = session.nt_cancel(request.header.pid, request.header.mid);
                debug!(
                    session = session.id,
                    mid = request.header.mid,
                    hit,
                    "cancel request"
                );
                request.complete();
                session.finalize(request);
                return;
            }
            match self.dispatcher.dispatch(session, request).await {
                Ok(Some(reply)) => {
                    if let Err(err) = session.send(&reply).await {
                        debug!(session = session.id, request = request.id, %err, "reply dropped");
                    }
                }
                Ok(None) => {}
                Err(SessionError::Cancelled) => {
                    debug!(session = session.id, request = request.id, "request canceled");
                }
                Err(err) => {
                    warn!(session = session.id, request = request.id, %err, "dispatch failed");
                }
            }
        } else {
            debug!(
                session = session.id,
                request = request.id,
                "canceled before execution"
            );
        }
        request.complete();
        session.finalize(request);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::auth::{AuthRequest, AuthResponse, Authenticator};
    use crate::config::ServerConfig;
    use crate::protocol::{SmbCommand, SmbHeader};
    use crate::transport::TransportKind;
    use tokio::io::AsyncReadExt;

    struct NoopAuthenticator;

    #[async_trait]
    impl Authenticator for NoopAuthenticator {
        async fn authenticate(&self, _request: &AuthRequest) -> SmbResult<AuthResponse> {
            unreachable!("not used in these tests")
        }
    }

    struct EchoDispatcher {
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl EchoDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CommandDispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            _session: &Arc<Session>,
            request: &Arc<Request>,
        ) -> SmbResult<Option<Bytes>> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(request.buf.clone()))
        }
    }

    fn make_session() -> (Arc<Session>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(65536);
        let (_read, write) = tokio::io::split(server);
        let session = Session::new(
            1,
            TransportKind::DirectTcp,
            "127.0.0.1:445".parse().unwrap(),
            "127.0.0.1:51000".parse().unwrap(),
            Box::new(write),
            Arc::new(NoopAuthenticator),
            &ServerConfig::new(),
        );
        session.mark_connected();
        session.establish().unwrap();
        session.mark_negotiated().unwrap();
        (session, client)
    }

    #[tokio::test]
    async fn test_submit_executes_and_replies() {
        let dispatcher = EchoDispatcher::new();
        let pool = WorkerPool::new(4, dispatcher.clone());
        let (session, mut client) = make_session();

        let request = session.admit(
            SmbHeader::new_request(SmbCommand::Echo.as_u8()),
            Bytes::from_static(b"ping"),
        );
        pool.submit(session.clone(), request);

        let mut frame = [0u8; 4 + 4];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[4..], b"ping");

        session.requests.wait_empty().await;
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_request_not_executed() {
        let dispatcher = EchoDispatcher::new();
        let pool = WorkerPool::new(4, dispatcher.clone());
        let (session, _client) = make_session();

        let request = session.admit(
            SmbHeader::new_request(SmbCommand::Echo.as_u8()),
            Bytes::from_static(b"ping"),
        );
        request.cancel();
        pool.submit(session.clone(), request);

        session.requests.wait_empty().await;
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let dispatcher = EchoDispatcher::new();
        let pool = WorkerPool::new(1, dispatcher.clone());
        let (session, mut client) = make_session();

        for _ in 0..4 {
            let request = session.admit(
                SmbHeader::new_request(SmbCommand::Echo.as_u8()),
                Bytes::from_static(b"x"),
            );
            pool.submit(session.clone(), request);
        }

        let mut frame = [0u8; 4 + 1];
        for _ in 0..4 {
            client.read_exact(&mut frame).await.unwrap();
        }
        session.requests.wait_empty().await;

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 4);
        assert_eq!(dispatcher.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_command_runs_in_pool_without_dispatch() {
        let dispatcher = EchoDispatcher::new();
        let pool = WorkerPool::new(1, dispatcher.clone());
        let (session, _client) = make_session();

        let mut target_header = SmbHeader::new_request(SmbCommand::ReadAndx.as_u8());
        target_header.pid = 7;
        target_header.mid = 9;
        let target = session.admit(target_header, Bytes::new());

        let mut cancel_header = SmbHeader::new_request(SmbCommand::NtCancel.as_u8());
        cancel_header.pid = 7;
        cancel_header.mid = 9;
        let cancel = session.admit(cancel_header, Bytes::new());
        pool.submit(session.clone(), cancel);

        // the cancel finalizes on its own; only the target stays listed
        while session.requests.len() > 1 {
            tokio::task::yield_now().await;
        }
        assert!(target.is_canceled());

        pool.submit(session.clone(), target);
        session.requests.wait_empty().await;
        // neither the cancel nor its canceled target reached the dispatcher
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_not_parked_behind_saturated_pool() {
        let dispatcher = EchoDispatcher::new();
        let pool = WorkerPool::new(1, dispatcher.clone());
        let (session, _client) = make_session();

        // hold the only permit so ordinary work would queue
        let held = pool.permits.clone().acquire_owned().await.unwrap();

        let mut target_header = SmbHeader::new_request(SmbCommand::ReadAndx.as_u8());
        target_header.pid = 3;
        target_header.mid = 4;
        let target = session.admit(target_header, Bytes::new());

        let mut cancel_header = SmbHeader::new_request(SmbCommand::NtCancel.as_u8());
        cancel_header.pid = 3;
        cancel_header.mid = 4;
        let cancel = session.admit(cancel_header, Bytes::new());
        pool.submit(session.clone(), cancel);

        while session.requests.len() > 1 {
            tokio::task::yield_now().await;
        }
        assert!(target.is_canceled());
        drop(held);
    }

    #[tokio::test]
    async fn test_inline_execution() {
        let dispatcher = EchoDispatcher::new();
        let pool = WorkerPool::new(1, dispatcher.clone());
        let (session, mut client) = make_session();

        let request = session.admit(
            SmbHeader::new_request(SmbCommand::WriteRaw.as_u8()),
            Bytes::from_static(b"raw"),
        );
        pool.execute_inline(&session, &request).await;

        assert!(session.requests.is_empty());
        let mut frame = [0u8; 4 + 3];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[4..], b"raw");
    }
}
