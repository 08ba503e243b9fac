//! Per-connection receive loop
//!
//! One `Connection` task owns the read half of a socket for the life of a
//! session. It runs the transport handshake (on the session-service port),
//! then admits messages until EOF, a framing violation, or a disconnect,
//! and finally drains the session and unregisters it. The write half lives
//! inside the session so workers and oplock breaks can send concurrently.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::{SessionError, SmbResult};
use crate::netbios::{parse_session_request, NEGATIVE_REASON_BAD_CALLING_NAME};
use crate::protocol::{SmbCommand, SmbHeader, SMB_HEADER_LEN};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionState};
use crate::transport::{read_frame_header, read_payload, FrameType, TransportKind};
use crate::worker::WorkerPool;

pub struct Connection<S> {
    reader: ReadHalf<S>,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    pool: Arc<WorkerPool>,
    max_message_size: u32,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        kind: TransportKind,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        pool: Arc<WorkerPool>,
        authenticator: Arc<dyn Authenticator>,
        config: &ServerConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let session = Session::new(
            registry.next_id(),
            kind,
            local_addr,
            peer_addr,
            Box::new(writer),
            authenticator,
            config,
        );
        registry.insert(session.clone());
        Self {
            reader,
            session,
            registry,
            pool,
            max_message_size: config.max_message_size,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Drive the connection to completion. Always drains and unregisters
    /// the session, whatever ended the receive loop.
    pub async fn run(mut self) -> SmbResult<()> {
        self.session.mark_connected();
        let result = self.run_inner().await;

        if let Err(err) = &result {
            debug!(session = self.session.id, %err, "receive loop ended");
        }

        self.session.disconnect().await;
        self.session.teardown().await;
        self.registry.remove(self.session.id);
        self.session.mark_terminated();
        result
    }

    async fn run_inner(&mut self) -> SmbResult<()> {
        // the session-service port must open with its handshake; direct TCP
        // is established by the first well-formed frame header instead
        if self.session.kind == TransportKind::NetBios {
            self.handshake().await?;
        }

        loop {
            match self.session.state() {
                SessionState::Disconnected | SessionState::Terminated => return Ok(()),
                _ => {}
            }

            let header = tokio::select! {
                _ = self.session.shutdown.notified() => return Ok(()),
                result = read_frame_header(&mut self.reader, self.session.kind) => {
                    match result {
                        Ok(header) => header,
                        Err(err) if is_eof(&err) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }
            };

            if self.session.state() == SessionState::Connected {
                self.session.establish()?;
            }

            self.session.refresh_keep_alive();
            self.session.add_rx(4 + header.length as u64);

            match header.frame_type {
                FrameType::KeepAlive => continue,
                FrameType::SessionMessage => self.message(header.length).await?,
                other => {
                    return Err(SessionError::Framing(format!(
                        "unexpected {:?} frame on established session",
                        other
                    )))
                }
            }
        }
    }

    /// Session-service opening exchange: exactly one SESSION_REQUEST, or
    /// the connection is refused.
    async fn handshake(&mut self) -> SmbResult<()> {
        let header = read_frame_header(&mut self.reader, TransportKind::NetBios).await?;
        if header.frame_type != FrameType::SessionRequest {
            return Err(SessionError::Handshake(format!(
                "expected session request, got {:?}",
                header.frame_type
            )));
        }
        let payload = read_payload(&mut self.reader, header.length).await?;
        self.session.add_rx(4 + header.length as u64);

        match parse_session_request(&payload) {
            Ok(names) => {
                debug!(
                    session = self.session.id,
                    called = %names.called,
                    calling = %names.calling,
                    "session request accepted"
                );
                self.session.set_workstation(&names.calling);
                self.session
                    .send_frame(FrameType::PositiveResponse, &[])
                    .await?;
                self.session.establish()
            }
            Err(err) => {
                warn!(session = self.session.id, %err, "session request refused");
                self.session
                    .send_frame(
                        FrameType::NegativeResponse,
                        &[NEGATIVE_REASON_BAD_CALLING_NAME],
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// Admit one session message and route it to a worker.
    async fn message(&mut self, length: u32) -> SmbResult<()> {
        if length > self.max_message_size {
            return Err(SessionError::Framing(format!(
                "message length {} over limit {}",
                length, self.max_message_size
            )));
        }
        let payload = read_payload(&mut self.reader, length).await?;
        if payload.len() < SMB_HEADER_LEN {
            return Err(SessionError::Protocol(format!(
                "runt message ({} bytes)",
                payload.len()
            )));
        }

        let header = SmbHeader::parse(&payload)?;
        let command = header.command;
        let request = self.session.admit(header, payload);

        match SmbCommand::from_u8(command) {
            Some(SmbCommand::WriteRaw) => {
                // raw writes own the transport until dispatched, so they
                // cannot be handed to the pool
                self.pool.execute_inline(&self.session, &request).await;
            }
            _ => {
                self.pool.submit(self.session.clone(), request);
            }
        }
        Ok(())
    }
}

fn is_eof(err: &SessionError) -> bool {
    matches!(err, SessionError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}
