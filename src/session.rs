//! Session objects
//!
//! A `Session` is the server-side state for one client connection: the
//! connection state machine, the active-request list, the logged-on and
//! logging-on user lists, open transactions, signing sequence allocation,
//! the keep-alive budget, and the write half of the socket. The read half
//! stays with the connection task; everything that writes goes through the
//! session so that send gating and raw-mode queueing have one chokepoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info};

use crate::auth::{AuthLevel, AuthRequest, AuthResponse, Authenticator};
use crate::config::ServerConfig;
use crate::error::{NtStatus, SessionError, SmbResult};
use crate::protocol::{encode_oplock_break, SmbCommand, SmbHeader};
use crate::request::{Request, RequestList};
use crate::transaction::Transaction;
use crate::transport::{write_frame, FrameType, TransportKind};
use crate::user::{User, UserState};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet running
    Initialized,
    /// Receive loop running, handshake not done
    Connected,
    /// Transport handshake complete (immediate on direct TCP)
    Established,
    /// Protocol negotiated; commands flow
    Negotiated,
    /// An oplock break is outstanding to the client
    OplockBreaking,
    /// A raw write has taken over the transport
    WriteRawActive,
    /// A raw read has taken over the transport
    ReadRawActive,
    /// Going away; no further sends
    Disconnected,
    /// Fully torn down and unregistered
    Terminated,
}

struct SigningState {
    enabled: bool,
    seqnum: u32,
}

/// Server-side state for one client connection
pub struct Session {
    /// Registry-assigned session id
    pub id: u64,
    /// Framing rules for this connection
    pub kind: TransportKind,
    /// Address the client connected to
    pub local_addr: SocketAddr,
    /// Client address
    pub peer_addr: SocketAddr,
    opened_at: Instant,
    extended_security: bool,

    state: RwLock<SessionState>,
    workstation: RwLock<String>,
    sole_connection: AtomicBool,
    challenge: RwLock<Bytes>,
    signing: Mutex<SigningState>,

    keep_alive: AtomicU32,
    keep_alive_max: AtomicU32,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,

    /// Requests admitted and not yet finalized
    pub requests: RequestList,
    auth_users: Mutex<Vec<Arc<User>>>,
    users: Mutex<Vec<Arc<User>>>,
    transactions: Mutex<Vec<Arc<Transaction>>>,
    oplock_queue: Mutex<Vec<Bytes>>,

    writer: AsyncMutex<Option<BoxedWriter>>,
    /// Signaled on disconnect so the receive loop stops promptly
    pub shutdown: Notify,
    authenticator: Arc<dyn Authenticator>,

    next_uid: AtomicU16,
    next_req_id: AtomicU64,
    next_xid: AtomicU16,
}

impl Session {
    pub fn new(
        id: u64,
        kind: TransportKind,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        writer: BoxedWriter,
        authenticator: Arc<dyn Authenticator>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        let initial = config.keep_alive_initial();
        Arc::new(Self {
            id,
            kind,
            local_addr,
            peer_addr,
            opened_at: Instant::now(),
            extended_security: config.extended_security,
            state: RwLock::new(SessionState::Initialized),
            workstation: RwLock::new(String::new()),
            sole_connection: AtomicBool::new(false),
            challenge: RwLock::new(Bytes::new()),
            signing: Mutex::new(SigningState {
                enabled: false,
                seqnum: 0,
            }),
            keep_alive: AtomicU32::new(initial),
            keep_alive_max: AtomicU32::new(initial),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            requests: RequestList::new(),
            auth_users: Mutex::new(Vec::new()),
            users: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            oplock_queue: Mutex::new(Vec::new()),
            writer: AsyncMutex::new(Some(writer)),
            shutdown: Notify::new(),
            authenticator,
            next_uid: AtomicU16::new(1),
            next_req_id: AtomicU64::new(1),
            next_xid: AtomicU16::new(1),
        })
    }

    // ---- state machine ----

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Receive loop started.
    pub fn mark_connected(&self) {
        let mut state = self.state.write();
        if *state == SessionState::Initialized {
            *state = SessionState::Connected;
        }
    }

    /// Transport handshake complete. Valid only before any command flow.
    pub fn establish(&self) -> SmbResult<()> {
        let mut state = self.state.write();
        match *state {
            SessionState::Initialized | SessionState::Connected => {
                *state = SessionState::Established;
                Ok(())
            }
            other => Err(SessionError::InvalidParameter(format!(
                "establish from {:?}",
                other
            ))),
        }
    }

    /// Protocol negotiated; issues the challenge for this session.
    pub fn mark_negotiated(&self) -> SmbResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Established => *state = SessionState::Negotiated,
                other => {
                    return Err(SessionError::InvalidParameter(format!(
                        "negotiate from {:?}",
                        other
                    )))
                }
            }
        }
        let challenge: [u8; 8] = rand::random();
        *self.challenge.write() = Bytes::copy_from_slice(&challenge);
        Ok(())
    }

    /// Challenge issued at negotiate time (empty before that)
    pub fn challenge(&self) -> Bytes {
        self.challenge.read().clone()
    }

    /// An outstanding oplock break was acknowledged.
    pub fn oplock_break_complete(&self) {
        let mut state = self.state.write();
        if *state == SessionState::OplockBreaking {
            *state = SessionState::Negotiated;
        }
    }

    /// A raw read is taking over the transport.
    pub fn raw_read_start(&self) -> SmbResult<()> {
        let mut state = self.state.write();
        match *state {
            SessionState::Negotiated => {
                *state = SessionState::ReadRawActive;
                Ok(())
            }
            other => Err(SessionError::InvalidParameter(format!(
                "raw read from {:?}",
                other
            ))),
        }
    }

    /// The raw read finished; flush any break messages queued meanwhile.
    pub async fn raw_read_complete(&self) -> SmbResult<()> {
        {
            let mut state = self.state.write();
            if *state == SessionState::ReadRawActive {
                *state = SessionState::Negotiated;
            }
        }
        let queued: Vec<Bytes> = std::mem::take(&mut *self.oplock_queue.lock());
        for pdu in queued {
            {
                let mut state = self.state.write();
                match *state {
                    SessionState::Negotiated | SessionState::OplockBreaking => {
                        *state = SessionState::OplockBreaking;
                    }
                    _ => return Ok(()),
                }
            }
            self.send(&pdu).await?;
        }
        Ok(())
    }

    /// A raw write is taking over the transport.
    pub fn raw_write_start(&self) -> SmbResult<()> {
        let mut state = self.state.write();
        match *state {
            SessionState::Negotiated => {
                *state = SessionState::WriteRawActive;
                Ok(())
            }
            other => Err(SessionError::InvalidParameter(format!(
                "raw write from {:?}",
                other
            ))),
        }
    }

    /// The raw write finished.
    pub fn raw_write_complete(&self) {
        let mut state = self.state.write();
        if *state == SessionState::WriteRawActive {
            *state = SessionState::Negotiated;
        }
    }

    /// Stop the session. Idempotent from any state: marks the session
    /// unreachable for sends, wakes the receive loop, cancels every
    /// in-flight request, and closes the write half.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Disconnected | SessionState::Terminated => return,
                _ => *state = SessionState::Disconnected,
            }
        }
        debug!(session = self.id, "session disconnect");
        self.shutdown.notify_waiters();
        self.requests.cancel_matching(None, None, None);

        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Final transition after teardown and unregistration.
    pub fn mark_terminated(&self) {
        *self.state.write() = SessionState::Terminated;
    }

    // ---- identity ----

    pub fn set_workstation(&self, name: &str) {
        *self.workstation.write() = name.to_string();
    }

    /// Workstation name from the transport handshake; empty on direct TCP.
    pub fn workstation(&self) -> String {
        self.workstation.read().clone()
    }

    /// Display name for this client: the workstation name, or the peer
    /// address when no handshake supplied one.
    pub fn client_name(&self) -> String {
        let workstation = self.workstation.read();
        if workstation.is_empty() {
            self.peer_addr.ip().to_string()
        } else {
            workstation.clone()
        }
    }

    /// Record the client's declaration that this connection is its only
    /// virtual circuit (a SessionSetup carrying VC number 0). Only after
    /// this may the registry drop the client's stale earlier sessions.
    pub fn declare_sole_connection(&self) {
        self.sole_connection.store(true, Ordering::Relaxed);
    }

    pub fn is_sole_connection(&self) -> bool {
        self.sole_connection.load(Ordering::Relaxed)
    }

    /// Match a client name (optionally `\\`-prefixed) against the
    /// workstation name or the peer address.
    pub fn is_client(&self, name: &str) -> bool {
        let name = name.strip_prefix("\\\\").unwrap_or(name);
        {
            let workstation = self.workstation.read();
            if !workstation.is_empty() && workstation.eq_ignore_ascii_case(name) {
                return true;
            }
        }
        self.peer_addr.ip().to_string() == name
    }

    // ---- keep-alive ----

    /// Any received frame resets the idle budget.
    pub fn refresh_keep_alive(&self) {
        self.keep_alive.store(
            self.keep_alive_max.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    /// One sweep tick. Returns true when the idle budget just ran out and
    /// the session should be dropped. A budget pinned at `u32::MAX` never
    /// expires.
    pub fn keep_alive_tick(&self) -> bool {
        let result = self
            .keep_alive
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v == 0 || v == u32::MAX {
                    None
                } else {
                    Some(v - 1)
                }
            });
        matches!(result, Ok(1))
    }

    /// Apply a changed keep-alive budget to this live session.
    pub fn set_keep_alive_max(&self, initial: u32) {
        self.keep_alive_max.store(initial, Ordering::Relaxed);
        self.keep_alive.store(initial, Ordering::Relaxed);
    }

    // ---- byte accounting ----

    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes received and sent over the life of the connection
    pub fn byte_counts(&self) -> (u64, u64) {
        (
            self.rx_bytes.load(Ordering::Relaxed),
            self.tx_bytes.load(Ordering::Relaxed),
        )
    }

    // ---- signing ----

    pub fn signing_enabled(&self) -> bool {
        self.signing.lock().enabled
    }

    pub fn enable_signing(&self, initial_seqnum: u32) {
        let mut signing = self.signing.lock();
        signing.enabled = true;
        signing.seqnum = initial_seqnum;
    }

    /// Allocate signing sequence numbers for an admitted command.
    ///
    /// A cancel consumes one slot and its request is verified one past the
    /// counter with no reply slot; a raw write bypasses signing entirely;
    /// everything else consumes a request/reply pair.
    fn assign_sequences(&self, command: u8) -> (u32, u32) {
        let mut signing = self.signing.lock();
        match SmbCommand::from_u8(command) {
            Some(SmbCommand::NtCancel) => {
                signing.seqnum = signing.seqnum.wrapping_add(1);
                (signing.seqnum.wrapping_add(1), 0)
            }
            Some(SmbCommand::WriteRaw) => (0, 0),
            _ => {
                signing.seqnum = signing.seqnum.wrapping_add(2);
                (signing.seqnum, signing.seqnum.wrapping_add(1))
            }
        }
    }

    // ---- requests ----

    /// Admit a decoded command message: allocate signing slots, link the
    /// record onto the active list, and mark it submitted.
    pub fn admit(&self, header: SmbHeader, buf: Bytes) -> Arc<Request> {
        let (req_seq, reply_seq) = self.assign_sequences(header.command);
        let id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(Request::new(id, self.id, header, buf, req_seq, reply_seq));
        self.requests.push(request.clone());
        request.submit();
        request
    }

    /// Finalize a completed request: cleanup, unlink, mark the record
    /// free, then drop its held references. The unlink happens before the
    /// free mark so cancel sweeps never observe a freed record on the
    /// list, and the held user is released only once the record has left
    /// it.
    pub fn finalize(&self, request: &Arc<Request>) {
        request.cleanup();
        self.requests.remove(request.id);
        request.mark_free();
        request.release_holds();
    }

    /// Cancel in-flight requests, optionally scoped to a user or a tree,
    /// sparing the request that is driving the cancellation.
    pub fn cancel_requests(&self, uid: Option<u16>, tid: Option<u16>, except: Option<u64>) {
        self.requests.cancel_matching(uid, tid, except);
    }

    /// Handle an NT_CANCEL: cancel the request with the same pid and mid.
    pub fn nt_cancel(&self, pid: u16, mid: u16) -> bool {
        self.requests.cancel_by_mid(pid, mid)
    }

    // ---- sending ----

    /// Write one frame of the given type, bypassing the state gate. Used
    /// for handshake responses before the session is established.
    pub async fn send_frame(&self, frame_type: FrameType, payload: &[u8]) -> SmbResult<()> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(SessionError::NotConnected)?;
        write_frame(w, self.kind, frame_type, payload).await?;
        self.add_tx(4 + payload.len() as u64);
        Ok(())
    }

    /// Send a session message. Refused once the session is disconnected.
    pub async fn send(&self, payload: &[u8]) -> SmbResult<()> {
        match self.state() {
            SessionState::Disconnected | SessionState::Terminated => {
                return Err(SessionError::NotConnected)
            }
            _ => {}
        }
        self.send_frame(FrameType::SessionMessage, payload).await
    }

    /// Send (or queue, or drop) an oplock break to the client.
    ///
    /// While a raw read owns the transport the break is queued and flushed
    /// by [`Session::raw_read_complete`]. On a dead session it is dropped.
    /// Any other non-negotiated state is a logic defect in the caller.
    pub async fn oplock_break(&self, tid: u16, fid: u16, break_to_level2: bool) -> SmbResult<()> {
        let pdu = encode_oplock_break(tid, fid, break_to_level2);
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Negotiated
                | SessionState::OplockBreaking
                | SessionState::WriteRawActive => {
                    *state = SessionState::OplockBreaking;
                }
                SessionState::ReadRawActive => {
                    drop(state);
                    self.oplock_queue.lock().push(pdu);
                    return Ok(());
                }
                SessionState::Disconnected | SessionState::Terminated => return Ok(()),
                other => panic!("oplock break in {:?}", other),
            }
        }
        self.send(&pdu).await
    }

    // ---- users / authentication ----

    fn alloc_uid(&self) -> u16 {
        // 0 means "fresh chain" on the wire and 0xFFFE/0xFFFF are reserved;
        // after the counter wraps an id may still be linked on either user
        // list, so live ids are skipped as well
        loop {
            let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            if uid == 0 || uid >= 0xFFFE {
                continue;
            }
            let in_use = self.users.lock().iter().any(|u| u.uid == uid)
                || self.auth_users.lock().iter().any(|u| u.uid == uid);
            if !in_use {
                return uid;
            }
        }
    }

    fn lookup_pending(&self, uid: u16) -> Option<Arc<User>> {
        self.auth_users
            .lock()
            .iter()
            .find(|u| u.uid == uid)
            .cloned()
    }

    fn unlink_pending(&self, uid: u16) {
        self.auth_users.lock().retain(|u| u.uid != uid);
    }

    /// Look up a logged-on user by identifier.
    pub fn lookup_user(&self, uid: u16) -> Option<Arc<User>> {
        self.users.lock().iter().find(|u| u.uid == uid).cloned()
    }

    /// Whether any authentication chain is still in flight
    pub fn auth_in_progress(&self) -> bool {
        !self.auth_users.lock().is_empty()
    }

    /// Whether a specific identifier is still mid-chain
    pub fn is_authenticating(&self, uid: u16) -> bool {
        self.lookup_pending(uid).is_some()
    }

    /// Discard one pending chain, or every pending chain.
    pub fn auth_cancel(&self, uid: Option<u16>) {
        let discarded: Vec<Arc<User>> = {
            let mut pending = self.auth_users.lock();
            match uid {
                Some(uid) => {
                    let (drop_these, keep): (Vec<_>, Vec<_>) =
                        pending.drain(..).partition(|u| u.uid == uid);
                    *pending = keep;
                    drop_these
                }
                None => pending.drain(..).collect(),
            }
        };
        for user in discarded {
            user.logoff();
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    /// Run one SessionSetup round.
    ///
    /// `uid` 0 opens a fresh chain: a pending user is created and its new
    /// identifier returned with the verdict. A nonzero `uid` continues an
    /// existing chain; rounds for the same identifier are serialized by the
    /// user's auth gate while other identifiers proceed concurrently.
    pub async fn authenticate(
        &self,
        uid: u16,
        account: &str,
        domain: &str,
        secblob: Option<Bytes>,
        level: AuthLevel,
    ) -> SmbResult<(u16, AuthResponse)> {
        let user = if uid == 0 {
            let fresh = Arc::new(User::new_pending(
                self.alloc_uid(),
                self.id,
                account.to_string(),
                domain.to_string(),
            ));
            self.auth_users.lock().push(fresh.clone());
            fresh
        } else {
            self.lookup_pending(uid)
                .ok_or(SessionError::BadUserId(uid))?
        };
        let uid = user.uid;

        let _gate = user.auth_gate.lock().await;

        // the chain may have been resolved while we waited on the gate
        if self.lookup_pending(uid).is_none() {
            return Err(SessionError::BadUserId(uid));
        }

        // checked only once the identifier is known to be live
        if secblob.as_ref().map_or(true, |b| b.is_empty()) && level == AuthLevel::Extended {
            self.unlink_pending(uid);
            user.logoff();
            return Err(SessionError::InvalidParameter(
                "empty security blob".to_string(),
            ));
        }

        let auth_request = AuthRequest {
            session_id: self.id,
            user_id: uid,
            account: account.to_string(),
            domain: domain.to_string(),
            workstation: self.client_name(),
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
            challenge: self.challenge(),
            secblob,
            level,
        };

        let response = match self.authenticator.authenticate(&auth_request).await {
            Ok(response) => response,
            Err(err) => {
                self.unlink_pending(uid);
                user.logoff();
                return Err(SessionError::AuthUpcall(err.to_string()));
            }
        };

        match response.status {
            NtStatus::Success => {
                let token = match response.token.clone() {
                    Some(token) => token,
                    None => {
                        self.unlink_pending(uid);
                        user.logoff();
                        return Err(SessionError::AuthFailed(NtStatus::InternalError));
                    }
                };
                // promote under both list locks so the user is always
                // observable in exactly one of them
                {
                    let mut logged_on = self.users.lock();
                    let mut pending = self.auth_users.lock();
                    if !user.logon(token) {
                        pending.retain(|u| u.uid != uid);
                        return Err(SessionError::BadUserId(uid));
                    }
                    pending.retain(|u| u.uid != uid);
                    logged_on.push(user.clone());
                }
                info!(
                    session = self.id,
                    uid,
                    account = %auth_request.account,
                    guest = user.is_guest(),
                    "user logged on"
                );
                Ok((uid, response))
            }
            NtStatus::MoreProcessingRequired if self.extended_security => Ok((uid, response)),
            status => {
                self.unlink_pending(uid);
                user.logoff();
                Err(SessionError::AuthFailed(status))
            }
        }
    }

    /// Log off one user: cancel its requests (sparing the logoff command
    /// itself), unlink it, and notify the external authority.
    pub async fn logoff_uid(&self, uid: u16, except: Option<u64>) -> SmbResult<()> {
        let user = self
            .lookup_user(uid)
            .ok_or(SessionError::BadUserId(uid))?;
        self.cancel_requests(Some(uid), None, except);
        if user.logoff() {
            self.users.lock().retain(|u| u.uid != uid);
            self.authenticator.logoff(self.id, uid).await;
        }
        Ok(())
    }

    /// Log off every authenticated user with the given account name.
    pub async fn logoff_account(&self, account: &str) {
        let targets: Vec<Arc<User>> = self
            .users
            .lock()
            .iter()
            .filter(|u| u.account.eq_ignore_ascii_case(account))
            .cloned()
            .collect();
        for user in targets {
            let _ = self.logoff_uid(user.uid, None).await;
        }
    }

    /// Log off every user, pending chains included.
    pub async fn logoff_all(&self) {
        let users: Vec<Arc<User>> = {
            let mut logged_on = self.users.lock();
            let mut pending = self.auth_users.lock();
            logged_on.drain(..).chain(pending.drain(..)).collect()
        };
        for user in users {
            let was_logged_on = user.state() == UserState::LoggedOn;
            if user.logoff() && was_logged_on {
                self.authenticator.logoff(self.id, user.uid).await;
            }
        }
    }

    // ---- transactions ----

    /// Open a multi-part transaction record.
    pub fn xa_open(
        &self,
        mid: u16,
        uid: u16,
        tid: u16,
        total_params: usize,
        total_data: usize,
    ) -> Arc<Transaction> {
        let xid = loop {
            let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
            if xid != 0 {
                break xid;
            }
        };
        let xa = Arc::new(Transaction::new(xid, mid, uid, tid, total_params, total_data));
        self.transactions.lock().push(xa.clone());
        xa
    }

    /// Find the open transaction a continuation belongs to.
    pub fn xa_find(&self, mid: u16) -> Option<Arc<Transaction>> {
        self.transactions
            .lock()
            .iter()
            .find(|x| x.mid == mid && !x.is_closed())
            .cloned()
    }

    /// Close and unlink one transaction.
    pub fn xa_close(&self, xid: u16) {
        let mut transactions = self.transactions.lock();
        if let Some(xa) = transactions.iter().find(|x| x.xid == xid) {
            xa.close();
        }
        transactions.retain(|x| x.xid != xid);
    }

    fn close_transactions(&self) {
        let drained: Vec<Arc<Transaction>> = self.transactions.lock().drain(..).collect();
        for xa in drained {
            xa.close();
        }
    }

    // ---- teardown ----

    /// Drain the session after the receive loop exits: cancel everything,
    /// wait for the last worker to finalize, close open transactions, and
    /// log off every user.
    pub async fn teardown(&self) {
        self.cancel_requests(None, None, None);
        self.requests.wait_empty().await;
        self.close_transactions();
        self.logoff_all().await;
    }
}
