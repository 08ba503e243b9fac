//! In-flight request records
//!
//! Every admitted command message becomes a `Request` that lives on its
//! session's active list from admission until finalization. Cancellation is
//! cooperative: a cancel marks the record and wakes it if it is blocked, and
//! the executing worker observes the mark at its next checkpoint.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{SessionError, SmbResult};
use crate::protocol::SmbHeader;
use crate::user::User;

/// Request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Being decoded and admitted
    Initializing,
    /// On the session list, waiting for a worker
    Submitted,
    /// Executing
    Active,
    /// Blocked on a byte-range lock
    WaitingLock,
    /// Blocked on an event (oplock break acknowledgement and the like)
    WaitingEvent,
    /// The awaited event fired; the waiter has not resumed yet
    EventOccurred,
    /// Execution finished; response sent or suppressed
    Completed,
    /// Canceled; the worker will complete without executing
    Canceled,
    /// Post-completion cleanup done, not yet unlinked
    CleanedUp,
    /// Unlinked from the session; the record is dead
    Free,
}

/// One admitted command message
pub struct Request {
    /// Per-session request id
    pub id: u64,
    /// Owning session
    pub session_id: u64,
    /// Decoded command header
    pub header: SmbHeader,
    /// The full message as received
    pub buf: Bytes,
    /// Signing sequence number for the request
    pub req_seq: u32,
    /// Signing sequence number reserved for the reply
    pub reply_seq: u32,
    state: Mutex<RequestState>,
    wake: Notify,
    held_user: Mutex<Option<Arc<User>>>,
}

impl Request {
    pub fn new(
        id: u64,
        session_id: u64,
        header: SmbHeader,
        buf: Bytes,
        req_seq: u32,
        reply_seq: u32,
    ) -> Self {
        Self {
            id,
            session_id,
            header,
            buf,
            req_seq,
            reply_seq,
            state: Mutex::new(RequestState::Initializing),
            wake: Notify::new(),
            held_user: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RequestState {
        *self.state.lock()
    }

    /// Snapshot of the message as it arrived, for signature verification
    /// independent of any in-place rewriting during dispatch.
    pub fn signing_snapshot(&self) -> Bytes {
        self.buf.clone()
    }

    /// Pin the user this request executes as. The reference is held for
    /// the rest of the request's life and released exactly once during
    /// finalization, after the record has left the session list, so a
    /// logoff racing the request can never free the user under it.
    pub fn bind_user(&self, user: Arc<User>) {
        *self.held_user.lock() = Some(user);
    }

    pub fn bound_user(&self) -> Option<Arc<User>> {
        self.held_user.lock().clone()
    }

    /// Drop the held references. Called only by the session once the
    /// record is off the list.
    pub(crate) fn release_holds(&self) {
        self.held_user.lock().take();
    }

    /// Admission done; the record is on the session list.
    pub fn submit(&self) {
        let mut state = self.state.lock();
        if *state == RequestState::Initializing {
            *state = RequestState::Submitted;
        }
    }

    /// Worker entry. Returns false if the request was canceled before a
    /// worker picked it up; the worker then completes without executing.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            RequestState::Submitted => {
                *state = RequestState::Active;
                true
            }
            RequestState::Canceled => false,
            other => panic!("activate from {:?}", other),
        }
    }

    /// Execution finished (normally or after observing a cancel).
    pub fn complete(&self) {
        let mut state = self.state.lock();
        *state = RequestState::Completed;
    }

    /// Post-completion cleanup done.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        if *state == RequestState::Completed {
            *state = RequestState::CleanedUp;
        }
    }

    /// Unlinked from the session list; the record is dead. Called only by
    /// the session after removal.
    pub(crate) fn mark_free(&self) {
        *self.state.lock() = RequestState::Free;
    }

    /// Whether a cancel has been observed-or-marked
    pub fn is_canceled(&self) -> bool {
        *self.state.lock() == RequestState::Canceled
    }

    /// Mark the request canceled and wake it if it is blocked.
    ///
    /// Canceling a freed record is a logic defect in the caller, not a
    /// recoverable condition.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        match *state {
            RequestState::Initializing
            | RequestState::Submitted
            | RequestState::Active
            | RequestState::CleanedUp => {
                *state = RequestState::Canceled;
            }
            RequestState::WaitingLock | RequestState::WaitingEvent => {
                *state = RequestState::Canceled;
                drop(state);
                self.wake.notify_waiters();
            }
            RequestState::EventOccurred
            | RequestState::Completed
            | RequestState::Canceled => {}
            RequestState::Free => panic!("cancel of freed request {}", self.id),
        }
    }

    /// Block until a byte-range lock is granted or the request is canceled.
    pub async fn wait_on_lock(&self) -> SmbResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                RequestState::Active => *state = RequestState::WaitingLock,
                RequestState::Canceled => return Err(SessionError::Cancelled),
                other => panic!("wait_on_lock from {:?}", other),
            }
        }
        loop {
            let notified = self.wake.notified();
            {
                let state = self.state.lock();
                match *state {
                    RequestState::Canceled => return Err(SessionError::Cancelled),
                    RequestState::WaitingLock => {}
                    _ => return Ok(()),
                }
            }
            notified.await;
        }
    }

    /// Grant the lock a request is blocked on.
    pub fn lock_granted(&self) {
        {
            let mut state = self.state.lock();
            if *state == RequestState::WaitingLock {
                *state = RequestState::Active;
            }
        }
        self.wake.notify_waiters();
    }

    /// Block until the awaited event fires or the request is canceled.
    pub async fn wait_for_event(&self) -> SmbResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                RequestState::Active => *state = RequestState::WaitingEvent,
                RequestState::Canceled => return Err(SessionError::Cancelled),
                other => panic!("wait_for_event from {:?}", other),
            }
        }
        loop {
            let notified = self.wake.notified();
            {
                let mut state = self.state.lock();
                match *state {
                    RequestState::Canceled => return Err(SessionError::Cancelled),
                    RequestState::EventOccurred => {
                        *state = RequestState::Active;
                        return Ok(());
                    }
                    RequestState::WaitingEvent => {}
                    _ => return Ok(()),
                }
            }
            notified.await;
        }
    }

    /// Fire the event a request is blocked on.
    pub fn notify_event(&self) {
        {
            let mut state = self.state.lock();
            if *state == RequestState::WaitingEvent {
                *state = RequestState::EventOccurred;
            }
        }
        self.wake.notify_waiters();
    }
}

/// The session's active-request list.
pub struct RequestList {
    requests: Mutex<Vec<std::sync::Arc<Request>>>,
    drained: Notify,
}

impl RequestList {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    pub fn push(&self, request: std::sync::Arc<Request>) {
        self.requests.lock().push(request);
    }

    /// Unlink a finalized request. The record is marked free only after it
    /// has left the list, so concurrent cancel sweeps never see a freed
    /// record.
    pub fn remove(&self, id: u64) {
        {
            let mut requests = self.requests.lock();
            requests.retain(|r| r.id != id);
        }
        self.drained.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Cancel every request matching the filters; `None` matches all.
    /// `except` spares the caller's own request, so a logoff or tree
    /// disconnect does not cancel the command that is performing it.
    pub fn cancel_matching(&self, uid: Option<u16>, tid: Option<u16>, except: Option<u64>) {
        let requests = self.requests.lock();
        for request in requests.iter() {
            if except == Some(request.id) {
                continue;
            }
            let uid_ok = uid.map_or(true, |u| request.header.uid == u);
            let tid_ok = tid.map_or(true, |t| request.header.tid == t);
            if uid_ok && tid_ok {
                request.cancel();
            }
        }
    }

    /// Cancel the request an NT_CANCEL names: same pid and mid.
    pub fn cancel_by_mid(&self, pid: u16, mid: u16) -> bool {
        let requests = self.requests.lock();
        let mut found = false;
        for request in requests.iter() {
            if request.header.pid == pid && request.header.mid == mid {
                request.cancel();
                found = true;
            }
        }
        found
    }

    /// Wait until every admitted request has been finalized.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            if self.requests.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for RequestList {
    fn default() -> Self {
        Self::new()
    }
}
