//! Per-session user objects
//!
//! A `User` is created in the logging-on state when the first SessionSetup
//! round for a fresh chain is admitted, and is promoted to logged-on only
//! when the external authority grants a token. Continuation rounds for the
//! same user are serialized by the per-user auth gate; rounds for different
//! users proceed independently.

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use crate::auth::AccessToken;

/// User lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// Authentication chain in progress; no token yet
    LoggingOn,
    /// Token granted; the identifier is valid for requests
    LoggedOn,
    /// Logged off (explicitly or by session teardown)
    LoggedOff,
}

/// A user slot within one session
pub struct User {
    /// Identifier issued to the client for this chain
    pub uid: u16,
    /// Owning session
    pub session_id: u64,
    /// Account name as presented in the first round
    pub account: String,
    /// Domain as presented in the first round
    pub domain: String,
    state: Mutex<UserState>,
    token: RwLock<Option<AccessToken>>,
    /// Serializes continuation rounds for this identifier across the
    /// authentication upcall await.
    pub auth_gate: AsyncMutex<()>,
}

impl User {
    /// Create a pending user for a fresh authentication chain.
    pub fn new_pending(uid: u16, session_id: u64, account: String, domain: String) -> Self {
        Self {
            uid,
            session_id,
            account,
            domain,
            state: Mutex::new(UserState::LoggingOn),
            token: RwLock::new(None),
            auth_gate: AsyncMutex::new(()),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> UserState {
        *self.state.lock()
    }

    /// Promote to logged-on with the granted token. Returns false if the
    /// user already left the logging-on state.
    pub fn logon(&self, token: AccessToken) -> bool {
        let mut state = self.state.lock();
        if *state != UserState::LoggingOn {
            return false;
        }
        *state = UserState::LoggedOn;
        *self.token.write() = Some(token);
        true
    }

    /// Move to logged-off. Returns true only for the transition that did
    /// the work, so the caller issues the logoff upcall exactly once.
    pub fn logoff(&self) -> bool {
        let mut state = self.state.lock();
        if *state == UserState::LoggedOff {
            return false;
        }
        *state = UserState::LoggedOff;
        true
    }

    /// Whether requests may run under this identifier
    pub fn is_logged_on(&self) -> bool {
        self.state() == UserState::LoggedOn
    }

    /// Whether the logon was mapped to guest
    pub fn is_guest(&self) -> bool {
        self.token.read().as_ref().map(|t| t.guest).unwrap_or(false)
    }

    /// Granted token, if logged on
    pub fn token(&self) -> Option<AccessToken> {
        self.token.read().clone()
    }
}
