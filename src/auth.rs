//! Authentication upcall boundary
//!
//! The session layer never evaluates credentials itself. Each SessionSetup
//! round is packaged into an [`AuthRequest`] and handed to an external
//! [`Authenticator`]; the verdict comes back as an [`AuthResponse`]. A
//! failure of the upcall mechanism itself (as opposed to a rejection) is a
//! distinct error so callers can report it as a service outage.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{NtStatus, SmbResult};

/// How the client proved its identity in this round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// Pre-extended-security: responses computed against the session challenge
    Challenge,
    /// Extended security: opaque security blob rounds
    Extended,
}

/// One authentication round, as presented to the external authority
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Session the round belongs to
    pub session_id: u64,
    /// The pending user identifier issued for this chain
    pub user_id: u16,
    /// Account name from the setup request (may be empty under extended security)
    pub account: String,
    /// Domain from the setup request
    pub domain: String,
    /// Client machine name from the session handshake
    pub workstation: String,
    /// Client address
    pub peer_addr: SocketAddr,
    /// Server address the client connected to
    pub local_addr: SocketAddr,
    /// Challenge issued at negotiate time
    pub challenge: Bytes,
    /// Security blob (or challenge responses) from this round
    pub secblob: Option<Bytes>,
    /// Proof mechanism in use
    pub level: AuthLevel,
}

/// Identity granted by a successful authentication
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Canonical account name
    pub account_name: String,
    /// Canonical domain
    pub domain: String,
    /// Whether the logon was mapped to guest
    pub guest: bool,
    /// Session key for signing, when the mechanism produced one
    pub session_key: Option<Bytes>,
}

/// Verdict for one authentication round
#[derive(Debug, Clone)]
pub struct AuthResponse {
    /// Round outcome: success, more-processing-required, or a failure status
    pub status: NtStatus,
    /// Granted token; present only on success
    pub token: Option<AccessToken>,
    /// Blob to return to the client for the next round
    pub secblob: Option<Bytes>,
}

impl AuthResponse {
    /// A successful verdict carrying the granted token.
    pub fn success(token: AccessToken) -> Self {
        Self {
            status: NtStatus::Success,
            token: Some(token),
            secblob: None,
        }
    }

    /// An intermediate verdict: the client must send another round.
    pub fn more_processing(secblob: Bytes) -> Self {
        Self {
            status: NtStatus::MoreProcessingRequired,
            token: None,
            secblob: Some(secblob),
        }
    }

    /// A terminal rejection.
    pub fn failure(status: NtStatus) -> Self {
        Self {
            status,
            token: None,
            secblob: None,
        }
    }
}

/// External authentication authority.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Evaluate one authentication round. An `Err` means the upcall
    /// transport failed, not that the credentials were rejected.
    async fn authenticate(&self, request: &AuthRequest) -> SmbResult<AuthResponse>;

    /// Notification that an authenticated user logged off or its session
    /// went away. Best effort.
    async fn logoff(&self, _session_id: u64, _user_id: u16) {}
}
