//! Session layer error types
//!
//! Defines error types and the NTSTATUS codes surfaced by the session layer.

use std::io;

use thiserror::Error;

/// Session-layer result type
pub type SmbResult<T> = Result<T, SessionError>;

/// Session layer error types
#[derive(Debug, Error)]
pub enum SessionError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport framing error (bad type/length for the port)
    #[error("framing error: {0}")]
    Framing(String),

    /// Malformed NetBIOS session request
    #[error("session request rejected: {0}")]
    Handshake(String),

    /// The session is disconnected or terminated
    #[error("session not connected")]
    NotConnected,

    /// SessionSetup continuation with an identifier never issued
    #[error("no pending user with id {0}")]
    BadUserId(u16),

    /// The authentication upcall mechanism itself failed
    #[error("authentication upcall failed: {0}")]
    AuthUpcall(String),

    /// The external authority rejected the credentials
    #[error("authentication failed: {0}")]
    AuthFailed(NtStatus),

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The request was canceled while blocked
    #[error("request canceled")]
    Cancelled,

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Map to the NTSTATUS reported to the client.
    pub fn status(&self) -> NtStatus {
        match self {
            SessionError::BadUserId(_) => NtStatus::SmbBadUid,
            SessionError::AuthUpcall(_) => NtStatus::NetlogonNotStarted,
            SessionError::AuthFailed(status) => *status,
            SessionError::InvalidParameter(_) => NtStatus::InvalidParameter,
            SessionError::Cancelled => NtStatus::Cancelled,
            _ => NtStatus::InternalError,
        }
    }
}

/// NT Status codes (subset used by the session layer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    /// Success
    Success = 0x00000000,
    /// More processing required (multi-round authentication)
    MoreProcessingRequired = 0xC0000016,
    /// Invalid parameter
    InvalidParameter = 0xC000000D,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// Logon failure
    LogonFailure = 0xC000006D,
    /// Internal error
    InternalError = 0xC00000E5,
    /// Cancelled
    Cancelled = 0xC0000120,
    /// Netlogon service not started (upcall transport failure)
    NetlogonNotStarted = 0xC0000192,
    /// User session deleted
    UserSessionDeleted = 0xC0000203,
    /// SMB bad UID (legacy DOS-class status)
    SmbBadUid = 0x005B0002,
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(&self) -> bool {
        (*self as u32) < 0x40000000
    }

    /// Check if this is an error
    pub fn is_error(&self) -> bool {
        (*self as u32) >= 0x80000000
    }

    /// Get the raw value
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Create from raw value
    pub fn from_u32(val: u32) -> Self {
        match val {
            0x00000000 => Self::Success,
            0xC0000016 => Self::MoreProcessingRequired,
            0xC0000022 => Self::AccessDenied,
            0xC000006D => Self::LogonFailure,
            0xC00000E5 => Self::InternalError,
            0xC0000120 => Self::Cancelled,
            0xC0000192 => Self::NetlogonNotStarted,
            0xC0000203 => Self::UserSessionDeleted,
            0x005B0002 => Self::SmbBadUid,
            _ => Self::InvalidParameter,
        }
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntstatus_classes() {
        assert!(NtStatus::Success.is_success());
        assert!(!NtStatus::Success.is_error());
        assert!(NtStatus::LogonFailure.is_error());
        assert!(NtStatus::SmbBadUid.is_success());
    }

    #[test]
    fn test_ntstatus_roundtrip() {
        assert_eq!(
            NtStatus::from_u32(0xC0000016),
            NtStatus::MoreProcessingRequired
        );
        assert_eq!(NtStatus::from_u32(0x00000000), NtStatus::Success);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(SessionError::BadUserId(7).status(), NtStatus::SmbBadUid);
        assert_eq!(
            SessionError::AuthUpcall("door closed".into()).status(),
            NtStatus::NetlogonNotStarted
        );
        assert_eq!(
            SessionError::AuthFailed(NtStatus::LogonFailure).status(),
            NtStatus::LogonFailure
        );
    }
}
