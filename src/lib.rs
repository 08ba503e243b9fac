//! SMB/CIFS session layer
//!
//! Everything between the TCP socket and command execution: transport
//! framing for the NetBIOS session service (port 139) and direct-hosted
//! SMB (port 445), the session and request state machines, multi-round
//! authentication against an external [`Authenticator`], cooperative
//! request cancellation, signing sequence allocation, oplock break
//! delivery, and keep-alive enforcement.
//!
//! Command semantics live behind the [`CommandDispatcher`] trait; this
//! crate admits, sequences, cancels, and finalizes requests but never
//! interprets a command body itself.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod netbios;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod server;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod user;
pub mod worker;

pub use auth::{AccessToken, AuthLevel, AuthRequest, AuthResponse, Authenticator};
pub use config::ServerConfig;
pub use connection::Connection;
pub use error::{NtStatus, SessionError, SmbResult};
pub use registry::SessionRegistry;
pub use request::{Request, RequestState};
pub use server::SmbServer;
pub use session::{Session, SessionState};
pub use user::{User, UserState};
pub use worker::{CommandDispatcher, WorkerPool};
