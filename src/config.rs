//! Server configuration
//!
//! Configuration types for the session layer.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Default NetBIOS session service port
pub const NETBIOS_SSN_PORT: u16 = 139;

/// Default direct-hosted SMB port
pub const DIRECT_TCP_PORT: u16 = 445;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Direct-TCP bind address (port 445 style, no NetBIOS handshake)
    pub direct_addr: SocketAddr,
    /// NetBIOS session-service bind address; `None` disables the listener
    pub netbios_addr: Option<SocketAddr>,
    /// Keep-alive budget in sweep ticks; 0 means idle sessions never drop
    pub keep_alive_ticks: u32,
    /// Interval between keep-alive sweeps, in seconds
    pub sweep_interval_secs: u64,
    /// Maximum concurrently executing requests across all sessions
    pub max_workers: usize,
    /// Maximum admitted message size (payload bytes after the 4-byte header)
    pub max_message_size: u32,
    /// Whether extended security (multi-round SessionSetup) is negotiated
    pub extended_security: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            direct_addr: format!("0.0.0.0:{}", DIRECT_TCP_PORT).parse().unwrap(),
            netbios_addr: Some(format!("0.0.0.0:{}", NETBIOS_SSN_PORT).parse().unwrap()),
            keep_alive_ticks: 5400, // 90 minutes of one-second ticks
            sweep_interval_secs: 1,
            max_workers: 64,
            max_message_size: 0x1FFFF, // largest NetBIOS-framable message
            extended_security: true,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the direct-TCP bind address
    pub fn direct(mut self, addr: SocketAddr) -> Self {
        self.direct_addr = addr;
        self
    }

    /// Set the NetBIOS session-service bind address
    pub fn netbios(mut self, addr: SocketAddr) -> Self {
        self.netbios_addr = Some(addr);
        self
    }

    /// Disable the NetBIOS listener entirely
    pub fn disable_netbios(mut self) -> Self {
        self.netbios_addr = None;
        self
    }

    /// Set the keep-alive budget in sweep ticks (0 = never drop idle)
    pub fn keep_alive_ticks(mut self, ticks: u32) -> Self {
        self.keep_alive_ticks = ticks;
        self
    }

    /// Set the worker pool size
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Disable extended security (single-round authentication only)
    pub fn disable_extended_security(mut self) -> Self {
        self.extended_security = false;
        self
    }

    /// Keep-alive counter value sessions start from.
    ///
    /// A configured budget of 0 pins the counter so the sweep never
    /// decrements it.
    pub fn keep_alive_initial(&self) -> u32 {
        if self.keep_alive_ticks == 0 {
            u32::MAX
        } else {
            self.keep_alive_ticks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new()
            .direct("127.0.0.1:10445".parse().unwrap())
            .max_workers(8)
            .disable_netbios();

        assert_eq!(config.direct_addr.port(), 10445);
        assert_eq!(config.max_workers, 8);
        assert!(config.netbios_addr.is_none());
    }

    #[test]
    fn test_keep_alive_disabled() {
        let config = ServerConfig::new().keep_alive_ticks(0);
        assert_eq!(config.keep_alive_initial(), u32::MAX);

        let config = ServerConfig::new().keep_alive_ticks(30);
        assert_eq!(config.keep_alive_initial(), 30);
    }
}
