//! Node and tunnel configuration.
//!
//! Command-line parsing and key loading are the embedder's concern; this
//! module only defines the plain structs the node consumes, with defaults
//! matching the protocol constants.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::core::constants::{
    CANDIDATE_DIAL_TIMEOUT, HANDSHAKE_STEP_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_MISS_LIMIT,
    MIGRATION_QUIESCENCE, MIGRATION_TIMEOUT, REKEY_GRACE, REKEY_INTERVAL,
};
use crate::crypto::PeerId;

/// Per-session tunnel tunables.
///
/// Every field defaults to the protocol constant; embedders override only
/// what their deployment needs (tests shrink the timers).
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Heartbeat interval on the control channel.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat misses before the session degrades.
    pub heartbeat_miss_limit: u32,
    /// Session key lifetime before a rekey handshake is forced.
    pub rekey_interval: Duration,
    /// Old receive keys stay valid this long after a rekey swap.
    pub rekey_grace: Duration,
    /// Budget for each handshake message exchange.
    pub handshake_timeout: Duration,
    /// Per-candidate control connection attempt budget.
    pub dial_timeout: Duration,
    /// Direct-path migration attempt budget.
    pub migration_timeout: Duration,
    /// Quiescence window before the relay path is demoted.
    pub migration_quiescence: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_miss_limit: HEARTBEAT_MISS_LIMIT,
            rekey_interval: REKEY_INTERVAL,
            rekey_grace: REKEY_GRACE,
            handshake_timeout: HANDSHAKE_STEP_TIMEOUT,
            dial_timeout: CANDIDATE_DIAL_TIMEOUT,
            migration_timeout: MIGRATION_TIMEOUT,
            migration_quiescence: MIGRATION_QUIESCENCE,
        }
    }
}

/// Node-level configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Bind address for the TLS control listener.
    pub control_bind: SocketAddr,
    /// Bind address for the UDP data transport.
    pub data_bind: SocketAddr,
    /// Publicly reachable address to advertise to the directory, if known.
    pub advertised_ip: Option<IpAddr>,
    /// Whether this node forwards frames for peers without a direct path.
    pub is_public_relay: bool,
    /// Peers to dial as soon as the node starts.
    pub connect_eagerly: Vec<PeerId>,
    /// Per-session tunables.
    pub tunnel: TunnelConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            control_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8443),
            data_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9443),
            advertised_ip: None,
            is_public_relay: false,
            connect_eagerly: Vec::new(),
            tunnel: TunnelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = TunnelConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.rekey_interval, Duration::from_secs(3600));
        assert_eq!(cfg.heartbeat_miss_limit, 3);
    }

    #[test]
    fn test_node_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.control_bind.port(), 8443);
        assert_eq!(cfg.data_bind.port(), 9443);
        assert!(!cfg.is_public_relay);
        assert!(cfg.connect_eagerly.is_empty());
    }
}
