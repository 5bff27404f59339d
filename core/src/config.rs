// Node configuration
//
// Plain serde structs with defaults matching the reference deployment.
// The CLI layers its config file and flags on top of these.

use crate::transport::gate::AddressGate;
use crate::transport::AddressError;
use libp2p::connection_limits::ConnectionLimits;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application protocol spoken on session streams
pub const DEFAULT_PROTOCOL: &str = "/node-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundLimits {
    /// Concurrent inbound sessions before new streams are dropped
    pub max_inbound_streams: usize,
    /// Accept streams from peers only reachable through a relay
    pub run_on_limited_connection: bool,
}

impl Default for InboundLimits {
    fn default() -> Self {
        Self {
            max_inbound_streams: 32,
            run_on_limited_connection: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Concurrent outbound sessions per remote peer
    pub max_outbound_streams: usize,
    pub run_on_limited_connection: bool,
    /// Wait for full protocol negotiation before the session is usable
    pub negotiate_fully: bool,
    pub dial_timeout_secs: u64,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            max_outbound_streams: 10,
            run_on_limited_connection: true,
            negotiate_fully: true,
            dial_timeout_secs: 30,
        }
    }
}

impl DialOptions {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    pub poll_interval_ms: u64,
    /// Give up waiting for the circuit address after this long. `None` waits forever.
    pub timeout_secs: Option<u64>,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_secs: None,
        }
    }
}

impl ReservationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Swarm-wide connection caps. `None` leaves a count unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimitsConfig {
    pub max_established: Option<u32>,
    pub max_pending_incoming: Option<u32>,
}

impl Default for ConnectionLimitsConfig {
    fn default() -> Self {
        Self {
            max_established: Some(300),
            max_pending_incoming: Some(50),
        }
    }
}

impl ConnectionLimitsConfig {
    pub fn to_libp2p(&self) -> ConnectionLimits {
        ConnectionLimits::default()
            .with_max_established(self.max_established)
            .with_max_pending_incoming(self.max_pending_incoming)
    }
}

/// Settings for a NATed peer node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Relay multiaddrs including `/p2p/<relay-id>`
    pub relays: Vec<String>,
    /// Local listen addresses. Empty means relay-only.
    pub listen_addrs: Vec<String>,
    pub protocol: String,
    pub reservation: ReservationConfig,
    pub inbound: InboundLimits,
    pub dial: DialOptions,
    pub connections: ConnectionLimitsConfig,
    pub idle_connection_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            listen_addrs: Vec::new(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            reservation: ReservationConfig::default(),
            inbound: InboundLimits::default(),
            dial: DialOptions::default(),
            connections: ConnectionLimitsConfig::default(),
            idle_connection_timeout_secs: 300,
        }
    }
}

fn parse_all(texts: &[String]) -> Result<Vec<Multiaddr>, AddressError> {
    texts
        .iter()
        .map(|text| {
            text.trim()
                .parse::<Multiaddr>()
                .map_err(|e| AddressError::Malformed {
                    input: text.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

impl NodeConfig {
    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relays.push(relay.into());
        self
    }

    pub fn relay_addrs(&self) -> Result<Vec<Multiaddr>, AddressError> {
        parse_all(&self.relays)
    }

    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>, AddressError> {
        parse_all(&self.listen_addrs)
    }

    /// Gate permitting circuits and the configured relay hosts
    pub fn gate(&self) -> Result<AddressGate, AddressError> {
        Ok(AddressGate::for_relays(&self.relay_addrs()?))
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.protocol, "/node-1");
        assert_eq!(config.inbound.max_inbound_streams, 32);
        assert_eq!(config.dial.max_outbound_streams, 10);
        assert!(config.dial.negotiate_fully);
        assert_eq!(config.reservation.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.reservation.timeout(), None);
        assert_eq!(config.connections.max_established, Some(300));
        assert_eq!(config.connections.max_pending_incoming, Some(50));
    }

    #[test]
    fn test_connection_limits_can_be_lifted() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"connections":{"max_established":null}}"#).unwrap();
        assert_eq!(config.connections.max_established, None);
        assert_eq!(config.connections.max_pending_incoming, Some(50));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"relays":["/ip4/13.60.15.36/tcp/3001/ws"],"dial":{"max_outbound_streams":2}}"#)
                .unwrap();
        assert_eq!(config.dial.max_outbound_streams, 2);
        assert_eq!(config.dial.dial_timeout_secs, 30);
        assert_eq!(config.relay_addrs().unwrap().len(), 1);
        assert!(config.gate().unwrap().relay_hosts().any(|h| h == "13.60.15.36"));
    }

    #[test]
    fn test_bad_relay_is_reported() {
        let config = NodeConfig::default().with_relay("nonsense");
        assert!(matches!(
            config.relay_addrs(),
            Err(AddressError::Malformed { .. })
        ));
    }
}
