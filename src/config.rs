/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff policy for client reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff { min: Duration::from_millis(250), max: Duration::from_secs(30), multiplier: 2.0 }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (zero-based):
    /// `min * multiplier^attempt`, clamped to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let ms = (self.min.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Configuration surface shared by the TCP server, TCP client, and UDP
/// node. Plugins and handlers are attached to the node objects directly;
/// this struct carries only plain settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// IPv4 multicast group joined by UDP nodes.
    pub multicast_group: Ipv4Addr,
    /// Local interface for multicast membership; wildcard by default.
    pub interface: Ipv4Addr,
    /// Period of the automatic ADVERTISE_PEER tick.
    pub advertise_interval: Duration,
    /// Peers silent for longer than this are dropped from the registry.
    pub peer_timeout: Duration,
    /// Client reconnect backoff.
    pub reconnect: Backoff,
    /// Optional read timeout driving the client's auto-reconnect.
    pub read_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let advertise_interval = Duration::from_secs(30);
        NodeConfig {
            host: "127.0.0.1".to_string(),
            port: 8888,
            multicast_group: Ipv4Addr::new(224, 0, 0, 1),
            interface: Ipv4Addr::UNSPECIFIED,
            advertise_interval,
            peer_timeout: advertise_interval * 4,
            reconnect: Backoff::default(),
            read_timeout: None,
        }
    }
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> NodeConfig {
        NodeConfig { host: host.into(), port, ..NodeConfig::default() }
    }

    /// The `host:port` string handed to the socket layer.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_clamps_at_max() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(250));
        assert_eq!(b.delay(1), Duration::from_millis(500));
        assert_eq!(b.delay(30), Duration::from_secs(30));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = NodeConfig::new("0.0.0.0", 9999);
        config.read_timeout = Some(Duration::from_secs(5));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<NodeConfig>(&json).unwrap(), config);
    }

    #[test]
    fn defaults_match_protocol_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.multicast_group, Ipv4Addr::new(224, 0, 0, 1));
        assert_eq!(config.advertise_interval, Duration::from_secs(30));
        assert_eq!(config.peer_timeout, Duration::from_secs(120));
    }
}
