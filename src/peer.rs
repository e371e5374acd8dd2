/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;

use bytes::Bytes;
use dashmap::DashMap;
use indexmap::IndexMap;

use crate::error::Result;
use crate::protocol::{AuthFields, Body, Message, MessageType};
use crate::util::ms_monotonic;

/// A remote participant known to this node.
///
/// Keyed by a stable `id`; `addrs` accumulates every endpoint the peer has
/// been observed at. `data` is opaque application payload serialized by a
/// [`PeerPlugin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Bytes,
    pub addrs: Vec<SocketAddr>,
    pub data: Bytes,
    /// Monotonic milliseconds of the most recent advertisement, zero for
    /// locally configured peers that have not been heard from.
    pub last_seen: i64,
}

impl Peer {
    pub fn new(id: impl Into<Bytes>, data: impl Into<Bytes>) -> Peer {
        Peer { id: id.into(), addrs: Vec::new(), data: data.into(), last_seen: 0 }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Peer {
        self.addrs.push(addr);
        self
    }
}

/// Serializer contract for the opaque `data` carried by peers.
///
/// Auth plugins that source per-peer material (a locking script, a public
/// key) read it through `parse_data`.
pub trait PeerPlugin: Send + Sync {
    fn encode_data(&self, data: &IndexMap<String, Bytes>) -> Bytes;
    fn parse_data(&self, peer: &Peer) -> Result<IndexMap<String, Bytes>>;
}

/// Default peer-data serializer: the same length-prefixed name/value wire
/// form used for auth fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPeerPlugin;

impl PeerPlugin for DefaultPeerPlugin {
    fn encode_data(&self, data: &IndexMap<String, Bytes>) -> Bytes {
        let mut fields = AuthFields::new();
        for (name, value) in data {
            fields.set(name.clone(), value.clone());
        }
        fields.encode()
    }

    fn parse_data(&self, peer: &Peer) -> Result<IndexMap<String, Bytes>> {
        let fields = AuthFields::decode(&peer.data)?;
        Ok(fields.iter().map(|(n, v)| (n.to_string(), v.clone())).collect())
    }
}

/// Concurrent registry of known peers, keyed by peer id.
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<Bytes, Peer>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry { peers: DashMap::new() }
    }

    /// Record an advertisement: create the peer or refresh its data and
    /// last-seen time, accumulating the observed address. Returns true if
    /// the peer was not previously known.
    pub fn observe(&self, id: Bytes, addr: Option<SocketAddr>, data: Bytes) -> bool {
        let now = ms_monotonic();
        match self.peers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let peer = e.get_mut();
                peer.data = data;
                peer.last_seen = now;
                if let Some(addr) = addr {
                    if !peer.addrs.contains(&addr) {
                        peer.addrs.push(addr);
                    }
                }
                false
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let mut peer = Peer::new(id, data);
                peer.last_seen = now;
                if let Some(addr) = addr {
                    peer.addrs.push(addr);
                }
                e.insert(peer);
                true
            }
        }
    }

    pub fn get(&self, id: &[u8]) -> Option<Peer> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn remove(&self, id: &[u8]) -> Option<Peer> {
        self.peers.remove(id).map(|(_, p)| p)
    }

    /// Find the peer that has been observed at the given address, if any.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Peer> {
        self.peers.iter().find(|p| p.addrs.contains(&addr)).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Copy out the current peer set. Fan-out operations iterate the
    /// snapshot, never the live map.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    /// Drop peers whose last advertisement is older than `max_age_ms`,
    /// returning the removed entries. Locally configured peers that were
    /// never heard from (`last_seen == 0`) are kept.
    pub fn reap(&self, max_age_ms: i64) -> Vec<Peer> {
        let cutoff = ms_monotonic() - max_age_ms;
        let stale: Vec<Bytes> = self
            .peers
            .iter()
            .filter(|p| p.last_seen > 0 && p.last_seen < cutoff)
            .map(|p| p.id.clone())
            .collect();
        stale.iter().filter_map(|id| self.peers.remove(id.as_ref()).map(|(_, p)| p)).collect()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

/// ADVERTISE_PEER: uri carries the local peer id, content its encoded data.
pub fn make_advertise_msg(local: &Peer) -> Message {
    Message::prepare(Body::prepare(local.id.clone(), local.data.clone()), MessageType::AdvertisePeer)
}

/// PEER_DISCOVERED: the acknowledging side's own id and data.
pub fn make_peer_discovered_msg(local: &Peer) -> Message {
    Message::prepare(Body::prepare(local.id.clone(), local.data.clone()), MessageType::PeerDiscovered)
}

/// DISCONNECT: graceful shutdown notice carrying the local peer id.
pub fn make_disconnect_msg(local: &Peer) -> Message {
    Message::prepare(Body::prepare(local.id.clone(), Bytes::new()), MessageType::Disconnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn observe_accumulates_addresses() {
        let reg = PeerRegistry::new();
        assert!(reg.observe(Bytes::from_static(b"a"), Some(addr(1000)), Bytes::new()));
        assert!(!reg.observe(Bytes::from_static(b"a"), Some(addr(1001)), Bytes::from_static(b"d")));
        assert!(!reg.observe(Bytes::from_static(b"a"), Some(addr(1000)), Bytes::from_static(b"d")));
        let peer = reg.get(b"a").unwrap();
        assert_eq!(peer.addrs, vec![addr(1000), addr(1001)]);
        assert_eq!(peer.data, Bytes::from_static(b"d"));
    }

    #[test]
    fn default_plugin_round_trips() {
        let plugin = DefaultPeerPlugin;
        let mut data = IndexMap::new();
        data.insert("lock".to_string(), Bytes::from_static(b"\x01\x02"));
        data.insert("name".to_string(), Bytes::from_static(b"alpha"));
        let peer = Peer::new(&b"p1"[..], plugin.encode_data(&data));
        assert_eq!(plugin.parse_data(&peer).unwrap(), data);
    }

    #[test]
    fn reap_keeps_configured_peers() {
        let reg = PeerRegistry::new();
        reg.observe(Bytes::from_static(b"live"), None, Bytes::new());
        let mut configured = Peer::new(&b"static"[..], &b""[..]);
        configured.last_seen = 0;
        reg.peers.insert(configured.id.clone(), configured);
        let removed = reg.reap(1_000_000);
        assert!(removed.is_empty());
        assert_eq!(reg.len(), 2);
    }
}
