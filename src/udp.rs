/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthPlugin, PluginContext};
use crate::cipher::CipherPlugin;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::handler::{handler, HandlerEntry, HandlerFn, IntoHandlerKey, Registry};
use crate::peer::{
    make_advertise_msg, make_disconnect_msg, make_peer_discovered_msg, DefaultPeerPlugin, Peer,
    PeerPlugin, PeerRegistry,
};
use crate::pipeline::{
    apply_outbound, apply_response, receive_inbound, Inbound, NodePlugins, ReceiveOptions,
    SendOptions,
};
use crate::protocol::{Body, Message, MessageType, MessageTypeTable, DATAGRAM_SIZE_MAX};

/// Dispatch context handed to UDP handlers: the node and the datagram's
/// sender address.
#[derive(Clone)]
pub struct UdpContext {
    pub node: UdpNode,
    pub addr: SocketAddr,
}

struct UdpInner {
    config: NodeConfig,
    registry: Registry<UdpContext>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    subscriptions: DashMap<Bytes, HashSet<SocketAddr>>,
    auth: RwLock<Option<Arc<dyn AuthPlugin>>>,
    cipher: RwLock<Option<Arc<dyn CipherPlugin>>>,
    peer_plugin: RwLock<Arc<dyn PeerPlugin>>,
    local_peer: RwLock<Option<Peer>>,
    types: RwLock<Arc<MessageTypeTable>>,
    peers: PeerRegistry,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    advertise_task: Mutex<Option<JoinHandle<()>>>,
    peer_mgmt: AtomicBool,
}

/// Connectionless message node: one UDP socket joined to an IPv4 multicast
/// group, with the same inbound/response pipelines as the TCP server.
///
/// There is no per-connection state; responses go to the datagram's sender
/// address, and each inbound datagram must contain one whole frame or it
/// is dropped.
#[derive(Clone)]
pub struct UdpNode {
    inner: Arc<UdpInner>,
}

impl UdpNode {
    pub fn new(config: NodeConfig) -> UdpNode {
        let node = UdpNode {
            inner: Arc::new(UdpInner {
                config,
                registry: Registry::default(),
                socket: RwLock::new(None),
                subscriptions: DashMap::new(),
                auth: RwLock::new(None),
                cipher: RwLock::new(None),
                peer_plugin: RwLock::new(Arc::new(DefaultPeerPlugin)),
                local_peer: RwLock::new(None),
                types: RwLock::new(Arc::new(MessageTypeTable::reserved().clone())),
                peers: PeerRegistry::new(),
                recv_task: Mutex::new(None),
                advertise_task: Mutex::new(None),
                peer_mgmt: AtomicBool::new(false),
            }),
        };
        node.install_subscription_handlers();
        node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn set_auth_plugin(&self, plugin: Option<Arc<dyn AuthPlugin>>) {
        *self.inner.auth.write() = plugin;
    }

    pub fn set_cipher_plugin(&self, plugin: Option<Arc<dyn CipherPlugin>>) {
        *self.inner.cipher.write() = plugin;
    }

    pub fn set_peer_plugin(&self, plugin: Arc<dyn PeerPlugin>) {
        *self.inner.peer_plugin.write() = plugin;
    }

    pub fn set_local_peer(&self, peer: Option<Peer>) {
        *self.inner.local_peer.write() = peer;
    }

    pub fn local_peer(&self) -> Option<Peer> {
        self.inner.local_peer.read().clone()
    }

    pub fn set_message_types(&self, types: Arc<MessageTypeTable>) {
        *self.inner.types.write() = types;
    }

    pub fn set_default_handler(&self, func: HandlerFn<UdpContext>) {
        self.inner.registry.set_default(func);
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    /// Number of addresses currently subscribed to a URI.
    pub fn subscriber_count(&self, uri: &[u8]) -> usize {
        self.inner.subscriptions.get(uri).map(|s| s.len()).unwrap_or(0)
    }

    /// Register a persistent handler.
    pub fn on(&self, key: impl IntoHandlerKey, func: HandlerFn<UdpContext>) {
        self.inner.registry.add(key, HandlerEntry::new(func));
    }

    pub fn on_with_plugins(
        &self,
        key: impl IntoHandlerKey,
        func: HandlerFn<UdpContext>,
        auth: Option<Arc<dyn AuthPlugin>>,
        cipher: Option<Arc<dyn CipherPlugin>>,
    ) {
        self.inner.registry.add(key, HandlerEntry::with_plugins(func, auth, cipher));
    }

    /// Register a one-shot handler, consumed on its first match.
    pub fn once(&self, key: impl IntoHandlerKey, func: HandlerFn<UdpContext>) {
        self.inner.registry.add_once(key, HandlerEntry::new(func));
    }

    pub fn remove_handler(&self, key: impl IntoHandlerKey) -> bool {
        self.inner.registry.remove(key)
    }

    /// Bind the wildcard address on the configured port, join the
    /// multicast group on the configured interface, and start the receive
    /// task. Returns once the socket is live.
    pub async fn start(&self) -> Result<()> {
        use socket2::{Domain, Protocol, Socket, Type};

        let port = self.inner.config.port;
        let group = self.inner.config.multicast_group;
        let interface = self.inner.config.interface;
        if !group.is_multicast() {
            return Err(Error::InvalidParameter("multicast group is not a multicast address"));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_multicast_loop_v4(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        *self.inner.socket.write() = Some(socket.clone());
        info!(port, group = %group, "udp node joined multicast group");

        let node = self.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "datagram receive failed");
                        continue;
                    }
                };
                node.handle_datagram(&buf[..len], addr).await;
            }
        });
        if let Some(old) = self.inner.recv_task.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// Stop the receive and advertise tasks and drop the socket.
    pub fn stop(&self) {
        if let Some(task) = self.inner.recv_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.advertise_task.lock().take() {
            task.abort();
        }
        *self.inner.socket.write() = None;
        self.inner.subscriptions.clear();
    }

    /// Subscribe a sender address to a URI.
    pub fn subscribe(&self, uri: impl Into<Bytes>, addr: SocketAddr) {
        let uri = uri.into();
        debug!(uri = ?uri, addr = %addr, "subscribe");
        self.inner.subscriptions.entry(uri).or_default().insert(addr);
    }

    /// Remove an address from a URI's subscription set; empty sets are
    /// dropped.
    pub fn unsubscribe(&self, uri: impl Into<Bytes>, addr: SocketAddr) {
        let uri = uri.into();
        debug!(uri = ?uri, addr = %addr, "unsubscribe");
        if let Some(mut set) = self.inner.subscriptions.get_mut(&uri) {
            set.remove(&addr);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.inner.subscriptions.remove_if(&uri, |_, s| s.is_empty());
            }
        }
    }

    /// Apply the send pipeline and send one datagram (unicast or, with the
    /// group address, multicast).
    pub async fn send(&self, message: Message, addr: SocketAddr, opts: SendOptions) -> Result<()> {
        let prepared = self.prepare_outbound(message, &opts, Some(addr))?;
        self.send_encoded(&prepared.encode(), addr).await
    }

    /// Send to every known peer at its most recently observed address.
    pub async fn broadcast(&self, message: Message, opts: SendOptions) -> Result<()> {
        let prepared = self.prepare_outbound(message, &opts, None)?;
        let data = prepared.encode();
        for peer in self.inner.peers.snapshot() {
            if let Some(addr) = peer.addrs.last() {
                if let Err(e) = self.send_encoded(&data, *addr).await {
                    debug!(addr = %addr, error = %e, "broadcast send failed");
                }
            }
        }
        Ok(())
    }

    /// Send to the configured multicast group, optionally on another port.
    pub async fn multicast(&self, message: Message, port: Option<u16>, opts: SendOptions) -> Result<()> {
        let addr = SocketAddr::from((
            self.inner.config.multicast_group,
            port.unwrap_or(self.inner.config.port),
        ));
        let prepared = self.prepare_outbound(message, &opts, None)?;
        self.send_encoded(&prepared.encode(), addr).await
    }

    /// Send to every subscriber of a URI. Failed sends silently remove the
    /// address from that subscription set.
    pub async fn notify(&self, uri: impl Into<Bytes>, message: Message, opts: SendOptions) -> Result<()> {
        let uri = uri.into();
        let addrs: Vec<SocketAddr> = match self.inner.subscriptions.get(&uri) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(()),
        };
        let prepared = self.prepare_outbound(message, &opts, None)?;
        let data = prepared.encode();
        debug!(uri = ?uri, count = addrs.len(), "notify");
        for addr in addrs {
            if let Err(e) = self.send_encoded(&data, addr).await {
                debug!(addr = %addr, error = %e, "notify send failed, dropping subscriber");
                if let Some(mut set) = self.inner.subscriptions.get_mut(&uri) {
                    set.remove(&addr);
                }
            }
        }
        Ok(())
    }

    /// Install the peer-management handlers, multicast an advertisement
    /// immediately, and start the periodic advertise/reap tick.
    pub fn manage_peers_automatically(&self) {
        if self.inner.peer_mgmt.swap(true, Ordering::SeqCst) {
            return;
        }
        self.on(
            MessageType::AdvertisePeer,
            handler(|message: Message, ctx: UdpContext| async move {
                let node = ctx.node;
                let id = message.body.uri.clone();
                let local = node.inner.local_peer.read().clone();
                if local.as_ref().map_or(false, |l| l.id == id) {
                    return None;
                }
                let new = node.inner.peers.observe(id, Some(ctx.addr), message.body.content.clone());
                if new {
                    info!(addr = %ctx.addr, "peer discovered via advertisement");
                }
                local.map(|l| make_peer_discovered_msg(&l))
            }),
        );
        self.on(
            MessageType::PeerDiscovered,
            handler(|message: Message, ctx: UdpContext| async move {
                let id = message.body.uri.clone();
                let local = ctx.node.inner.local_peer.read().clone();
                if local.map_or(false, |l| l.id == id) {
                    return None;
                }
                ctx.node.inner.peers.observe(id, Some(ctx.addr), message.body.content.clone());
                None
            }),
        );
        self.on(
            MessageType::Disconnect,
            handler(|message: Message, ctx: UdpContext| async move {
                if let Some(peer) = ctx.node.inner.peers.remove(&message.body.uri) {
                    for addr in peer.addrs {
                        for mut entry in ctx.node.inner.subscriptions.iter_mut() {
                            entry.value_mut().remove(&addr);
                        }
                    }
                    debug!(addr = %ctx.addr, "peer disconnected");
                }
                None
            }),
        );

        let node = self.clone();
        let interval = self.inner.config.advertise_interval;
        let timeout = self.inner.config.peer_timeout;
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // interval's first tick completes immediately, which doubles
                // as the initial advertisement
                tick.tick().await;
                let local = node.inner.local_peer.read().clone();
                if let Some(local) = local {
                    if let Err(e) =
                        node.multicast(make_advertise_msg(&local), None, SendOptions::default()).await
                    {
                        debug!(error = %e, "peer advertisement failed");
                    }
                }
                for peer in node.inner.peers.reap(timeout.as_millis() as i64) {
                    debug!(id = ?peer.id, "reaped stale peer");
                }
            }
        });
        *self.inner.advertise_task.lock() = Some(task);
    }

    /// Cancel the advertise tick, multicast DISCONNECT, and remove the
    /// peer-management handlers.
    pub async fn stop_peer_management(&self) {
        if !self.inner.peer_mgmt.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.advertise_task.lock().take() {
            task.abort();
        }
        let local = self.inner.local_peer.read().clone();
        if let Some(local) = local {
            let _ = self.multicast(make_disconnect_msg(&local), None, SendOptions::default()).await;
        }
        self.inner.registry.remove(MessageType::AdvertisePeer);
        self.inner.registry.remove(MessageType::PeerDiscovered);
        self.inner.registry.remove(MessageType::Disconnect);
        self.inner.peers.clear();
    }

    fn install_subscription_handlers(&self) {
        self.on(
            MessageType::SubscribeUri,
            handler(|message: Message, ctx: UdpContext| async move {
                ctx.node.subscribe(message.body.uri.clone(), ctx.addr);
                Some(Message::prepare(
                    Body::prepare(message.body.uri.clone(), Bytes::new()),
                    MessageType::ConfirmSubscribe,
                ))
            }),
        );
        self.on(
            MessageType::UnsubscribeUri,
            handler(|message: Message, ctx: UdpContext| async move {
                ctx.node.unsubscribe(message.body.uri.clone(), ctx.addr);
                Some(Message::prepare(
                    Body::prepare(message.body.uri.clone(), Bytes::new()),
                    MessageType::ConfirmUnsubscribe,
                ))
            }),
        );
    }

    async fn send_encoded(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        if data.len() > DATAGRAM_SIZE_MAX {
            return Err(Error::InvalidParameter("message exceeds datagram size"));
        }
        let socket = self.inner.socket.read().clone().ok_or(Error::ConnectionLost)?;
        socket.send_to(data, addr).await?;
        Ok(())
    }

    fn plugins(&self) -> NodePlugins {
        NodePlugins { auth: self.inner.auth.read().clone(), cipher: self.inner.cipher.read().clone() }
    }

    fn prepare_outbound(
        &self,
        message: Message,
        opts: &SendOptions,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Message> {
        let node = self.plugins();
        let local = self.inner.local_peer.read().clone();
        let remote = remote_addr.and_then(|a| self.inner.peers.find_by_addr(a));
        let peer_plugin = self.inner.peer_plugin.read().clone();
        let ctx = PluginContext {
            local_peer: local.as_ref(),
            remote_peer: remote.as_ref(),
            peer_plugin: Some(&*peer_plugin),
        };
        apply_outbound(message, opts, &node, &ctx)
    }

    /// Decode and dispatch one datagram. Malformed or corrupt datagrams
    /// are dropped; a failed outer auth check drops the datagram, a failed
    /// handler-level check is answered with that plugin's error.
    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let message = match Message::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(addr = %addr, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        if !self.inner.types.read().contains(message.header.message_type) {
            debug!(message_type = message.header.message_type, "unknown message type");
            return;
        }
        debug!(addr = %addr, checksum = message.header.checksum, "received datagram");

        let node = self.plugins();
        let local = self.inner.local_peer.read().clone();
        let remote = self.inner.peers.find_by_addr(addr);
        let peer_plugin = self.inner.peer_plugin.read().clone();
        let ctx = PluginContext {
            local_peer: local.as_ref(),
            remote_peer: remote.as_ref(),
            peer_plugin: Some(&*peer_plugin),
        };

        let (message, entry) = match receive_inbound(
            message,
            ReceiveOptions::default(),
            &node,
            &self.inner.registry,
            &ctx,
        ) {
            Inbound::Reject { error, outer } => {
                if !outer {
                    let _ = self.send_encoded(&error.encode(), addr).await;
                }
                return;
            }
            Inbound::Drop => return,
            Inbound::Ready { message, entry } => {
                (message, entry.unwrap_or_else(|| self.inner.registry.default_entry()))
            }
        };

        let uctx = UdpContext { node: self.clone(), addr };
        let invocation = std::panic::AssertUnwindSafe((entry.func)(message, uctx)).catch_unwind();
        let response = match invocation.await {
            Ok(r) => r,
            Err(_) => {
                error!(addr = %addr, "handler panicked");
                return;
            }
        };

        if let Some(response) = response {
            let response = match apply_response(response, &entry, &node, &ctx) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "response pipeline failed");
                    return;
                }
            };
            if let Err(e) = self.send_encoded(&response.encode(), addr).await {
                debug!(addr = %addr, error = %e, "response send failed");
            }
        }
    }
}
