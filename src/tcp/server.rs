/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Notify;
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
use crate::protocol::{
    make_error_msg, read_message, Body, Message, MessageType, MessageTypeTable,
};

/// One accepted client connection: the write half behind an async mutex
/// plus its identity. Subscription sets refer to connections by id only,
/// so closing a connection cannot leave a reference cycle.
pub struct Connection {
    pub id: u64,
    pub addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl Connection {
    pub(crate) async fn write_frame(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Dispatch context handed to server handlers: the server itself (for
/// subscribe/notify/broadcast calls) and the originating connection.
#[derive(Clone)]
pub struct ServerContext {
    pub server: TcpServer,
    pub connection: Arc<Connection>,
}

struct ServerInner {
    config: NodeConfig,
    registry: Registry<ServerContext>,
    clients: DashMap<u64, Arc<Connection>>,
    conn_tasks: DashMap<u64, JoinHandle<()>>,
    subscriptions: DashMap<Bytes, HashSet<u64>>,
    next_id: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    auth: RwLock<Option<Arc<dyn AuthPlugin>>>,
    cipher: RwLock<Option<Arc<dyn CipherPlugin>>>,
    peer_plugin: RwLock<Arc<dyn PeerPlugin>>,
    local_peer: RwLock<Option<Peer>>,
    types: RwLock<Arc<MessageTypeTable>>,
    peers: PeerRegistry,
    advertise_task: Mutex<Option<JoinHandle<()>>>,
    peer_mgmt: AtomicBool,
    shutdown: Notify,
}

/// Framed TCP message server: accepts connections, runs one sequential
/// read-dispatch-respond loop per connection, and offers per-URI
/// subscription fan-out via [`TcpServer::notify`] and whole-roster
/// [`TcpServer::broadcast`].
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(config: NodeConfig) -> TcpServer {
        let server = TcpServer {
            inner: Arc::new(ServerInner {
                config,
                registry: Registry::default(),
                clients: DashMap::new(),
                conn_tasks: DashMap::new(),
                subscriptions: DashMap::new(),
                next_id: AtomicU64::new(1),
                local_addr: Mutex::new(None),
                auth: RwLock::new(None),
                cipher: RwLock::new(None),
                peer_plugin: RwLock::new(Arc::new(DefaultPeerPlugin)),
                local_peer: RwLock::new(None),
                types: RwLock::new(Arc::new(MessageTypeTable::reserved().clone())),
                peers: PeerRegistry::new(),
                advertise_task: Mutex::new(None),
                peer_mgmt: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        };
        server.install_subscription_handlers();
        server
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

    pub fn set_default_handler(&self, func: HandlerFn<ServerContext>) {
        self.inner.registry.set_default(func);
    }

    /// Register a persistent handler.
    pub fn on(&self, key: impl IntoHandlerKey, func: HandlerFn<ServerContext>) {
        self.inner.registry.add(key, HandlerEntry::new(func));
    }

    /// Register a persistent handler with inner-layer plugin overrides.
    pub fn on_with_plugins(
        &self,
        key: impl IntoHandlerKey,
        func: HandlerFn<ServerContext>,
        auth: Option<Arc<dyn AuthPlugin>>,
        cipher: Option<Arc<dyn CipherPlugin>>,
    ) {
        self.inner.registry.add(key, HandlerEntry::with_plugins(func, auth, cipher));
    }

    /// Register a one-shot handler, consumed on its first match.
    pub fn once(&self, key: impl IntoHandlerKey, func: HandlerFn<ServerContext>) {
        self.inner.registry.add_once(key, HandlerEntry::new(func));
    }

    pub fn once_with_plugins(
        &self,
        key: impl IntoHandlerKey,
        func: HandlerFn<ServerContext>,
        auth: Option<Arc<dyn AuthPlugin>>,
        cipher: Option<Arc<dyn CipherPlugin>>,
    ) {
        self.inner.registry.add_once(key, HandlerEntry::with_plugins(func, auth, cipher));
    }

    pub fn remove_handler(&self, key: impl IntoHandlerKey) -> bool {
        self.inner.registry.remove(key)
    }

    /// The bound address once [`TcpServer::start`] has bound the listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Number of connections currently subscribed to a URI.
    pub fn subscriber_count(&self, uri: &[u8]) -> usize {
        self.inner.subscriptions.get(uri).map(|s| s.len()).unwrap_or(0)
    }

    /// Bind and serve until [`TcpServer::stop`] is called or the task
    /// running this future is cancelled.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.inner.config.addr()).await?;
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);
        info!(addr = %local, "server listening");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = Arc::new(Connection { id, addr, writer: tokio::sync::Mutex::new(writer) });
                    self.inner.clients.insert(id, conn.clone());
                    debug!(addr = %addr, id, "client connected");
                    let server = self.clone();
                    let task = tokio::spawn(async move {
                        server.run_connection(conn, reader).await;
                    });
                    self.inner.conn_tasks.insert(id, task);
                }
            }
        }
        info!("server stopped");
        Ok(())
    }

    /// Stop serving: ends the accept loop, aborts every connection task,
    /// and clears the roster and subscription table.
    pub fn stop(&self) {
        self.inner.shutdown.notify_waiters();
        if let Some(task) = self.inner.advertise_task.lock().take() {
            task.abort();
        }
        for entry in self.inner.conn_tasks.iter() {
            entry.value().abort();
        }
        self.inner.conn_tasks.clear();
        self.inner.clients.clear();
        self.inner.subscriptions.clear();
    }

    /// Subscribe a connection to a URI.
    pub fn subscribe(&self, uri: impl Into<Bytes>, conn: &Arc<Connection>) {
        let uri = uri.into();
        debug!(uri = ?uri, id = conn.id, "subscribe");
        self.inner.subscriptions.entry(uri).or_default().insert(conn.id);
    }

    /// Remove a connection from a URI's subscription set; empty sets are
    /// dropped.
    pub fn unsubscribe(&self, uri: impl Into<Bytes>, conn: &Arc<Connection>) {
        let uri = uri.into();
        debug!(uri = ?uri, id = conn.id, "unsubscribe");
        if let Some(mut set) = self.inner.subscriptions.get_mut(&uri) {
            set.remove(&conn.id);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.inner.subscriptions.remove_if(&uri, |_, s| s.is_empty());
            }
        }
    }

    /// Apply the send pipeline and write to a single connection.
    pub async fn send(&self, conn: &Arc<Connection>, message: Message, opts: SendOptions) -> Result<()> {
        let prepared = self.prepare_outbound(message, &opts, Some(conn.addr))?;
        conn.write_frame(&prepared.encode()).await
    }

    /// Send to every connected client concurrently. Failed recipients are
    /// silently dropped from the roster.
    pub async fn broadcast(&self, message: Message, opts: SendOptions) -> Result<()> {
        let prepared = self.prepare_outbound(message, &opts, None)?;
        let data = prepared.encode();
        let targets: Vec<Arc<Connection>> = self.inner.clients.iter().map(|c| c.clone()).collect();
        debug!(count = targets.len(), "broadcast");
        join_all(targets.into_iter().map(|conn| {
            let data = data.clone();
            let server = self.clone();
            async move {
                if conn.write_frame(&data).await.is_err() {
                    warn!(id = conn.id, "broadcast send failed, dropping client");
                    server.inner.clients.remove(&conn.id);
                }
            }
        }))
        .await;
        Ok(())
    }

    /// Send to every subscriber of a URI concurrently. Failed recipients
    /// are silently dropped from that subscription set.
    pub async fn notify(&self, uri: impl Into<Bytes>, message: Message, opts: SendOptions) -> Result<()> {
        let uri = uri.into();
        let ids: Vec<u64> = match self.inner.subscriptions.get(&uri) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(()),
        };
        let prepared = self.prepare_outbound(message, &opts, None)?;
        let data = prepared.encode();
        debug!(uri = ?uri, count = ids.len(), "notify");
        join_all(ids.into_iter().map(|id| {
            let data = data.clone();
            let uri = uri.clone();
            let server = self.clone();
            async move {
                let conn = match server.inner.clients.get(&id) {
                    Some(c) => c.clone(),
                    None => return,
                };
                if conn.write_frame(&data).await.is_err() {
                    warn!(id, "notify send failed, dropping subscriber");
                    if let Some(mut set) = server.inner.subscriptions.get_mut(&uri) {
                        set.remove(&id);
                    }
                }
            }
        }))
        .await;
        Ok(())
    }

    /// Install the three peer-management handlers, then start the
    /// advertise/reap tick. ADVERTISE_PEER from a connection records the
    /// peer and answers PEER_DISCOVERED with this node's own peer data.
    pub fn manage_peers_automatically(&self) {
        if self.inner.peer_mgmt.swap(true, Ordering::SeqCst) {
            return;
        }
        self.on(
            MessageType::AdvertisePeer,
            handler(|message: Message, ctx: ServerContext| async move {
                let server = ctx.server;
                let id = message.body.uri.clone();
                let local = server.inner.local_peer.read().clone();
                if local.as_ref().map_or(false, |l| l.id == id) {
                    return None;
                }
                let new = server.inner.peers.observe(
                    id,
                    Some(ctx.connection.addr),
                    message.body.content.clone(),
                );
                if new {
                    info!(addr = %ctx.connection.addr, "peer discovered via advertisement");
                }
                local.map(|l| make_peer_discovered_msg(&l))
            }),
        );
        self.on(
            MessageType::PeerDiscovered,
            handler(|message: Message, ctx: ServerContext| async move {
                let id = message.body.uri.clone();
                let local = ctx.server.inner.local_peer.read().clone();
                if local.map_or(false, |l| l.id == id) {
                    return None;
                }
                ctx.server.inner.peers.observe(
                    id,
                    Some(ctx.connection.addr),
                    message.body.content.clone(),
                );
                None
            }),
        );
        self.on(
            MessageType::Disconnect,
            handler(|message: Message, ctx: ServerContext| async move {
                ctx.server.inner.peers.remove(&message.body.uri);
                ctx.server.cleanup_subscriptions(ctx.connection.id);
                debug!(addr = %ctx.connection.addr, "peer disconnected");
                None
            }),
        );

        let server = self.clone();
        let interval = self.inner.config.advertise_interval;
        let timeout = self.inner.config.peer_timeout;
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // interval's first tick completes immediately, which doubles
                // as the initial advertisement
                tick.tick().await;
                let local = server.inner.local_peer.read().clone();
                if let Some(local) = local {
                    if let Err(e) =
                        server.broadcast(make_advertise_msg(&local), SendOptions::default()).await
                    {
                        debug!(error = %e, "peer advertisement failed");
                    }
                }
                for peer in server.inner.peers.reap(timeout.as_millis() as i64) {
                    debug!(id = ?peer.id, "reaped stale peer");
                }
            }
        });
        *self.inner.advertise_task.lock() = Some(task);
    }

    /// Cancel the advertise tick, announce DISCONNECT to all clients, and
    /// remove the peer-management handlers.
    pub async fn stop_peer_management(&self) {
        if !self.inner.peer_mgmt.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.advertise_task.lock().take() {
            task.abort();
        }
        let local = self.inner.local_peer.read().clone();
        if let Some(local) = local {
            let _ = self.broadcast(make_disconnect_msg(&local), SendOptions::default()).await;
        }
        self.inner.registry.remove(MessageType::AdvertisePeer);
        self.inner.registry.remove(MessageType::PeerDiscovered);
        self.inner.registry.remove(MessageType::Disconnect);
        self.inner.peers.clear();
    }

    fn install_subscription_handlers(&self) {
        self.on(
            MessageType::SubscribeUri,
            handler(|message: Message, ctx: ServerContext| async move {
                ctx.server.subscribe(message.body.uri.clone(), &ctx.connection);
                Some(Message::prepare(
                    Body::prepare(message.body.uri.clone(), Bytes::new()),
                    MessageType::ConfirmSubscribe,
                ))
            }),
        );
        self.on(
            MessageType::UnsubscribeUri,
            handler(|message: Message, ctx: ServerContext| async move {
                ctx.server.unsubscribe(message.body.uri.clone(), &ctx.connection);
                Some(Message::prepare(
                    Body::prepare(message.body.uri.clone(), Bytes::new()),
                    MessageType::ConfirmUnsubscribe,
                ))
            }),
        );
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

    /// Remove a closed or disconnecting connection from every subscription
    /// set, dropping sets that become empty.
    fn cleanup_subscriptions(&self, id: u64) {
        let mut emptied: Vec<Bytes> = Vec::new();
        for mut entry in self.inner.subscriptions.iter_mut() {
            entry.value_mut().remove(&id);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for uri in emptied {
            self.inner.subscriptions.remove_if(&uri, |_, s| s.is_empty());
        }
    }

    fn cleanup_connection(&self, id: u64) {
        self.inner.clients.remove(&id);
        self.inner.conn_tasks.remove(&id);
        self.cleanup_subscriptions(id);
    }

    /// Per-connection loop: read one frame, run the inbound pipeline,
    /// dispatch, send the response. Strictly sequential; the next frame is
    /// not read until the handler and its response send complete.
    async fn run_connection(self, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
        loop {
            let message = match read_message(&mut reader).await {
                Ok(m) => m,
                Err(Error::ChecksumMismatch) => {
                    debug!(addr = %conn.addr, "invalid message received");
                    let _ = conn.write_frame(&make_error_msg("invalid message").encode()).await;
                    continue;
                }
                Err(Error::MalformedFrame(reason)) => {
                    // framing state is ambiguous after a malformed frame
                    warn!(addr = %conn.addr, reason, "malformed frame, closing connection");
                    let _ = conn.write_frame(&make_error_msg("invalid message").encode()).await;
                    break;
                }
                Err(e) if e.is_disconnect() => {
                    debug!(addr = %conn.addr, "client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(addr = %conn.addr, error = %e, "read failed, closing connection");
                    break;
                }
            };

            if !self.inner.types.read().contains(message.header.message_type) {
                warn!(message_type = message.header.message_type, "unknown message type");
                let _ = conn.write_frame(&make_error_msg("invalid message").encode()).await;
                continue;
            }
            debug!(addr = %conn.addr, checksum = message.header.checksum, "received message");

            let node = self.plugins();
            let local = self.inner.local_peer.read().clone();
            let remote = self.inner.peers.find_by_addr(conn.addr);
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
                Inbound::Reject { error, .. } => {
                    let _ = conn.write_frame(&error.encode()).await;
                    continue;
                }
                Inbound::Drop => continue,
                Inbound::Ready { message, entry } => {
                    (message, entry.unwrap_or_else(|| self.inner.registry.default_entry()))
                }
            };

            let sctx = ServerContext { server: self.clone(), connection: conn.clone() };
            let invocation =
                std::panic::AssertUnwindSafe((entry.func)(message, sctx)).catch_unwind();
            let response = match invocation.await {
                Ok(r) => r,
                Err(_) => {
                    error!(addr = %conn.addr, "handler panicked, closing connection");
                    break;
                }
            };

            if let Some(response) = response {
                let response = match apply_response(response, &entry, &node, &ctx) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "response pipeline failed");
                        continue;
                    }
                };
                if conn.write_frame(&response.encode()).await.is_err() {
                    debug!(addr = %conn.addr, "response write failed, closing connection");
                    break;
                }
            }
        }
        self.cleanup_connection(conn.id);
    }
}
