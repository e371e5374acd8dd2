/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthPlugin, PluginContext};
use crate::cipher::CipherPlugin;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::handler::{handler, HandlerEntry, HandlerFn, HandlerKey, IntoHandlerKey, Registry};
use crate::peer::{
    make_advertise_msg, make_disconnect_msg, make_peer_discovered_msg, DefaultPeerPlugin, Peer,
    PeerPlugin, PeerRegistry,
};
use crate::pipeline::{
    apply_outbound, receive_inbound, Inbound, NodePlugins, ReceiveOptions, SendOptions,
};
use crate::protocol::{read_message, Body, Message, MessageType, MessageTypeTable};

/// Response types a correlated request listens for, all scoped to the
/// request URI.
const RESPONSE_KINDS: [MessageType; 8] = [
    MessageType::RespondUri,
    MessageType::Ok,
    MessageType::ConfirmSubscribe,
    MessageType::ConfirmUnsubscribe,
    MessageType::Error,
    MessageType::AuthError,
    MessageType::NotFound,
    MessageType::NotPermitted,
];

/// Callback invoked by the receive path for AUTH_ERROR responses no
/// handler consumed.
#[async_trait]
pub trait AuthErrorHandler: Send + Sync {
    async fn handle_auth_error(&self, message: Message);
}

/// Dispatch context handed to client handlers.
#[derive(Clone)]
pub struct ClientContext {
    pub client: TcpClient,
    /// Address of the server end of the connection.
    pub addr: SocketAddr,
}

struct ClientInner {
    config: NodeConfig,
    registry: Registry<ClientContext>,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    auth: RwLock<Option<Arc<dyn AuthPlugin>>>,
    cipher: RwLock<Option<Arc<dyn CipherPlugin>>>,
    peer_plugin: RwLock<Arc<dyn PeerPlugin>>,
    local_peer: RwLock<Option<Peer>>,
    types: RwLock<Arc<MessageTypeTable>>,
    peers: PeerRegistry,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    advertise_task: Mutex<Option<JoinHandle<()>>>,
    auth_error_handler: RwLock<Option<Arc<dyn AuthErrorHandler>>>,
    auto_reconnect: AtomicBool,
    peer_mgmt: AtomicBool,
    connected: AtomicBool,
}

/// Framed TCP message client with request/response correlation.
///
/// Correlated calls ([`TcpClient::request`] and friends) register one-shot
/// handlers that resolve a oneshot channel; something must be driving the
/// receive side for them to complete — either [`TcpClient::spawn_receive_loop`]
/// or explicit [`TcpClient::receive_once`] calls.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub fn new(config: NodeConfig) -> TcpClient {
        TcpClient {
            inner: Arc::new(ClientInner {
                config,
                registry: Registry::default(),
                reader: tokio::sync::Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                remote_addr: Mutex::new(None),
                auth: RwLock::new(None),
                cipher: RwLock::new(None),
                peer_plugin: RwLock::new(Arc::new(DefaultPeerPlugin)),
                local_peer: RwLock::new(None),
                types: RwLock::new(Arc::new(MessageTypeTable::reserved().clone())),
                peers: PeerRegistry::new(),
                receive_task: Mutex::new(None),
                advertise_task: Mutex::new(None),
                auth_error_handler: RwLock::new(None),
                auto_reconnect: AtomicBool::new(false),
                peer_mgmt: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
        }
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

    /// Reconnect with backoff instead of surfacing read timeouts and
    /// connection loss from the receive loop.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn set_auth_error_handler(&self, handler: Option<Arc<dyn AuthErrorHandler>>) {
        *self.inner.auth_error_handler.write() = handler;
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Register a persistent handler.
    pub fn on(&self, key: impl IntoHandlerKey, func: HandlerFn<ClientContext>) {
        self.inner.registry.add(key, HandlerEntry::new(func));
    }

    pub fn on_with_plugins(
        &self,
        key: impl IntoHandlerKey,
        func: HandlerFn<ClientContext>,
        auth: Option<Arc<dyn AuthPlugin>>,
        cipher: Option<Arc<dyn CipherPlugin>>,
    ) {
        self.inner.registry.add(key, HandlerEntry::with_plugins(func, auth, cipher));
    }

    /// Register a one-shot handler, consumed on its first match.
    pub fn once(&self, key: impl IntoHandlerKey, func: HandlerFn<ClientContext>) {
        self.inner.registry.add_once(key, HandlerEntry::new(func));
    }

    pub fn once_with_plugins(
        &self,
        key: impl IntoHandlerKey,
        func: HandlerFn<ClientContext>,
        auth: Option<Arc<dyn AuthPlugin>>,
        cipher: Option<Arc<dyn CipherPlugin>>,
    ) {
        self.inner.registry.add_once(key, HandlerEntry::with_plugins(func, auth, cipher));
    }

    pub fn remove_handler(&self, key: impl IntoHandlerKey) -> bool {
        self.inner.registry.remove(key)
    }

    /// Connect to the configured host and port.
    pub async fn connect(&self) -> Result<()> {
        let stream = TcpStream::connect(self.inner.config.addr()).await?;
        let _ = stream.set_nodelay(true);
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        *self.inner.reader.lock().await = Some(reader);
        *self.inner.writer.lock().await = Some(writer);
        *self.inner.remote_addr.lock() = Some(addr);
        self.inner.connected.store(true, Ordering::SeqCst);
        info!(addr = %addr, "connected");

        if self.inner.peer_mgmt.load(Ordering::SeqCst) {
            self.advertise_local_peer().await;
        }
        Ok(())
    }

    /// Close the connection and release resources. Pending correlated
    /// requests fail with [`Error::Cancelled`].
    pub async fn close(&self) {
        if self.inner.peer_mgmt.load(Ordering::SeqCst) && self.is_connected() {
            let local = self.inner.local_peer.read().clone();
            if let Some(local) = local {
                let _ = self.send(make_disconnect_msg(&local), SendOptions::default()).await;
            }
        }
        if let Some(task) = self.inner.receive_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.advertise_task.lock().take() {
            task.abort();
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.inner.reader.lock().await = None;
        *self.inner.remote_addr.lock() = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        // dropping the ephemeral table drops the pending oneshot senders
        self.inner.registry.clear_ephemeral();
        debug!("client closed");
    }

    /// Apply the send pipeline and write one frame.
    pub async fn send(&self, message: Message, opts: SendOptions) -> Result<()> {
        let prepared = self.prepare_outbound(message, &opts)?;
        let data = prepared.encode();
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionLost)?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        debug!(checksum = prepared.header.checksum, "sent message");
        Ok(())
    }

    /// Read and dispatch exactly one frame.
    ///
    /// Returns the matched handler's return value if it produced one,
    /// otherwise the decoded message itself; `None` when the frame failed
    /// the checksum or an auth check. Unlike the server, a client handler's
    /// return value is *not* written back to the peer.
    pub async fn receive_once(&self, opts: ReceiveOptions) -> Result<Option<Message>> {
        let message = {
            let mut guard = self.inner.reader.lock().await;
            let reader = guard.as_mut().ok_or(Error::ConnectionLost)?;
            let read = read_message(reader);
            match self.inner.config.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(r) => r,
                    Err(_) => return Err(Error::Timeout),
                },
                None => read.await,
            }
        };
        let message = match message {
            Ok(m) => m,
            Err(Error::ChecksumMismatch) => {
                debug!("invalid message received");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !self.inner.types.read().contains(message.header.message_type) {
            warn!(message_type = message.header.message_type, "unknown message type");
            return Ok(None);
        }

        let node = NodePlugins {
            auth: self.inner.auth.read().clone(),
            cipher: self.inner.cipher.read().clone(),
        };
        let local = self.inner.local_peer.read().clone();
        let addr = (*self.inner.remote_addr.lock())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let remote = self.inner.peers.find_by_addr(addr);
        let peer_plugin = self.inner.peer_plugin.read().clone();
        let ctx = PluginContext {
            local_peer: local.as_ref(),
            remote_peer: remote.as_ref(),
            peer_plugin: Some(&*peer_plugin),
        };

        match receive_inbound(message, opts, &node, &self.inner.registry, &ctx) {
            Inbound::Reject { .. } => Ok(None),
            Inbound::Drop => Ok(None),
            Inbound::Ready { message, entry: Some(entry) } => {
                let cctx = ClientContext { client: self.clone(), addr };
                let result = (entry.func)(message.clone(), cctx).await;
                Ok(Some(result.unwrap_or(message)))
            }
            Inbound::Ready { message, entry: None } => {
                if message.kind() == Some(MessageType::AuthError) {
                    let callback = self.inner.auth_error_handler.read().clone();
                    if let Some(callback) = callback {
                        callback.handle_auth_error(message.clone()).await;
                    }
                }
                Ok(Some(message))
            }
        }
    }

    /// Receive and dispatch frames until cancelled or, without
    /// auto-reconnect, until the connection is lost.
    pub async fn receive_loop(&self) -> Result<()> {
        loop {
            match self.receive_once(ReceiveOptions::default()).await {
                Ok(_) => {}
                Err(e) if e.is_disconnect() || matches!(e, Error::Timeout) => {
                    if self.inner.auto_reconnect.load(Ordering::SeqCst) {
                        warn!(error = %e, "connection lost, reconnecting");
                        self.reconnect().await?;
                    } else {
                        debug!(error = %e, "receive loop ending");
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run [`TcpClient::receive_loop`] as a background task owned by the
    /// client; it is aborted by [`TcpClient::close`].
    pub fn spawn_receive_loop(&self) {
        let client = self.clone();
        let task = tokio::spawn(async move {
            let _ = client.receive_loop().await;
        });
        if let Some(old) = self.inner.receive_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Send a message of the given type and await the correlated response
    /// (any response type under the same URI), failing with
    /// [`Error::Timeout`] if it does not arrive in time.
    pub async fn correlated(
        &self,
        kind: MessageType,
        uri: impl Into<Bytes>,
        content: impl Into<Bytes>,
        timeout: Duration,
        opts: SendOptions,
    ) -> Result<Message> {
        let uri = uri.into();
        let (tx, rx) = oneshot::channel::<Message>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let keys: Vec<HandlerKey> = RESPONSE_KINDS
            .iter()
            .map(|k| HandlerKey::KindUri((*k).into(), uri.clone()))
            .collect();

        for key in &keys {
            let tx = tx.clone();
            let siblings = keys.clone();
            let registry = self.inner.registry.clone();
            let func = handler(move |message: Message, _ctx: ClientContext| {
                let tx = tx.clone();
                let siblings = siblings.clone();
                let registry = registry.clone();
                async move {
                    for k in siblings {
                        registry.remove_once(k);
                    }
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(message);
                    }
                    None
                }
            });
            self.inner.registry.add_once(
                key.clone(),
                HandlerEntry::with_plugins(func, opts.auth.clone(), opts.cipher.clone()),
            );
        }

        let message = Message::prepare(Body::prepare(uri, content), kind);
        if let Err(e) = self.send(message, opts).await {
            for key in keys {
                self.inner.registry.remove_once(key);
            }
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                for key in keys {
                    self.inner.registry.remove_once(key);
                }
                Err(Error::Timeout)
            }
        }
    }

    /// REQUEST_URI with an empty content, awaiting the response.
    pub async fn request(&self, uri: impl Into<Bytes>, timeout: Duration) -> Result<Message> {
        self.correlated(MessageType::RequestUri, uri, Bytes::new(), timeout, SendOptions::default())
            .await
    }

    pub async fn create(
        &self,
        uri: impl Into<Bytes>,
        content: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.correlated(MessageType::CreateUri, uri, content, timeout, SendOptions::default()).await
    }

    pub async fn update(
        &self,
        uri: impl Into<Bytes>,
        content: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.correlated(MessageType::UpdateUri, uri, content, timeout, SendOptions::default()).await
    }

    pub async fn delete(&self, uri: impl Into<Bytes>, timeout: Duration) -> Result<Message> {
        self.correlated(MessageType::DeleteUri, uri, Bytes::new(), timeout, SendOptions::default())
            .await
    }

    /// SUBSCRIBE_URI, awaiting CONFIRM_SUBSCRIBE.
    pub async fn subscribe(&self, uri: impl Into<Bytes>, timeout: Duration) -> Result<Message> {
        self.correlated(MessageType::SubscribeUri, uri, Bytes::new(), timeout, SendOptions::default())
            .await
    }

    /// UNSUBSCRIBE_URI, awaiting CONFIRM_UNSUBSCRIBE.
    pub async fn unsubscribe(&self, uri: impl Into<Bytes>, timeout: Duration) -> Result<Message> {
        self.correlated(
            MessageType::UnsubscribeUri,
            uri,
            Bytes::new(),
            timeout,
            SendOptions::default(),
        )
        .await
    }

    /// Fire-and-forget PUBLISH_URI.
    pub async fn publish(
        &self,
        uri: impl Into<Bytes>,
        content: impl Into<Bytes>,
        opts: SendOptions,
    ) -> Result<()> {
        self.send(Message::prepare(Body::prepare(uri, content), MessageType::PublishUri), opts).await
    }

    /// Install the peer-management handlers, advertise immediately when
    /// connected, and start the periodic advertise/reap tick.
    pub fn manage_peers_automatically(&self) {
        if self.inner.peer_mgmt.swap(true, Ordering::SeqCst) {
            return;
        }
        self.on(
            MessageType::AdvertisePeer,
            handler(|message: Message, ctx: ClientContext| async move {
                let client = ctx.client;
                let id = message.body.uri.clone();
                let local = client.inner.local_peer.read().clone();
                if local.as_ref().map_or(false, |l| l.id == id) {
                    return None;
                }
                client.inner.peers.observe(id, Some(ctx.addr), message.body.content.clone());
                // answer with our own peer data; client handlers never
                // auto-respond, so send explicitly
                if let Some(local) = local {
                    let _ = client
                        .send(make_peer_discovered_msg(&local), SendOptions::default())
                        .await;
                }
                None
            }),
        );
        self.on(
            MessageType::PeerDiscovered,
            handler(|message: Message, ctx: ClientContext| async move {
                let id = message.body.uri.clone();
                let local = ctx.client.inner.local_peer.read().clone();
                if local.map_or(false, |l| l.id == id) {
                    return None;
                }
                ctx.client.inner.peers.observe(id, Some(ctx.addr), message.body.content.clone());
                None
            }),
        );
        self.on(
            MessageType::Disconnect,
            handler(|message: Message, ctx: ClientContext| async move {
                ctx.client.inner.peers.remove(&message.body.uri);
                None
            }),
        );

        let client = self.clone();
        let interval = self.inner.config.advertise_interval;
        let timeout = self.inner.config.peer_timeout;
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval's first tick completes immediately; consume it
            tick.tick().await;
            loop {
                tick.tick().await;
                if client.is_connected() {
                    client.advertise_local_peer().await;
                }
                for peer in client.inner.peers.reap(timeout.as_millis() as i64) {
                    debug!(id = ?peer.id, "reaped stale peer");
                }
            }
        });
        *self.inner.advertise_task.lock() = Some(task);

        if self.is_connected() {
            let client = self.clone();
            tokio::spawn(async move { client.advertise_local_peer().await });
        }
    }

    /// Cancel the advertise tick, send DISCONNECT, and remove the
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
            let _ = self.send(make_disconnect_msg(&local), SendOptions::default()).await;
        }
        self.inner.registry.remove(MessageType::AdvertisePeer);
        self.inner.registry.remove(MessageType::PeerDiscovered);
        self.inner.registry.remove(MessageType::Disconnect);
        self.inner.peers.clear();
    }

    async fn advertise_local_peer(&self) {
        let local = self.inner.local_peer.read().clone();
        if let Some(local) = local {
            if let Err(e) = self.send(make_advertise_msg(&local), SendOptions::default()).await {
                debug!(error = %e, "peer advertisement failed");
            }
        }
    }

    /// Re-establish the connection with exponential backoff. Runs until it
    /// succeeds or the calling task is cancelled.
    async fn reconnect(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.reader.lock().await = None;
        *self.inner.writer.lock().await = None;
        let backoff = self.inner.config.reconnect.clone();
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(backoff.delay(attempt)).await;
            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn prepare_outbound(&self, message: Message, opts: &SendOptions) -> Result<Message> {
        let node = NodePlugins {
            auth: self.inner.auth.read().clone(),
            cipher: self.inner.cipher.read().clone(),
        };
        let local = self.inner.local_peer.read().clone();
        let remote =
            (*self.inner.remote_addr.lock()).and_then(|addr| self.inner.peers.find_by_addr(addr));
        let peer_plugin = self.inner.peer_plugin.read().clone();
        let ctx = PluginContext {
            local_peer: local.as_ref(),
            remote_peer: remote.as_ref(),
            peer_plugin: Some(&*peer_plugin),
        };
        apply_outbound(message, opts, &node, &ctx)
    }
}
