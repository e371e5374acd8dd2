/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::auth::AuthPlugin;
use crate::cipher::CipherPlugin;
use crate::protocol::{make_not_found_msg, Message, MessageType};

/// Future type returned by message handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Message>> + Send>>;

/// A registered message handler. `C` is the node-specific dispatch context
/// (connection handle, sender address, ...).
pub type HandlerFn<C> = Arc<dyn Fn(Message, C) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`].
pub fn handler<C, F, Fut>(f: F) -> HandlerFn<C>
where
    F: Fn(Message, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Message>> + Send + 'static,
{
    Arc::new(move |message, ctx| Box::pin(f(message, ctx)))
}

/// Wrap a synchronous closure as a [`HandlerFn`].
pub fn sync_handler<C, F>(f: F) -> HandlerFn<C>
where
    F: Fn(Message, C) -> Option<Message> + Send + Sync + 'static,
{
    Arc::new(move |message, ctx| {
        let out = f(message, ctx);
        Box::pin(async move { out })
    })
}

/// Dispatch key: a bare message type, or a type scoped to one URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Kind(u8),
    KindUri(u8, Bytes),
}

/// Anything registrable as a dispatch key: a `MessageType`, a raw `u8`
/// extension value, or either paired with a URI.
pub trait IntoHandlerKey {
    fn into_key(self) -> HandlerKey;
}

impl IntoHandlerKey for HandlerKey {
    fn into_key(self) -> HandlerKey {
        self
    }
}

impl IntoHandlerKey for MessageType {
    fn into_key(self) -> HandlerKey {
        HandlerKey::Kind(self.into())
    }
}

impl IntoHandlerKey for u8 {
    fn into_key(self) -> HandlerKey {
        HandlerKey::Kind(self)
    }
}

impl<B: Into<Bytes>> IntoHandlerKey for (MessageType, B) {
    fn into_key(self) -> HandlerKey {
        HandlerKey::KindUri(self.0.into(), self.1.into())
    }
}

impl<B: Into<Bytes>> IntoHandlerKey for (u8, B) {
    fn into_key(self) -> HandlerKey {
        HandlerKey::KindUri(self.0, self.1.into())
    }
}

/// The key list tried for an incoming message: the URI-scoped key first,
/// then the bare type.
pub fn keys_for(message: &Message) -> [HandlerKey; 2] {
    [
        HandlerKey::KindUri(message.header.message_type, message.body.uri.clone()),
        HandlerKey::Kind(message.header.message_type),
    ]
}

/// A handler with its optional inner-layer plugin overrides.
pub struct HandlerEntry<C> {
    pub func: HandlerFn<C>,
    pub auth: Option<Arc<dyn AuthPlugin>>,
    pub cipher: Option<Arc<dyn CipherPlugin>>,
}

impl<C> Clone for HandlerEntry<C> {
    fn clone(&self) -> Self {
        HandlerEntry { func: self.func.clone(), auth: self.auth.clone(), cipher: self.cipher.clone() }
    }
}

impl<C> HandlerEntry<C> {
    pub fn new(func: HandlerFn<C>) -> HandlerEntry<C> {
        HandlerEntry { func, auth: None, cipher: None }
    }

    pub fn with_plugins(
        func: HandlerFn<C>,
        auth: Option<Arc<dyn AuthPlugin>>,
        cipher: Option<Arc<dyn CipherPlugin>>,
    ) -> HandlerEntry<C> {
        HandlerEntry { func, auth, cipher }
    }
}

struct RegistryInner<C> {
    persistent: Mutex<HashMap<HandlerKey, HandlerEntry<C>>>,
    ephemeral: Mutex<HashMap<HandlerKey, HandlerEntry<C>>>,
    default: Mutex<HandlerFn<C>>,
}

/// Handler tables for one node: persistent entries, one-shot (ephemeral)
/// entries consumed on first match, and the default handler invoked when
/// nothing matches.
///
/// No lock is held while a handler runs; resolution snapshots the entry.
pub struct Registry<C> {
    inner: Arc<RegistryInner<C>>,
}

impl<C> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Registry { inner: self.inner.clone() }
    }
}

impl<C: 'static> Default for Registry<C> {
    /// The stock default handler answers NOT_FOUND under the request's own
    /// URI, but only for request-class messages: answering unmatched
    /// responses, errors, or notifications would make two datagram nodes
    /// volley NOT_FOUND at each other indefinitely.
    fn default() -> Self {
        Registry::new(handler(|message: Message, _ctx: C| async move {
            use MessageType::*;
            match message.kind() {
                Some(RequestUri | CreateUri | UpdateUri | DeleteUri | SubscribeUri
                    | UnsubscribeUri | PublishUri)
                | None => Some(make_not_found_msg(message.body.uri.clone(), "not found")),
                Some(_) => None,
            }
        }))
    }
}

impl<C: 'static> Registry<C> {
    pub fn new(default: HandlerFn<C>) -> Registry<C> {
        Registry {
            inner: Arc::new(RegistryInner {
                persistent: Mutex::new(HashMap::new()),
                ephemeral: Mutex::new(HashMap::new()),
                default: Mutex::new(default),
            }),
        }
    }

    /// Register a persistent handler, replacing any existing entry under
    /// the same key.
    pub fn add(&self, key: impl IntoHandlerKey, entry: HandlerEntry<C>) {
        self.inner.persistent.lock().insert(key.into_key(), entry);
    }

    /// Register a one-shot handler. The entry is removed atomically when it
    /// matches, before invocation.
    pub fn add_once(&self, key: impl IntoHandlerKey, entry: HandlerEntry<C>) {
        self.inner.ephemeral.lock().insert(key.into_key(), entry);
    }

    pub fn remove(&self, key: impl IntoHandlerKey) -> bool {
        self.inner.persistent.lock().remove(&key.into_key()).is_some()
    }

    pub fn remove_once(&self, key: impl IntoHandlerKey) -> bool {
        self.inner.ephemeral.lock().remove(&key.into_key()).is_some()
    }

    pub fn set_default(&self, func: HandlerFn<C>) {
        *self.inner.default.lock() = func;
    }

    pub fn default_entry(&self) -> HandlerEntry<C> {
        HandlerEntry::new(self.inner.default.lock().clone())
    }

    pub fn contains(&self, key: impl IntoHandlerKey) -> bool {
        let key = key.into_key();
        self.inner.persistent.lock().contains_key(&key)
            || self.inner.ephemeral.lock().contains_key(&key)
    }

    /// Find the first matching entry: for each key in order, the ephemeral
    /// table is consulted before the persistent one. An ephemeral match is
    /// removed here, before the caller invokes it.
    pub fn resolve(&self, keys: &[HandlerKey]) -> Option<HandlerEntry<C>> {
        for key in keys {
            if let Some(entry) = self.inner.ephemeral.lock().remove(key) {
                return Some(entry);
            }
            if let Some(entry) = self.inner.persistent.lock().get(key) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Drop every ephemeral entry. Pending one-shot correlation senders
    /// captured by those entries are dropped with them.
    pub fn clear_ephemeral(&self) {
        self.inner.ephemeral.lock().clear();
    }
}
