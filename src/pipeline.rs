/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::{AuthPlugin, PluginContext};
use crate::cipher::CipherPlugin;
use crate::error::Result;
use crate::handler::{keys_for, HandlerEntry, Registry};
use crate::protocol::Message;

/// Per-call send options: the `use_*` flags gate the node-wide (outer)
/// plugins, the `auth`/`cipher` slots add an inner layer applied nearest
/// the body.
#[derive(Clone, Default)]
pub struct SendOptions {
    pub skip_auth: bool,
    pub skip_cipher: bool,
    pub auth: Option<Arc<dyn AuthPlugin>>,
    pub cipher: Option<Arc<dyn CipherPlugin>>,
}

impl SendOptions {
    /// Apply no plugins at all: no outer layer, no inner layer.
    pub fn plain() -> SendOptions {
        SendOptions { skip_auth: true, skip_cipher: true, auth: None, cipher: None }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthPlugin>) -> SendOptions {
        self.auth = Some(auth);
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn CipherPlugin>) -> SendOptions {
        self.cipher = Some(cipher);
        self
    }

    pub fn without_outer(mut self) -> SendOptions {
        self.skip_auth = true;
        self.skip_cipher = true;
        self
    }
}

/// Per-call receive options mirroring the outer-plugin gates of
/// [`SendOptions`].
#[derive(Clone, Copy)]
pub struct ReceiveOptions {
    pub use_auth: bool,
    pub use_cipher: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions { use_auth: true, use_cipher: true }
    }
}

/// Snapshot of a node's outer plugin slots taken once per operation.
#[derive(Clone, Default)]
pub struct NodePlugins {
    pub auth: Option<Arc<dyn AuthPlugin>>,
    pub cipher: Option<Arc<dyn CipherPlugin>>,
}

/// The fixed outbound order: inner cipher, inner auth, outer cipher,
/// outer auth. Returns the transformed message ready to serialize.
pub fn apply_outbound(
    mut message: Message,
    opts: &SendOptions,
    node: &NodePlugins,
    ctx: &PluginContext<'_>,
) -> Result<Message> {
    if let Some(cipher) = &opts.cipher {
        message = cipher.encrypt(message)?;
    }
    if let Some(auth) = &opts.auth {
        auth.make(&mut message.auth, &message.body, ctx);
    }
    if !opts.skip_cipher {
        if let Some(cipher) = &node.cipher {
            message = cipher.encrypt(message)?;
        }
    }
    if !opts.skip_auth {
        if let Some(auth) = &node.auth {
            auth.make(&mut message.auth, &message.body, ctx);
        }
    }
    message.seal();
    Ok(message)
}

/// Outcome of the inbound half of the pipeline, up to (but not including)
/// handler invocation.
pub enum Inbound<C> {
    /// An auth plugin rejected the message; send this error back raw (no
    /// response pipeline) and do not dispatch. `outer` distinguishes the
    /// node-wide check (datagram receivers drop instead of answering) from
    /// a handler-level one.
    Reject { error: Message, outer: bool },
    /// Decryption failed; drop the frame.
    Drop,
    /// Ready to invoke: the (possibly decrypted) message and the matched
    /// entry, or `None` when no handler key matched.
    Ready { message: Message, entry: Option<HandlerEntry<C>> },
}

/// Inbound steps shared by every node type: outer auth check, outer
/// decrypt, handler resolution, inner auth check, inner decrypt.
///
/// An ephemeral match is consumed by resolution even if its inner auth
/// check subsequently fails.
pub fn receive_inbound<C: 'static>(
    mut message: Message,
    opts: ReceiveOptions,
    node: &NodePlugins,
    registry: &Registry<C>,
    ctx: &PluginContext<'_>,
) -> Inbound<C> {
    if opts.use_auth {
        if let Some(auth) = &node.auth {
            if !auth.check(&message.auth, &message.body, ctx) {
                warn!("message failed outer auth check");
                return Inbound::Reject { error: auth.error(), outer: true };
            }
        }
    }
    if opts.use_cipher {
        if let Some(cipher) = &node.cipher {
            message = match cipher.decrypt(message) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "outer decrypt failed");
                    return Inbound::Drop;
                }
            };
        }
    }

    let keys = keys_for(&message);
    let entry = registry.resolve(&keys);

    if let Some(entry) = entry {
        if let Some(auth) = &entry.auth {
            if !auth.check(&message.auth, &message.body, ctx) {
                warn!("message failed inner auth check");
                return Inbound::Reject { error: auth.error(), outer: false };
            }
        }
        if let Some(cipher) = &entry.cipher {
            message = match cipher.decrypt(message) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "inner decrypt failed");
                    return Inbound::Drop;
                }
            };
        }
        debug!(message_type = message.header.message_type, "dispatching to handler");
        Inbound::Ready { message, entry: Some(entry) }
    } else {
        Inbound::Ready { message, entry: None }
    }
}

/// Response pipeline: the handler-level plugins are the inner layer, the
/// node plugins the outer, exactly mirroring the send path.
pub fn apply_response<C>(
    response: Message,
    entry: &HandlerEntry<C>,
    node: &NodePlugins,
    ctx: &PluginContext<'_>,
) -> Result<Message> {
    let opts = SendOptions {
        skip_auth: false,
        skip_cipher: false,
        auth: entry.auth.clone(),
        cipher: entry.cipher.clone(),
    };
    apply_outbound(response, &opts, node, ctx)
}
