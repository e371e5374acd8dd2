/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Asynchronous framed, URI-addressed messaging with pluggable layered
//! security, for connection-oriented (TCP) and connectionless (UDP,
//! including multicast) peers.
//!
//! Every frame is `header || auth-fields || body`, CRC-checked, and flows
//! through an outer (node-wide) and optional inner (handler- or call-level)
//! auth/cipher plugin layer. Dispatch is by `(message type, URI)` with
//! persistent and one-shot handler tables; the TCP client correlates
//! requests with responses by registering one-shot handlers that resolve a
//! oneshot channel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wirebus::{
//!     handler, make_ok_msg, HmacAuthPlugin, Message, MessageType, NodeConfig, SendOptions,
//!     ServerContext, Sha256StreamCipherPlugin, TcpClient, TcpServer,
//! };
//!
//! # async fn run() -> wirebus::Result<()> {
//! let server = TcpServer::new(NodeConfig::new("127.0.0.1", 8888));
//! server.set_auth_plugin(Some(Arc::new(HmacAuthPlugin::new("secret"))));
//! server.set_cipher_plugin(Some(Arc::new(Sha256StreamCipherPlugin::new("secret"))));
//! server.on(
//!     (MessageType::PublishUri, &b"echo"[..]),
//!     handler(|message: Message, _ctx: ServerContext| async move {
//!         Some(make_ok_msg(message.body.uri.clone(), message.body.content.clone()))
//!     }),
//! );
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.start().await }
//! });
//!
//! let client = TcpClient::new(NodeConfig::new("127.0.0.1", 8888));
//! client.set_auth_plugin(Some(Arc::new(HmacAuthPlugin::new("secret"))));
//! client.set_cipher_plugin(Some(Arc::new(Sha256StreamCipherPlugin::new("secret"))));
//! client.connect().await?;
//! client.spawn_receive_loop();
//! let response = client.request(&b"/resource"[..], Duration::from_secs(1)).await?;
//! println!("{:?}", response.kind());
//! # Ok(())
//! # }
//! ```

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 4;
pub const VERSION_REVISION: u8 = 0;

pub mod auth;
pub mod cipher;
pub mod config;
pub mod error;
pub mod handler;
pub mod peer;
pub mod pipeline;
pub mod protocol;
pub mod tcp;
pub mod udp;
pub mod util;

pub use auth::{AuthPlugin, HmacAuthPlugin, PluginContext};
pub use cipher::{CipherPlugin, Sha256StreamCipherPlugin};
pub use config::{Backoff, NodeConfig};
pub use error::{Error, Result};
pub use handler::{
    handler, sync_handler, HandlerEntry, HandlerFn, HandlerKey, IntoHandlerKey, Registry,
};
pub use peer::{DefaultPeerPlugin, Peer, PeerPlugin, PeerRegistry};
pub use pipeline::{ReceiveOptions, SendOptions};
pub use protocol::{
    make_error_msg, make_not_found_msg, make_not_permitted_msg, make_ok_msg, make_respond_uri_msg,
    read_message, validate_message_types, AuthFields, Body, Header, Message, MessageType,
    MessageTypeTable,
};
pub use tcp::{AuthErrorHandler, ClientContext, Connection, ServerContext, TcpClient, TcpServer};
pub use udp::{UdpContext, UdpNode};
