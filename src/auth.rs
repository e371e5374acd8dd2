/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::peer::{Peer, PeerPlugin};
use crate::protocol::{make_error_msg, AuthFields, Body, Message};
use crate::util::unix_time;

/// Byte length of the nonce the built-in plugin generates.
pub const NONCE_SIZE: usize = 16;

/// Per-invocation context handed to auth plugins.
///
/// Plugins that derive material from peer data (a public key, a locking
/// script) read it through the peer plugin; the built-in HMAC plugin
/// ignores all of it.
#[derive(Default, Clone, Copy)]
pub struct PluginContext<'a> {
    pub local_peer: Option<&'a Peer>,
    pub remote_peer: Option<&'a Peer>,
    pub peer_plugin: Option<&'a dyn PeerPlugin>,
}

/// Message authentication contract.
///
/// `check` must run in time independent of the secret data. Implementations
/// are pure configuration: `make`/`check` may be invoked concurrently from
/// multiple nodes and must not carry unsynchronized mutable state.
pub trait AuthPlugin: Send + Sync {
    /// Populate the auth fields required to authenticate `body`.
    fn make(&self, auth: &mut AuthFields, body: &Body, ctx: &PluginContext<'_>);

    /// Verify the auth fields against `body`.
    fn check(&self, auth: &AuthFields, body: &Body, ctx: &PluginContext<'_>) -> bool;

    /// A prebuilt AUTH_ERROR message sent to the sender on verification
    /// failure.
    fn error(&self) -> Message;
}

/// HMAC-SHA256 authentication over `nonce || ts_be32 || body_bytes`.
///
/// The key is the SHA-256 digest of the raw secret. Field names are
/// configurable so two layered instances do not collide ("hmac2" etc.);
/// an existing nonce/timestamp of the right shape is reused, which is what
/// lets an inner and an outer layer share one nonce.
pub struct HmacAuthPlugin {
    key: [u8; 32],
    nonce_field: String,
    ts_field: String,
    hmac_field: String,
}

impl HmacAuthPlugin {
    pub fn new(secret: impl AsRef<[u8]>) -> HmacAuthPlugin {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(secret.as_ref()));
        HmacAuthPlugin {
            key,
            nonce_field: "nonce".to_string(),
            ts_field: "ts".to_string(),
            hmac_field: "hmac".to_string(),
        }
    }

    pub fn with_hmac_field(mut self, name: impl Into<String>) -> HmacAuthPlugin {
        self.hmac_field = name.into();
        self
    }

    pub fn with_nonce_field(mut self, name: impl Into<String>) -> HmacAuthPlugin {
        self.nonce_field = name.into();
        self
    }

    pub fn with_ts_field(mut self, name: impl Into<String>) -> HmacAuthPlugin {
        self.ts_field = name.into();
        self
    }

    fn compute(&self, nonce: &[u8], ts: &[u8], body: &Body) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key size");
        mac.update(nonce);
        mac.update(ts);
        mac.update(&body.encode());
        mac.finalize().into_bytes().into()
    }
}

impl AuthPlugin for HmacAuthPlugin {
    fn make(&self, auth: &mut AuthFields, body: &Body, _ctx: &PluginContext<'_>) {
        let nonce = match auth.get(&self.nonce_field) {
            Some(n) if n.len() == NONCE_SIZE => n.clone(),
            _ => {
                let mut n = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut n);
                Bytes::copy_from_slice(&n)
            }
        };
        let ts = match auth.get(&self.ts_field) {
            Some(t) if t.len() == 4 => t.clone(),
            _ => Bytes::copy_from_slice(&unix_time().to_be_bytes()),
        };
        let mac = self.compute(&nonce, &ts, body);
        auth.set(self.nonce_field.clone(), nonce);
        auth.set(self.ts_field.clone(), ts);
        auth.set(self.hmac_field.clone(), Bytes::copy_from_slice(&mac));
    }

    fn check(&self, auth: &AuthFields, body: &Body, _ctx: &PluginContext<'_>) -> bool {
        let (nonce, ts, mac) = match (
            auth.get(&self.nonce_field),
            auth.get(&self.ts_field),
            auth.get(&self.hmac_field),
        ) {
            (Some(n), Some(t), Some(m)) if t.len() == 4 => (n, t, m),
            _ => return false,
        };
        let expected = self.compute(nonce, ts, body);
        mac.len() == expected.len() && bool::from(mac.as_ref().ct_eq(&expected))
    }

    fn error(&self) -> Message {
        make_error_msg("HMAC auth failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[test]
    fn make_then_check() {
        let plugin = HmacAuthPlugin::new("test");
        let body = Body::prepare(&b"echo"[..], &b"hello"[..]);
        let mut auth = AuthFields::new();
        plugin.make(&mut auth, &body, &PluginContext::default());
        assert!(plugin.check(&auth, &body, &PluginContext::default()));
    }

    #[test]
    fn mutated_body_fails() {
        let plugin = HmacAuthPlugin::new("test");
        let body = Body::prepare(&b"echo"[..], &b"hello"[..]);
        let mut auth = AuthFields::new();
        plugin.make(&mut auth, &body, &PluginContext::default());
        let tampered = Body::prepare(&b"echo"[..], &b"hellO"[..]);
        assert!(!plugin.check(&auth, &tampered, &PluginContext::default()));
    }

    #[test]
    fn wrong_secret_fails() {
        let plugin = HmacAuthPlugin::new("test");
        let wrong = HmacAuthPlugin::new("wrong");
        let body = Body::prepare(&b"echo"[..], &b"hello"[..]);
        let mut auth = AuthFields::new();
        plugin.make(&mut auth, &body, &PluginContext::default());
        assert!(!wrong.check(&auth, &body, &PluginContext::default()));
    }

    #[test]
    fn layered_fields_do_not_collide() {
        let outer = HmacAuthPlugin::new("outer");
        let inner = HmacAuthPlugin::new("inner").with_hmac_field("hmac2");
        let body = Body::prepare(&b"echo"[..], &b"hello"[..]);
        let mut auth = AuthFields::new();
        inner.make(&mut auth, &body, &PluginContext::default());
        outer.make(&mut auth, &body, &PluginContext::default());
        // both layers verify; they share one nonce and timestamp
        assert!(outer.check(&auth, &body, &PluginContext::default()));
        assert!(inner.check(&auth, &body, &PluginContext::default()));
        assert_eq!(auth.len(), 4);
    }

    #[test]
    fn error_is_auth_error() {
        assert_eq!(HmacAuthPlugin::new("x").error().kind(), Some(MessageType::AuthError));
    }
}
