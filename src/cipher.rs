/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::{Body, Message};

/// Byte length of the IV the built-in plugin generates.
pub const IV_SIZE: usize = 16;

/// Message body encryption contract.
///
/// `encrypt` and `decrypt` are pure transformations returning a new
/// message; the caller reassigns. Implementations set or read exactly one
/// auth field (the IV) and must be safe to share across nodes.
pub trait CipherPlugin: Send + Sync {
    fn encrypt(&self, message: Message) -> Result<Message>;
    fn decrypt(&self, message: Message) -> Result<Message>;
}

/// XOR stream cipher keyed by SHA-256.
///
/// The key is the SHA-256 digest of the raw key material. The keystream is
/// derived per message: K' = SHA256(SHA256(K) || SHA256(IV) || SHA256("enc")),
/// block i = SHA256(K' || be32(i)). With `encrypt_uri` (the default) the
/// URI is part of the ciphertext; turn it off when an outer layer routes by
/// URI and this instance is an end-to-end inner layer.
pub struct Sha256StreamCipherPlugin {
    key: [u8; 32],
    iv_field: String,
    encrypt_uri: bool,
}

impl Sha256StreamCipherPlugin {
    pub fn new(key: impl AsRef<[u8]>) -> Sha256StreamCipherPlugin {
        let mut k = [0u8; 32];
        k.copy_from_slice(&Sha256::digest(key.as_ref()));
        Sha256StreamCipherPlugin { key: k, iv_field: "iv".to_string(), encrypt_uri: true }
    }

    pub fn with_iv_field(mut self, name: impl Into<String>) -> Sha256StreamCipherPlugin {
        self.iv_field = name.into();
        self
    }

    pub fn with_encrypt_uri(mut self, encrypt_uri: bool) -> Sha256StreamCipherPlugin {
        self.encrypt_uri = encrypt_uri;
        self
    }

    fn symcrypt(&self, iv: &[u8], data: &[u8]) -> Vec<u8> {
        let mut derived = Sha256::new();
        derived.update(Sha256::digest(self.key));
        derived.update(Sha256::digest(iv));
        derived.update(Sha256::digest(b"enc"));
        let derived: [u8; 32] = derived.finalize().into();

        let mut out = Vec::with_capacity(data.len());
        let mut counter = 0u32;
        while out.len() < data.len() {
            let mut block = Sha256::new();
            block.update(derived);
            block.update(counter.to_be_bytes());
            let block: [u8; 32] = block.finalize().into();
            let take = (data.len() - out.len()).min(32);
            let at = out.len();
            out.extend(block[..take].iter().zip(&data[at..at + take]).map(|(k, d)| k ^ d));
            counter += 1;
        }
        out
    }

    fn transform(&self, message: Message, iv: Bytes) -> Message {
        let Message { header, mut auth, body } = message;
        let uri_len = body.uri.len();
        let (uri, content) = if self.encrypt_uri {
            let mut plain = Vec::with_capacity(uri_len + body.content.len());
            plain.extend_from_slice(&body.uri);
            plain.extend_from_slice(&body.content);
            let mut crypted = self.symcrypt(&iv, &plain);
            let content = crypted.split_off(uri_len);
            (Bytes::from(crypted), Bytes::from(content))
        } else {
            (body.uri, Bytes::from(self.symcrypt(&iv, &body.content)))
        };
        auth.set(self.iv_field.clone(), iv);
        Message::with_kind(header.message_type, auth, Body::prepare(uri, content))
    }
}

impl CipherPlugin for Sha256StreamCipherPlugin {
    fn encrypt(&self, message: Message) -> Result<Message> {
        let iv = match message.auth.get(&self.iv_field) {
            Some(iv) if iv.len() == IV_SIZE => iv.clone(),
            _ => {
                let mut iv = [0u8; IV_SIZE];
                rand::thread_rng().fill_bytes(&mut iv);
                Bytes::copy_from_slice(&iv)
            }
        };
        Ok(self.transform(message, iv))
    }

    fn decrypt(&self, message: Message) -> Result<Message> {
        let iv = message
            .auth
            .get(&self.iv_field)
            .filter(|iv| iv.len() == IV_SIZE)
            .cloned()
            .ok_or(Error::Cipher("missing iv"))?;
        Ok(self.transform(message, iv))
    }
}
