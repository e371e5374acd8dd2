/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Byte length of the fixed frame header.
pub const HEADER_SIZE: usize = 13;

/// Maximum serialized auth-fields length accepted on decode.
pub const AUTH_SIZE_MAX: usize = 1024 * 1024;

/// Maximum serialized body length accepted on decode.
pub const BODY_SIZE_MAX: usize = 16 * 1024 * 1024;

/// Largest UDP datagram the node will attempt to send.
pub const DATAGRAM_SIZE_MAX: usize = 65507;

/// Reserved message type values (single byte on the wire).
///
/// Values 0..=30 are reserved. Extension tables may only add names with
/// values in 31..=255 and must carry every reserved name at its canonical
/// value; see [`validate_message_types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RequestUri = 0,
    RespondUri = 1,
    CreateUri = 2,
    UpdateUri = 3,
    DeleteUri = 4,
    SubscribeUri = 5,
    UnsubscribeUri = 6,
    PublishUri = 7,
    NotifyUri = 8,
    AdvertisePeer = 9,
    Ok = 10,
    ConfirmSubscribe = 11,
    ConfirmUnsubscribe = 12,
    PeerDiscovered = 13,
    Error = 20,
    AuthError = 23,
    NotFound = 24,
    NotPermitted = 25,
    Disconnect = 30,
}

impl From<MessageType> for u8 {
    #[inline(always)]
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<MessageType> {
        Ok(match v {
            0 => MessageType::RequestUri,
            1 => MessageType::RespondUri,
            2 => MessageType::CreateUri,
            3 => MessageType::UpdateUri,
            4 => MessageType::DeleteUri,
            5 => MessageType::SubscribeUri,
            6 => MessageType::UnsubscribeUri,
            7 => MessageType::PublishUri,
            8 => MessageType::NotifyUri,
            9 => MessageType::AdvertisePeer,
            10 => MessageType::Ok,
            11 => MessageType::ConfirmSubscribe,
            12 => MessageType::ConfirmUnsubscribe,
            13 => MessageType::PeerDiscovered,
            20 => MessageType::Error,
            23 => MessageType::AuthError,
            24 => MessageType::NotFound,
            25 => MessageType::NotPermitted,
            30 => MessageType::Disconnect,
            _ => return Err(Error::InvalidType(v)),
        })
    }
}

/// The reserved name/value pairs every message-type table must carry.
pub const RESERVED_MESSAGE_TYPES: &[(&str, u8)] = &[
    ("REQUEST_URI", 0),
    ("RESPOND_URI", 1),
    ("CREATE_URI", 2),
    ("UPDATE_URI", 3),
    ("DELETE_URI", 4),
    ("SUBSCRIBE_URI", 5),
    ("UNSUBSCRIBE_URI", 6),
    ("PUBLISH_URI", 7),
    ("NOTIFY_URI", 8),
    ("ADVERTISE_PEER", 9),
    ("OK", 10),
    ("CONFIRM_SUBSCRIBE", 11),
    ("CONFIRM_UNSUBSCRIBE", 12),
    ("PEER_DISCOVERED", 13),
    ("ERROR", 20),
    ("AUTH_ERROR", 23),
    ("NOT_FOUND", 24),
    ("NOT_PERMITTED", 25),
    ("DISCONNECT", 30),
];

/// A validated table of message type names and values.
///
/// The default table contains exactly the reserved pairs. Extended tables
/// built with [`MessageTypeTable::extend`] add application-defined names in
/// the 31..=255 range.
#[derive(Debug, Clone)]
pub struct MessageTypeTable {
    entries: Vec<(String, u8)>,
    present: [bool; 256],
}

lazy_static! {
    static ref RESERVED_TABLE: MessageTypeTable = MessageTypeTable::extend(&[]).unwrap();
}

impl MessageTypeTable {
    /// The table containing only the reserved pairs.
    pub fn reserved() -> &'static MessageTypeTable {
        &RESERVED_TABLE
    }

    /// Build a table from the reserved pairs plus application extensions.
    ///
    /// Extension values must lie in 31..=255 and must not collide with each
    /// other or shadow a reserved name.
    pub fn extend(extra: &[(&str, u16)]) -> Result<MessageTypeTable> {
        let mut entries: Vec<(String, u16)> =
            RESERVED_MESSAGE_TYPES.iter().map(|(n, v)| (n.to_string(), *v as u16)).collect();
        entries.extend(extra.iter().map(|(n, v)| (n.to_string(), *v)));
        let borrowed: Vec<(&str, u16)> = entries.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        validate_message_types(&borrowed)?;
        let mut present = [false; 256];
        for (_, v) in entries.iter() {
            present[*v as usize] = true;
        }
        Ok(MessageTypeTable {
            entries: entries.into_iter().map(|(n, v)| (n, v as u8)).collect(),
            present,
        })
    }

    /// True if the value is defined in this table.
    #[inline(always)]
    pub fn contains(&self, value: u8) -> bool {
        self.present[value as usize]
    }

    /// Look up the symbolic name for a value.
    pub fn name_of(&self, value: u8) -> Option<&str> {
        self.entries.iter().find(|(_, v)| *v == value).map(|(n, _)| n.as_str())
    }
}

/// Validate a full message-type table.
///
/// Returns an error naming the offending entry when the table omits a
/// reserved name, moves a reserved name off its canonical value, defines a
/// non-reserved name on a reserved value (0..=30), exceeds 255, or contains
/// duplicates.
pub fn validate_message_types(entries: &[(&str, u16)]) -> Result<()> {
    for (name, value) in RESERVED_MESSAGE_TYPES {
        match entries.iter().find(|(n, _)| n == name) {
            None => return Err(Error::InvalidTypeTable(format!("missing reserved name {}", name))),
            Some((_, v)) if *v != *value as u16 => {
                return Err(Error::InvalidTypeTable(format!(
                    "reserved name {} moved to value {}",
                    name, v
                )))
            }
            _ => {}
        }
    }
    let mut seen_values = [false; 256];
    let mut seen_names: Vec<&str> = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        if *value > 255 {
            return Err(Error::InvalidTypeTable(format!("value {} for {} exceeds 255", value, name)));
        }
        let reserved = RESERVED_MESSAGE_TYPES.iter().any(|(n, v)| n == name && *v as u16 == *value);
        if *value <= 30 && !reserved {
            return Err(Error::InvalidTypeTable(format!(
                "value {} for {} redefines a reserved value",
                value, name
            )));
        }
        if seen_values[*value as usize] {
            return Err(Error::InvalidTypeTable(format!("duplicate value {}", value)));
        }
        seen_values[*value as usize] = true;
        if seen_names.contains(name) {
            return Err(Error::InvalidTypeTable(format!("duplicate name {}", name)));
        }
        seen_names.push(*name);
    }
    Ok(())
}

/// Fixed-length frame header. All integers big-endian.
///
/// `checksum` is CRC-32 over the encoded body bytes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: u8,
    pub auth_length: u32,
    pub body_length: u32,
    pub checksum: u32,
}

impl Header {
    pub const SIZE: usize = HEADER_SIZE;

    /// Decode a header from at least `SIZE` bytes. Trailing excess is ignored.
    pub fn decode(data: &[u8]) -> Result<Header> {
        if data.len() < Self::SIZE {
            return Err(Error::MalformedFrame("short header"));
        }
        Ok(Header {
            message_type: data[0],
            auth_length: BigEndian::read_u32(&data[1..5]),
            body_length: BigEndian::read_u32(&data[5..9]),
            checksum: BigEndian::read_u32(&data[9..13]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.message_type;
        BigEndian::write_u32(&mut out[1..5], self.auth_length);
        BigEndian::write_u32(&mut out[5..9], self.body_length);
        BigEndian::write_u32(&mut out[9..13], self.checksum);
        out
    }
}

/// The authentication/encryption side-channel of a frame: an ordered map of
/// short names to byte strings ("hmac", "iv", "nonce", "ts", ...).
///
/// Wire form: `u16 count, [u8 name_len, name, u32 value_len, value]*`.
/// Encoding iterates in insertion order so round-trips are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthFields {
    fields: IndexMap<String, Bytes>,
}

impl AuthFields {
    pub fn new() -> AuthFields {
        AuthFields { fields: IndexMap::new() }
    }

    #[inline(always)]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.fields.get(name)
    }

    /// Set a field, replacing any existing value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        debug_assert!(name.len() <= u8::MAX as usize);
        self.fields.insert(name, value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        self.fields.shift_remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(2 + self.fields.len() * 16);
        out.put_u16(self.fields.len() as u16);
        for (name, value) in self.fields.iter() {
            out.put_u8(name.len() as u8);
            out.put_slice(name.as_bytes());
            out.put_u32(value.len() as u32);
            out.put_slice(value);
        }
        out.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<AuthFields> {
        if data.len() < 2 {
            return Err(Error::MalformedFrame("short auth fields"));
        }
        let count = BigEndian::read_u16(&data[0..2]) as usize;
        let mut fields = IndexMap::with_capacity(count);
        let mut at = 2usize;
        for _ in 0..count {
            if at + 1 > data.len() {
                return Err(Error::MalformedFrame("truncated auth field name length"));
            }
            let name_len = data[at] as usize;
            at += 1;
            if at + name_len + 4 > data.len() {
                return Err(Error::MalformedFrame("truncated auth field name"));
            }
            let name = std::str::from_utf8(&data[at..at + name_len])
                .map_err(|_| Error::MalformedFrame("auth field name not utf-8"))?
                .to_string();
            at += name_len;
            let value_len = BigEndian::read_u32(&data[at..at + 4]) as usize;
            at += 4;
            if at + value_len > data.len() {
                return Err(Error::MalformedFrame("truncated auth field value"));
            }
            fields.insert(name, Bytes::copy_from_slice(&data[at..at + value_len]));
            at += value_len;
        }
        Ok(AuthFields { fields })
    }
}

/// Frame body: an opaque dispatch URI plus application payload.
///
/// Wire form: `u32 uri_length | uri | content`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body {
    pub uri: Bytes,
    pub content: Bytes,
}

impl Body {
    pub fn prepare(uri: impl Into<Bytes>, content: impl Into<Bytes>) -> Body {
        Body { uri: uri.into(), content: content.into() }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.uri.len() + self.content.len());
        out.put_u32(self.uri.len() as u32);
        out.put_slice(&self.uri);
        out.put_slice(&self.content);
        out.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Body> {
        if data.len() < 4 {
            return Err(Error::MalformedFrame("short body"));
        }
        let uri_length = BigEndian::read_u32(&data[0..4]) as usize;
        if 4 + uri_length > data.len() {
            return Err(Error::MalformedFrame("uri length exceeds body"));
        }
        Ok(Body {
            uri: Bytes::copy_from_slice(&data[4..4 + uri_length]),
            content: Bytes::copy_from_slice(&data[4 + uri_length..]),
        })
    }
}

/// One complete frame: header, auth fields, body.
///
/// The header invariants (`auth_length`, `body_length`, `checksum`) are
/// maintained by [`Message::encode`], which always serializes from the
/// current auth fields and body; [`Message::seal`] rewrites the stored
/// header to match after external mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub auth: AuthFields,
    pub body: Body,
}

impl Message {
    /// Build a message of the given type around a body, with empty auth
    /// fields and a fully computed header.
    pub fn prepare(body: Body, message_type: MessageType) -> Message {
        Self::with_kind(message_type.into(), AuthFields::new(), body)
    }

    /// Build a message from raw parts, computing the header.
    pub fn with_kind(message_type: u8, auth: AuthFields, body: Body) -> Message {
        let body_bytes = body.encode();
        let auth_bytes = auth.encode();
        let header = Header {
            message_type,
            auth_length: auth_bytes.len() as u32,
            body_length: body_bytes.len() as u32,
            checksum: crc32fast::hash(&body_bytes),
        };
        Message { header, auth, body }
    }

    /// The symbolic type, if the value is a reserved one.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.header.message_type).ok()
    }

    /// Verify the stored checksum against the current body bytes.
    pub fn check(&self) -> bool {
        self.header.checksum == crc32fast::hash(&self.body.encode())
    }

    /// Recompute the length and checksum header fields from the current
    /// auth fields and body.
    pub fn seal(&mut self) {
        let body_bytes = self.body.encode();
        self.header.auth_length = self.auth.encode().len() as u32;
        self.header.body_length = body_bytes.len() as u32;
        self.header.checksum = crc32fast::hash(&body_bytes);
    }

    /// Serialize to wire form. Length and checksum fields are computed from
    /// the current parts, so a message mutated by auth plugins encodes
    /// consistently without an explicit reseal.
    pub fn encode(&self) -> Bytes {
        let auth_bytes = self.auth.encode();
        let body_bytes = self.body.encode();
        let header = Header {
            message_type: self.header.message_type,
            auth_length: auth_bytes.len() as u32,
            body_length: body_bytes.len() as u32,
            checksum: crc32fast::hash(&body_bytes),
        };
        let mut out = BytesMut::with_capacity(HEADER_SIZE + auth_bytes.len() + body_bytes.len());
        out.put_slice(&header.encode());
        out.put_slice(&auth_bytes);
        out.put_slice(&body_bytes);
        out.freeze()
    }

    /// Decode a complete frame from a byte slice (the UDP datagram path).
    ///
    /// The slice must contain the whole message; trailing bytes beyond the
    /// advertised lengths are rejected as malformed.
    pub fn decode(data: &[u8]) -> Result<Message> {
        let header = Header::decode(data)?;
        let auth_len = header.auth_length as usize;
        let body_len = header.body_length as usize;
        if auth_len > AUTH_SIZE_MAX || body_len > BODY_SIZE_MAX {
            return Err(Error::MalformedFrame("advertised length exceeds maximum"));
        }
        let total = HEADER_SIZE + auth_len + body_len;
        if data.len() != total {
            return Err(Error::MalformedFrame("frame length mismatch"));
        }
        let auth = AuthFields::decode(&data[HEADER_SIZE..HEADER_SIZE + auth_len])?;
        let body_bytes = &data[HEADER_SIZE + auth_len..total];
        if header.checksum != crc32fast::hash(body_bytes) {
            return Err(Error::ChecksumMismatch);
        }
        let body = Body::decode(body_bytes)?;
        Ok(Message { header, auth, body })
    }
}

/// Read one frame from a stream: exactly `HEADER_SIZE` bytes, then the
/// advertised auth-field and body byte counts.
///
/// EOF or reset mid-frame maps to [`Error::ConnectionLost`]; a failed CRC
/// is [`Error::ChecksumMismatch`] (the stream remains framed and readable).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    read_exact_or_lost(reader, &mut header_bytes).await?;
    let header = Header::decode(&header_bytes)?;

    let auth_len = header.auth_length as usize;
    let body_len = header.body_length as usize;
    if auth_len > AUTH_SIZE_MAX || body_len > BODY_SIZE_MAX {
        return Err(Error::MalformedFrame("advertised length exceeds maximum"));
    }

    let mut auth_bytes = vec![0u8; auth_len];
    read_exact_or_lost(reader, &mut auth_bytes).await?;
    let mut body_bytes = vec![0u8; body_len];
    read_exact_or_lost(reader, &mut body_bytes).await?;

    let auth = AuthFields::decode(&auth_bytes)?;
    if header.checksum != crc32fast::hash(&body_bytes) {
        return Err(Error::ChecksumMismatch);
    }
    let body = Body::decode(&body_bytes)?;
    Ok(Message { header, auth, body })
}

async fn read_exact_or_lost<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) {
                Err(Error::ConnectionLost)
            } else {
                Err(Error::Io(e))
            }
        }
    }
}

/// Build an error message, routing the type by substring: "not found" maps
/// to NOT_FOUND, "auth" to AUTH_ERROR, "not permitted" to NOT_PERMITTED,
/// anything else to ERROR. The URI is the literal `b"ERROR"`.
pub fn make_error_msg(text: &str) -> Message {
    let message_type = if text.contains("not found") {
        MessageType::NotFound
    } else if text.contains("auth") {
        MessageType::AuthError
    } else if text.contains("not permitted") {
        MessageType::NotPermitted
    } else {
        MessageType::Error
    };
    Message::prepare(
        Body::prepare(&b"ERROR"[..], Bytes::copy_from_slice(text.as_bytes())),
        message_type,
    )
}

pub fn make_ok_msg(uri: impl Into<Bytes>, content: impl Into<Bytes>) -> Message {
    Message::prepare(Body::prepare(uri, content), MessageType::Ok)
}

pub fn make_not_found_msg(uri: impl Into<Bytes>, content: impl Into<Bytes>) -> Message {
    Message::prepare(Body::prepare(uri, content), MessageType::NotFound)
}

pub fn make_not_permitted_msg(uri: impl Into<Bytes>, content: impl Into<Bytes>) -> Message {
    Message::prepare(Body::prepare(uri, content), MessageType::NotPermitted)
}

pub fn make_respond_uri_msg(uri: impl Into<Bytes>, content: impl Into<Bytes>) -> Message {
    Message::prepare(Body::prepare(uri, content), MessageType::RespondUri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut m = Message::prepare(
            Body::prepare(&b"test/uri"[..], &b"payload bytes"[..]),
            MessageType::PublishUri,
        );
        m.auth.set("nonce", Bytes::from_static(b"0123456789abcdef"));
        m.auth.set("ts", Bytes::from_static(&[0, 1, 2, 3]));
        m
    }

    #[test]
    fn header_round_trip_ignores_excess() {
        let h = Header { message_type: 7, auth_length: 10, body_length: 20, checksum: 0xdeadbeef };
        let mut encoded = h.encode().to_vec();
        encoded.extend_from_slice(b"excess");
        assert_eq!(Header::decode(&encoded).unwrap(), h);
        assert!(Header::decode(&encoded[..12]).is_err());
    }

    #[test]
    fn message_round_trip() {
        let m = sample();
        let decoded = Message::decode(&m.encode()).unwrap();
        assert_eq!(decoded, {
            let mut sealed = m.clone();
            sealed.seal();
            sealed
        });
        assert!(decoded.check());
    }

    #[test]
    fn auth_fields_preserve_order() {
        let mut a = AuthFields::new();
        a.set("zeta", Bytes::from_static(b"1"));
        a.set("alpha", Bytes::from_static(b"2"));
        let decoded = AuthFields::decode(&a.encode()).unwrap();
        let names: Vec<&str> = decoded.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn corrupt_body_fails_checksum() {
        let m = sample();
        let mut raw = m.encode().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(Message::decode(&raw), Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let m = sample();
        let raw = m.encode();
        assert!(matches!(Message::decode(&raw[..raw.len() - 3]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn type_table_validation() {
        assert!(MessageTypeTable::extend(&[]).is_ok());
        assert!(MessageTypeTable::extend(&[("CUSTOM", 31), ("OTHER", 255)]).is_ok());
        // redefining a reserved value
        assert!(MessageTypeTable::extend(&[("CUSTOM", 14)]).is_err());
        assert!(MessageTypeTable::extend(&[("CUSTOM", 30)]).is_err());
        // beyond a single byte
        assert!(MessageTypeTable::extend(&[("CUSTOM", 256)]).is_err());
        // omitting a reserved name
        let mut table: Vec<(&str, u16)> =
            RESERVED_MESSAGE_TYPES.iter().map(|(n, v)| (*n, *v as u16)).collect();
        table.retain(|(n, _)| *n != "DISCONNECT");
        assert!(validate_message_types(&table).is_err());
        // moving a reserved name
        let mut moved: Vec<(&str, u16)> =
            RESERVED_MESSAGE_TYPES.iter().map(|(n, v)| (*n, *v as u16)).collect();
        moved.iter_mut().find(|(n, _)| *n == "OK").unwrap().1 = 42;
        assert!(validate_message_types(&moved).is_err());
    }

    #[test]
    fn error_msg_routing() {
        assert_eq!(make_error_msg("resource not found").kind(), Some(MessageType::NotFound));
        assert_eq!(make_error_msg("HMAC auth failed").kind(), Some(MessageType::AuthError));
        assert_eq!(make_error_msg("write not permitted").kind(), Some(MessageType::NotPermitted));
        assert_eq!(make_error_msg("boom").kind(), Some(MessageType::Error));
        assert_eq!(make_error_msg("boom").body.uri, Bytes::from_static(b"ERROR"));
    }

    #[test]
    fn reserved_table_contains_all() {
        let t = MessageTypeTable::reserved();
        for (_, v) in RESERVED_MESSAGE_TYPES {
            assert!(t.contains(*v));
        }
        assert!(!t.contains(14));
        assert!(!t.contains(31));
        assert_eq!(t.name_of(30), Some("DISCONNECT"));
    }
}
