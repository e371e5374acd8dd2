/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use thiserror::Error;

/// Errors surfaced by the wire codec, the security pipeline, and the node types.
///
/// Framing and security failures are handled locally by the receive loops
/// (respond and continue); only the client-facing operations propagate these
/// to callers.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame violated a length bound or could not be sliced into
    /// header, auth fields, and body.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The CRC-32 in the header did not match the body bytes.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// An auth plugin rejected the message.
    #[error("authentication failed")]
    AuthFailure,

    /// No handler matched and the operation required one.
    #[error("no handler found")]
    NotFound,

    /// A correlated request did not receive its response in time.
    #[error("request timed out")]
    Timeout,

    /// The remote end closed or reset the connection.
    #[error("connection lost")]
    ConnectionLost,

    /// The operation was abandoned because the node was closed.
    #[error("cancelled")]
    Cancelled,

    /// A message type value outside the configured table.
    #[error("invalid message type {0}")]
    InvalidType(u8),

    /// A message-type table that violates the reserved-range contract.
    #[error("invalid message type table: {0}")]
    InvalidTypeTable(String),

    /// A configuration or argument error.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A cipher plugin failed to transform a message.
    #[error("cipher error: {0}")]
    Cipher(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that indicate the peer is gone rather than a bad frame.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionLost => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
