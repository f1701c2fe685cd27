//! Package framing for the broadcast wire protocol.
//!
//! Every message travels in an envelope:
//!
//! ```text
//! magic "MCST" (4) | options (1) | body length u32 BE (4) | body | trailer "TSCM" (4)
//! ```
//!
//! Acknowledgements reuse the same envelope with a fixed sentinel body
//! ([`ACK_DATA`] or [`FAIL_ACK_DATA`]). [`PackageBuffer`] accumulates raw socket
//! reads so package boundaries do not depend on read granularity.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SendError};
use crate::message::{Payload, SendOptions};

/// Envelope start marker.
pub const PACKAGE_MAGIC: [u8; 4] = *b"MCST";

/// Envelope end marker.
pub const PACKAGE_TRAILER: [u8; 4] = *b"TSCM";

/// Header size in bytes (magic:4 + options:1 + length:4).
pub const HEADER_SIZE: usize = 9;

/// Trailer size in bytes.
pub const TRAILER_SIZE: usize = 4;

/// Body of a positive acknowledgement.
pub const ACK_DATA: [u8; 3] = [6, 2, 3];

/// Body of a negative acknowledgement.
pub const FAIL_ACK_DATA: [u8; 4] = [11, 0, 5, 7];

/// Default upper bound on a package body (16 MiB).
pub const DEFAULT_MAX_BODY: u32 = 16 * 1024 * 1024;

/// Kind of acknowledgement carried by a package body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Delivered and accepted.
    Ack,
    /// Delivered but rejected by the receiver.
    FailAck,
}

impl AckKind {
    /// Classifies a package body; `None` when it is not a sentinel.
    pub fn classify(body: &[u8]) -> Option<Self> {
        if body == ACK_DATA {
            Some(AckKind::Ack)
        } else if body == FAIL_ACK_DATA {
            Some(AckKind::FailAck)
        } else {
            None
        }
    }

    fn body(self) -> &'static [u8] {
        match self {
            AckKind::Ack => &ACK_DATA,
            AckKind::FailAck => &FAIL_ACK_DATA,
        }
    }
}

/// A decoded package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Options from the header.
    pub options: SendOptions,
    /// Opaque body.
    pub body: Bytes,
}

/// Encodes `body` into a complete envelope.
pub fn encode_package(options: SendOptions, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len() + TRAILER_SIZE);
    buf.put_slice(&PACKAGE_MAGIC);
    buf.put_u8(options.as_u8());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.put_slice(&PACKAGE_TRAILER);
    buf.freeze()
}

/// Encodes a payload, rejecting bodies above `max_body`.
pub fn encode_payload(payload: &Payload, max_body: u32) -> Result<Bytes> {
    if payload.len() as u64 > max_body as u64 {
        return Err(SendError::PayloadTooLarge {
            size: payload.len() as u64,
            max_size: max_body,
        });
    }
    Ok(encode_package(payload.options(), payload.data()))
}

/// Encodes an acknowledgement package.
pub fn ack_package(kind: AckKind) -> Bytes {
    encode_package(SendOptions::no_ack(), kind.body())
}

/// Growable receive buffer that yields whole packages.
#[derive(Debug)]
pub struct PackageBuffer {
    buf: BytesMut,
    max_body: u32,
}

impl Default for PackageBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY)
    }
}

impl PackageBuffer {
    /// Creates an empty buffer accepting bodies up to `max_body` bytes.
    pub fn new(max_body: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_body,
        }
    }

    /// Appends raw bytes read from the socket.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// True when a whole, well-formed-looking package is buffered.
    ///
    /// Only the header is inspected. A corrupt header reports `false`;
    /// [`extract_package`](Self::extract_package) surfaces the error.
    pub fn has_complete_package(&self) -> bool {
        match self.body_len() {
            Some(len) => {
                len <= self.max_body as usize
                    && self.buf.len() >= HEADER_SIZE + len + TRAILER_SIZE
            }
            None => false,
        }
    }

    /// Removes exactly one package from the front of the buffer.
    ///
    /// Returns `Ok(None)` while the package is still incomplete; any bytes
    /// after the package stay buffered for the next call.
    pub fn extract_package(&mut self) -> Result<Option<Package>> {
        let probe = self.buf.len().min(PACKAGE_MAGIC.len());
        if self.buf[..probe] != PACKAGE_MAGIC[..probe] {
            return Err(SendError::InvalidFrame {
                reason: format!("bad magic {:02x?}", &self.buf[..probe]),
            });
        }
        let len = match self.body_len() {
            Some(len) => len,
            None => return Ok(None),
        };
        if len > self.max_body as usize {
            return Err(SendError::PayloadTooLarge {
                size: len as u64,
                max_size: self.max_body,
            });
        }
        if self.buf.len() < HEADER_SIZE + len + TRAILER_SIZE {
            return Ok(None);
        }

        let trailer_at = HEADER_SIZE + len;
        if self.buf[trailer_at..trailer_at + TRAILER_SIZE] != PACKAGE_TRAILER {
            return Err(SendError::InvalidFrame {
                reason: "bad trailer".to_string(),
            });
        }

        let options = SendOptions::from_u8(self.buf[PACKAGE_MAGIC.len()]);
        self.buf.advance(HEADER_SIZE);
        let body = self.buf.split_to(len).freeze();
        self.buf.advance(TRAILER_SIZE);
        Ok(Some(Package { options, body }))
    }

    /// Counts the complete packages currently buffered without consuming them.
    pub fn count_packages(&self) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while let Some(len) = Self::body_len_at(&self.buf[pos..]) {
            let end = pos + HEADER_SIZE + len + TRAILER_SIZE;
            if len > self.max_body as usize || end > self.buf.len() {
                break;
            }
            count += 1;
            pos = end;
        }
        count
    }

    fn body_len(&self) -> Option<usize> {
        Self::body_len_at(&self.buf)
    }

    fn body_len_at(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_SIZE || buf[..4] != PACKAGE_MAGIC {
            return None;
        }
        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        Some(len as usize)
    }
}
