//! Outbound payloads and their send options.

use bytes::Bytes;

/// Per-message option bits carried in the package header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// The receiver must answer with ACK or FAIL_ACK.
    pub require_ack: bool,
}

impl SendOptions {
    /// Bit set when an acknowledgement is required.
    pub const REQUIRE_ACK: u8 = 0x01;

    /// Options requesting an acknowledgement.
    pub fn ack() -> Self {
        Self { require_ack: true }
    }

    /// Fire-and-forget options.
    pub fn no_ack() -> Self {
        Self { require_ack: false }
    }

    /// Convert to raw byte representation
    pub fn as_u8(&self) -> u8 {
        let mut b = 0u8;
        if self.require_ack {
            b |= Self::REQUIRE_ACK;
        }
        b
    }

    /// Create from raw byte representation; unknown bits are ignored.
    pub fn from_u8(b: u8) -> Self {
        Self {
            require_ack: (b & Self::REQUIRE_ACK) != 0,
        }
    }
}

/// An opaque, already serialized message plus its options.
///
/// Cloning is cheap: the bytes are reference counted and never mutated by
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    data: Bytes,
    options: SendOptions,
}

impl Payload {
    /// Creates a payload with explicit options.
    pub fn new(data: impl Into<Bytes>, options: SendOptions) -> Self {
        Self {
            data: data.into(),
            options,
        }
    }

    /// Creates a payload that requires an acknowledgement.
    pub fn with_ack(data: impl Into<Bytes>) -> Self {
        Self::new(data, SendOptions::ack())
    }

    /// Creates a fire-and-forget payload.
    pub fn without_ack(data: impl Into<Bytes>) -> Self {
        Self::new(data, SendOptions::no_ack())
    }

    /// Message bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Send options.
    pub fn options(&self) -> SendOptions {
        self.options
    }

    /// Shorthand for `options().require_ack`.
    pub fn require_ack(&self) -> bool {
        self.options.require_ack
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
