//! Error types for the broadcast transport.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::member::Member;

/// Errors raised while moving a payload to cluster members.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("write to {addr} failed: {source}")]
    Write {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("read from {addr} failed: {source}")]
    Read {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol error from {addr}: {reason}")]
    Protocol { addr: String, reason: String },

    #[error("{addr} rejected the message (FAIL_ACK)")]
    FailAck { addr: String },

    #[error("{addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    #[error("no sender available after {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    #[error("sender disconnected")]
    Disconnected,

    #[error("{addr} already has a message in flight")]
    Busy { addr: String },

    #[error("{addr} is marked as failing")]
    Unavailable { addr: String },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u64, max_size: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Broadcast(#[from] PartialFailure),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SendError>;

impl SendError {
    pub(crate) fn connect(member: &Member, source: io::Error) -> Self {
        SendError::Connect {
            addr: member.addr(),
            source,
        }
    }

    pub(crate) fn write(member: &Member, source: io::Error) -> Self {
        SendError::Write {
            addr: member.addr(),
            source,
        }
    }

    pub(crate) fn read(member: &Member, source: io::Error) -> Self {
        SendError::Read {
            addr: member.addr(),
            source,
        }
    }

    pub(crate) fn protocol(member: &Member, reason: impl Into<String>) -> Self {
        SendError::Protocol {
            addr: member.addr(),
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(member: &Member, timeout_ms: u64) -> Self {
        SendError::Timeout {
            addr: member.addr(),
            timeout_ms,
        }
    }

    /// True when the dispatcher may disconnect, reconnect and resend.
    ///
    /// Connect, write, read and malformed-response errors are transient.
    /// A FAIL_ACK is a deliberate rejection by the peer and is surfaced as is,
    /// as are timeouts and pool exhaustion.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::Connect { .. }
                | SendError::Write { .. }
                | SendError::Read { .. }
                | SendError::Protocol { .. }
        )
    }

    /// True for malformed responses and FAIL_ACK rejections.
    pub fn is_protocol(&self) -> bool {
        matches!(self, SendError::Protocol { .. } | SendError::FailAck { .. })
    }

    /// True for timeout errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SendError::Timeout { .. })
    }
}

/// A member that did not complete a broadcast, with the cause.
#[derive(Debug)]
pub struct MemberFailure {
    /// The destination that failed.
    pub member: Member,
    /// Last observed cause.
    pub cause: SendError,
}

/// Aggregate failure of a broadcast: one entry per member that did not complete.
#[derive(Debug)]
pub struct PartialFailure {
    attempted: usize,
    failures: Vec<MemberFailure>,
}

impl PartialFailure {
    pub(crate) fn new(attempted: usize, failures: Vec<MemberFailure>) -> Self {
        Self {
            attempted,
            failures,
        }
    }

    /// Number of distinct members the broadcast targeted.
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Per-member failures, in the order the members were passed in.
    pub fn failures(&self) -> &[MemberFailure] {
        &self.failures
    }

    /// Consumes the error and returns the per-member failures.
    pub fn into_failures(self) -> Vec<MemberFailure> {
        self.failures
    }

    /// Members that did not complete.
    pub fn failed_members(&self) -> Vec<&Member> {
        self.failures.iter().map(|f| &f.member).collect()
    }

    /// Cause recorded for `member`, if it failed.
    pub fn cause_for(&self, member: &Member) -> Option<&SendError> {
        self.failures
            .iter()
            .find(|f| &f.member == member)
            .map(|f| &f.cause)
    }

    /// True when no member completed.
    pub fn is_total(&self) -> bool {
        self.failures.len() == self.attempted
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} members failed",
            self.failures.len(),
            self.attempted
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.member, failure.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}
