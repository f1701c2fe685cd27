//! The sender abstraction handed out by the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::Waker;
use tracing::trace;

use crate::error::PartialFailure;
use crate::member::Member;
use crate::message::Payload;

/// Delivers one payload to a set of members.
///
/// Implementations are single-threaded: a sender is owned by one caller at a
/// time. Cross-thread interruption goes through [`InterruptHandle`].
pub trait MessageSender: Send {
    /// Stable identifier, unique within the process.
    fn id(&self) -> u64;

    /// Broadcasts `payload` and blocks until every member completed, failed
    /// or the configured timeout elapsed.
    ///
    /// `Ok` means every distinct member completed. Otherwise the error lists
    /// each member that did not, in input order, with its last cause.
    fn send_message(
        &mut self,
        members: &[Member],
        payload: &Payload,
    ) -> std::result::Result<(), PartialFailure>;

    /// Housekeeping between broadcasts.
    fn keepalive(&mut self);

    /// False once the sender should not be reused.
    fn is_healthy(&self) -> bool;

    /// Closes every connection.
    fn disconnect(&mut self);

    /// Handle that can interrupt this sender from another thread.
    fn interrupt_handle(&self) -> InterruptHandle;
}

/// Cross-thread interrupt for a sender.
///
/// Setting the flag makes the owner abort its current broadcast at the next
/// wakeup; the optional waker forces that wakeup.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
}

impl InterruptHandle {
    /// Handle that wakes `waker` when interrupted.
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            waker: Some(waker),
        }
    }

    /// Flags the sender and wakes it.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                trace!(error = %e, "interrupt wake failed");
            }
        }
    }

    /// True once [`interrupt`](Self::interrupt) was called and not cleared.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.interrupted.store(false, Ordering::Release);
    }
}
