//! Bounded pool of senders shared by concurrent callers.
//!
//! Each caller checks out a whole sender (by default a [`Dispatcher`] with its
//! own reactor) so broadcasts from different threads never contend on one
//! event loop. Senders are created lazily up to `max_senders`; `acquire`
//! blocks up to `acquire_timeout_ms` when all of them are checked out.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{PoolConfig, SenderConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Result, SendError};
use crate::health::SenderStates;
use crate::member::Member;
use crate::message::Payload;
use crate::metrics::TransportMetrics;
use crate::sender::{InterruptHandle, MessageSender};

/// Builds a new sender for the pool.
pub type SenderFactory<S> = Box<dyn Fn() -> Result<S> + Send + Sync>;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Senders waiting in the pool.
    pub idle: usize,
    /// Senders checked out by callers.
    pub in_use: usize,
    /// Capacity.
    pub max: usize,
}

struct PoolInner<S> {
    idle: Vec<S>,
    checked_out: HashMap<u64, InterruptHandle>,
    creating: usize,
    closed: bool,
}

impl<S> PoolInner<S> {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.creating
    }
}

/// Pool of [`MessageSender`]s.
pub struct SenderPool<S: MessageSender = Dispatcher> {
    config: PoolConfig,
    factory: SenderFactory<S>,
    inner: Mutex<PoolInner<S>>,
    available: Condvar,
    metrics: Arc<TransportMetrics>,
}

impl<S: MessageSender> std::fmt::Debug for SenderPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SenderPool<Dispatcher> {
    /// Pool of dispatchers with a fresh health registry and metrics.
    pub fn with_dispatchers(config: Arc<SenderConfig>) -> Result<Self> {
        Self::dispatchers(
            config,
            Arc::new(SenderStates::new()),
            Arc::new(TransportMetrics::new()),
        )
    }

    /// Pool of dispatchers sharing the given health registry and metrics.
    pub fn dispatchers(
        config: Arc<SenderConfig>,
        states: Arc<SenderStates>,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let pool_config = config.pool.clone();
        let factory_metrics = Arc::clone(&metrics);
        let factory: SenderFactory<Dispatcher> = Box::new(move || {
            Dispatcher::new(
                Arc::clone(&config),
                Arc::clone(&states),
                Arc::clone(&factory_metrics),
            )
        });
        Self::new(pool_config, metrics, factory)
    }
}

impl<S: MessageSender> SenderPool<S> {
    /// Creates a pool and pre-creates `min_idle` senders.
    pub fn new(
        config: PoolConfig,
        metrics: Arc<TransportMetrics>,
        factory: SenderFactory<S>,
    ) -> Result<Self> {
        if config.max_senders == 0 || config.min_idle > config.max_senders {
            return Err(SendError::Config(format!(
                "invalid pool sizing: min_idle={} max_senders={}",
                config.min_idle, config.max_senders
            )));
        }
        let mut idle = Vec::with_capacity(config.max_senders);
        for _ in 0..config.min_idle {
            idle.push(factory()?);
        }
        debug!(
            min_idle = config.min_idle,
            max_senders = config.max_senders,
            "sender pool created"
        );
        Ok(Self {
            config,
            factory,
            inner: Mutex::new(PoolInner {
                idle,
                checked_out: HashMap::new(),
                creating: 0,
                closed: false,
            }),
            available: Condvar::new(),
            metrics,
        })
    }

    /// Metrics shared with the pool's senders.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Checks out a sender, waiting up to `acquire_timeout_ms` for one.
    pub fn acquire(&self) -> Result<PooledSender<'_, S>> {
        let deadline = Instant::now() + self.config.acquire_timeout();
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(SendError::Disconnected);
            }
            if let Some(sender) = inner.idle.pop() {
                inner
                    .checked_out
                    .insert(sender.id(), sender.interrupt_handle());
                drop(inner);
                return Ok(self.checked_out(sender));
            }
            if inner.total() < self.config.max_senders {
                inner.creating += 1;
                drop(inner);
                return self.create();
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() && inner.idle.is_empty()
            {
                self.metrics.inc_pool_exhausted();
                warn!(
                    timeout_ms = self.config.acquire_timeout_ms,
                    in_use = inner.checked_out.len(),
                    "sender pool exhausted"
                );
                return Err(SendError::PoolExhausted {
                    timeout_ms: self.config.acquire_timeout_ms,
                });
            }
        }
    }

    /// Builds a sender for a slot already reserved in `creating`.
    fn create(&self) -> Result<PooledSender<'_, S>> {
        let created = (self.factory)();
        let mut inner = self.inner.lock();
        inner.creating -= 1;
        match created {
            Ok(mut sender) if inner.closed => {
                drop(inner);
                sender.disconnect();
                Err(SendError::Disconnected)
            }
            Ok(sender) => {
                inner
                    .checked_out
                    .insert(sender.id(), sender.interrupt_handle());
                drop(inner);
                debug!(sender = sender.id(), "sender created");
                Ok(self.checked_out(sender))
            }
            Err(e) => {
                drop(inner);
                self.available.notify_one();
                Err(e)
            }
        }
    }

    fn checked_out(&self, sender: S) -> PooledSender<'_, S> {
        self.metrics.inc_pool_acquired();
        PooledSender {
            pool: self,
            sender: Some(sender),
        }
    }

    /// Returns a sender to the pool.
    ///
    /// Runs its keepalive, then keeps it if healthy. An unhealthy sender is
    /// disconnected and dropped, and replaced if the pool fell below
    /// `min_idle`.
    pub fn release(&self, mut sender: S) {
        sender.keepalive();
        let healthy = sender.is_healthy();

        let mut inner = self.inner.lock();
        inner.checked_out.remove(&sender.id());
        if inner.closed {
            drop(inner);
            sender.disconnect();
            return;
        }
        if healthy {
            inner.idle.push(sender);
            drop(inner);
            self.available.notify_one();
            return;
        }

        let replace = inner.total() < self.config.min_idle;
        if replace {
            inner.creating += 1;
        }
        drop(inner);

        warn!(sender = sender.id(), "discarding unhealthy sender");
        self.metrics.inc_pool_discarded();
        sender.disconnect();
        drop(sender);

        if replace {
            let created = (self.factory)();
            let mut inner = self.inner.lock();
            inner.creating -= 1;
            match created {
                Ok(fresh) if !inner.closed => inner.idle.push(fresh),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to replace discarded sender"),
            }
        }
        self.available.notify_one();
    }

    /// Acquires a sender, broadcasts and releases it.
    pub fn send_message(&self, members: &[Member], payload: &Payload) -> Result<()> {
        let mut sender = self.acquire()?;
        sender.send_message(members, payload)?;
        Ok(())
    }

    /// Interrupts checked-out senders and closes the connections of idle ones.
    ///
    /// Interrupted senders abort their current broadcast and are discarded
    /// when released.
    pub fn disconnect_all(&self) {
        let (mut idle, interrupted) = {
            let mut inner = self.inner.lock();
            for handle in inner.checked_out.values() {
                handle.interrupt();
            }
            let idle = std::mem::take(&mut inner.idle);
            // Keep the slots reserved while the sockets are closed unlocked.
            inner.creating += idle.len();
            (idle, inner.checked_out.len())
        };
        for sender in idle.iter_mut() {
            sender.disconnect();
        }
        let count = idle.len();

        {
            let mut inner = self.inner.lock();
            inner.creating -= count;
            if !inner.closed {
                inner.idle.append(&mut idle);
            }
        }
        self.available.notify_all();
        debug!(interrupted, idle = count, "disconnected all senders");
    }

    /// Disconnects everything and refuses further acquisitions.
    pub fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            for handle in inner.checked_out.values() {
                handle.interrupt();
            }
            std::mem::take(&mut inner.idle)
        };
        for mut sender in idle {
            sender.disconnect();
        }
        self.available.notify_all();
        debug!("sender pool closed");
    }

    /// True after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            idle: inner.idle.len(),
            in_use: inner.checked_out.len(),
            max: self.config.max_senders,
        }
    }
}

/// A checked-out sender; returned to the pool on drop.
pub struct PooledSender<'a, S: MessageSender = Dispatcher> {
    pool: &'a SenderPool<S>,
    sender: Option<S>,
}

impl<S: MessageSender> std::fmt::Debug for PooledSender<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSender").finish_non_exhaustive()
    }
}

impl<S: MessageSender> PooledSender<'_, S> {
    /// Returns the sender to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl<S: MessageSender> Deref for PooledSender<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        match &self.sender {
            Some(sender) => sender,
            None => unreachable!("pooled sender accessed after release"),
        }
    }
}

impl<S: MessageSender> DerefMut for PooledSender<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        match &mut self.sender {
            Some(sender) => sender,
            None => unreachable!("pooled sender accessed after release"),
        }
    }
}

impl<S: MessageSender> Drop for PooledSender<'_, S> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            self.pool.release(sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MemberFailure, PartialFailure};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct FakeSender {
        id: u64,
        healthy: bool,
        interrupt: InterruptHandle,
        sent: usize,
        disconnects: usize,
        linger: Duration,
    }

    impl MessageSender for FakeSender {
        fn id(&self) -> u64 {
            self.id
        }

        fn send_message(
            &mut self,
            members: &[Member],
            _payload: &Payload,
        ) -> std::result::Result<(), PartialFailure> {
            if self.interrupt.is_interrupted() {
                let failures = members
                    .iter()
                    .map(|m| MemberFailure {
                        member: m.clone(),
                        cause: SendError::Disconnected,
                    })
                    .collect();
                return Err(PartialFailure::new(members.len(), failures));
            }
            self.sent += 1;
            Ok(())
        }

        fn keepalive(&mut self) {}

        fn is_healthy(&self) -> bool {
            self.healthy && !self.interrupt.is_interrupted()
        }

        fn disconnect(&mut self) {
            std::thread::sleep(self.linger);
            self.disconnects += 1;
            self.interrupt.clear();
        }

        fn interrupt_handle(&self) -> InterruptHandle {
            self.interrupt.clone()
        }
    }

    fn pool(min_idle: usize, max_senders: usize, timeout_ms: u64) -> SenderPool<FakeSender> {
        let next = Arc::new(AtomicU64::new(1));
        let config = PoolConfig {
            min_idle,
            max_senders,
            acquire_timeout_ms: timeout_ms,
        };
        SenderPool::new(
            config,
            Arc::new(TransportMetrics::new()),
            Box::new(move || {
                Ok(FakeSender {
                    id: next.fetch_add(1, Ordering::Relaxed),
                    healthy: true,
                    interrupt: InterruptHandle::default(),
                    sent: 0,
                    disconnects: 0,
                    linger: Duration::ZERO,
                })
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_prefills_min_idle() {
        let pool = pool(2, 4, 100);
        assert_eq!(
            pool.stats(),
            PoolStats {
                idle: 2,
                in_use: 0,
                max: 4
            }
        );
    }

    #[test]
    fn test_reacquire_returns_same_sender() {
        let pool = pool(0, 4, 100);
        let first = pool.acquire().unwrap().id();
        assert_eq!(pool.stats().idle, 1);
        let second = pool.acquire().unwrap().id();
        assert_eq!(first, second);
        assert_eq!(pool.metrics().snapshot().pool_acquired, 2);
    }

    #[test]
    fn test_exhausted_after_timeout() {
        let pool = pool(0, 1, 50);
        let _held = pool.acquire().unwrap();
        assert_eq!(pool.stats().in_use, 1);

        let start = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, SendError::PoolExhausted { timeout_ms: 50 }));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.metrics().snapshot().pool_exhausted, 1);
    }

    #[test]
    fn test_waiter_receives_released_sender() {
        let pool = pool(0, 1, 2000);
        let held = pool.acquire().unwrap();
        let id = held.id();

        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                held.release();
            });
            let sender = pool.acquire().unwrap();
            assert_eq!(sender.id(), id);
        });
    }

    #[test]
    fn test_unhealthy_sender_is_replaced() {
        let pool = pool(1, 2, 100);
        let mut sender = pool.acquire().unwrap();
        let id = sender.id();
        sender.healthy = false;
        drop(sender);

        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.metrics().snapshot().pool_discarded, 1);
        assert_ne!(pool.acquire().unwrap().id(), id);
    }

    #[test]
    fn test_disconnect_all_interrupts_checked_out() {
        let pool = pool(0, 2, 100);
        let mut sender = pool.acquire().unwrap();
        pool.disconnect_all();

        assert!(!sender.is_healthy());
        let err = sender
            .send_message(&[Member::new("127.0.0.1", 1)], &Payload::with_ack(&b"x"[..]))
            .unwrap_err();
        assert!(err.is_total());
        drop(sender);

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.metrics().snapshot().pool_discarded, 1);
    }

    #[test]
    fn test_disconnect_all_keeps_idle_senders() {
        let pool = pool(2, 2, 100);
        pool.disconnect_all();
        assert_eq!(
            pool.stats(),
            PoolStats {
                idle: 2,
                in_use: 0,
                max: 2
            }
        );

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.disconnects, b.disconnects), (1, 1));
        assert!(a.is_healthy() && b.is_healthy());
    }

    #[test]
    fn test_disconnect_all_does_not_hold_the_lock() {
        let pool = pool(0, 2, 100);
        let mut sender = pool.acquire().unwrap();
        sender.linger = Duration::from_millis(300);
        drop(sender);

        std::thread::scope(|s| {
            s.spawn(|| pool.disconnect_all());
            std::thread::sleep(Duration::from_millis(50));

            let start = Instant::now();
            let fresh = pool.acquire().unwrap();
            assert!(start.elapsed() < Duration::from_millis(200));
            assert_eq!(fresh.disconnects, 0);
            assert!(pool.acquire().is_err(), "reserved slot must count toward capacity");
        });
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn test_send_message_releases_sender() {
        let pool = pool(0, 1, 100);
        pool.send_message(&[Member::new("127.0.0.1", 1)], &Payload::with_ack(&b"x"[..]))
            .unwrap();
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.acquire().unwrap().sent, 1);
    }

    #[test]
    fn test_closed_pool_refuses_acquire() {
        let pool = pool(1, 2, 100);
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(SendError::Disconnected)));
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_factory_error_frees_slot() {
        let pool: SenderPool<FakeSender> = SenderPool::new(
            PoolConfig {
                min_idle: 0,
                max_senders: 1,
                acquire_timeout_ms: 10,
            },
            Arc::new(TransportMetrics::new()),
            Box::new(|| Err(SendError::Config("no reactor".into()))),
        )
        .unwrap();
        assert!(matches!(pool.acquire(), Err(SendError::Config(_))));
        assert!(matches!(pool.acquire(), Err(SendError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_sizing() {
        let result: Result<SenderPool<FakeSender>> = SenderPool::new(
            PoolConfig {
                min_idle: 3,
                max_senders: 2,
                acquire_timeout_ms: 10,
            },
            Arc::new(TransportMetrics::new()),
            Box::new(|| -> Result<FakeSender> { Err(SendError::Disconnected) }),
        );
        assert!(matches!(result, Err(SendError::Config(_))));
    }
}
