//! Parallel broadcast over one reactor.
//!
//! A [`Dispatcher`] keeps one [`Connection`] per member across calls and runs
//! the event loop on the calling thread. Each `send_message` loads the same
//! payload into every target connection, then polls until each member either
//! completed, failed permanently, or the overall deadline passed.

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::config::SenderConfig;
use crate::connection::{Connection, ConnectionState, Progress};
use crate::error::{MemberFailure, PartialFailure, Result, SendError};
use crate::health::{SenderState, SenderStates};
use crate::member::Member;
use crate::message::Payload;
use crate::metrics::TransportMetrics;
use crate::sender::{InterruptHandle, MessageSender};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

/// Per-member state of one broadcast.
#[derive(Debug)]
enum Outcome {
    /// Still being delivered; holds the cause of the last retried failure.
    InFlight(Option<SendError>),
    Completed,
    Failed(SendError),
}

impl Outcome {
    fn is_in_flight(&self) -> bool {
        matches!(self, Outcome::InFlight(_))
    }
}

/// Readiness of one token, copied out of the event buffer.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

/// Broadcasts payloads to members over non-blocking connections.
pub struct Dispatcher {
    id: u64,
    config: Arc<SenderConfig>,
    poll: Poll,
    events: Events,
    interrupt: InterruptHandle,
    connections: HashMap<Member, Connection>,
    tokens: HashMap<Token, Member>,
    next_token: usize,
    states: Arc<SenderStates>,
    metrics: Arc<TransportMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("connections", &self.connections.len())
            .field("interrupted", &self.interrupt.is_interrupted())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher sharing member health and metrics with its pool.
    pub fn new(
        config: Arc<SenderConfig>,
        states: Arc<SenderStates>,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        debug!(dispatcher = id, "dispatcher created");
        Ok(Self {
            id,
            config,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            interrupt: InterruptHandle::new(waker),
            connections: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            states,
            metrics,
        })
    }

    /// Creates a dispatcher with its own health registry and metrics.
    pub fn standalone(config: SenderConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            Arc::new(config),
            Arc::new(SenderStates::new()),
            Arc::new(TransportMetrics::new()),
        )
    }

    /// Configuration this dispatcher was built with.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Metrics collector.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Shared member health.
    pub fn sender_states(&self) -> &Arc<SenderStates> {
        &self.states
    }

    /// State of the connection to `member`, if one was ever created.
    pub fn connection_state(&self, member: &Member) -> Option<ConnectionState> {
        self.connections.get(member).map(Connection::state)
    }

    /// Number of members with a connection object.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Closes and forgets the connection to `member`.
    pub fn remove_member(&mut self, member: &Member) -> bool {
        let Some(mut conn) = self.connections.remove(member) else {
            return false;
        };
        self.tokens.remove(&conn.token());
        if conn.disconnect(self.poll.registry()) {
            self.metrics.inc_connections_closed();
        }
        debug!(dispatcher = self.id, member = %member, "member removed");
        true
    }

    fn broadcast(
        &mut self,
        members: &[Member],
        payload: &Payload,
    ) -> std::result::Result<(), PartialFailure> {
        let mut seen = HashSet::with_capacity(members.len());
        let targets: Vec<&Member> = members.iter().filter(|m| seen.insert(*m)).collect();
        if targets.is_empty() {
            return Ok(());
        }
        self.metrics.inc_broadcasts();
        let started = Instant::now();
        let attempted = targets.len();

        if self.interrupt.is_interrupted() {
            debug!(dispatcher = self.id, "broadcast on interrupted dispatcher");
            return Err(self.fail_all(&targets, || SendError::Disconnected));
        }
        if payload.len() as u64 > self.config.max_payload_bytes as u64 {
            let max_size = self.config.max_payload_bytes;
            let size = payload.len() as u64;
            return Err(self.fail_all(&targets, || SendError::PayloadTooLarge { size, max_size }));
        }

        let mut outcomes: HashMap<Member, Outcome> = HashMap::with_capacity(attempted);
        let mut in_flight = 0usize;
        for member in &targets {
            if self.config.skip_failing_members
                && self.states.state(member) == SenderState::Failing
            {
                debug!(member = %member, "skipping member marked failing");
                self.metrics.inc_messages_failed();
                outcomes.insert(
                    (*member).clone(),
                    Outcome::Failed(SendError::Unavailable { addr: member.addr() }),
                );
                continue;
            }
            match self.load(member, payload) {
                Ok(progress) => {
                    outcomes.insert((*member).clone(), Outcome::InFlight(None));
                    in_flight += 1;
                    self.apply(member, progress, payload, &mut outcomes, &mut in_flight);
                }
                Err(cause) => {
                    let outcome = self.handle_failure(member, cause);
                    if outcome.is_in_flight() {
                        in_flight += 1;
                    }
                    outcomes.insert((*member).clone(), outcome);
                }
            }
        }

        let deadline = started + self.config.timeout();
        let mut poll_error: Option<io::Error> = None;
        let mut ready: Vec<Readiness> = Vec::with_capacity(EVENTS_CAPACITY);

        while in_flight > 0 {
            if self.interrupt.is_interrupted() {
                debug!(dispatcher = self.id, in_flight, "broadcast interrupted");
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let mut wait = (deadline - now).min(self.config.poll_interval());
            if let Some(stall) = self.nearest_stall(&outcomes) {
                wait = wait.min(stall.saturating_duration_since(now));
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(wait)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(dispatcher = self.id, error = %e, "reactor poll failed");
                poll_error = Some(e);
                break;
            }

            ready.clear();
            ready.extend(
                self.events
                    .iter()
                    .filter(|event| event.token() != WAKER_TOKEN)
                    .map(|event| Readiness {
                        token: event.token(),
                        readable: event.is_readable() || event.is_read_closed(),
                        writable: event.is_writable() || event.is_write_closed(),
                        error: event.is_error(),
                    }),
            );

            for r in ready.drain(..) {
                let Some(member) = self.tokens.get(&r.token).cloned() else {
                    continue;
                };
                let registry = self.poll.registry();
                let progress = match self.connections.get_mut(&member) {
                    Some(conn) => conn.on_event(registry, r.readable, r.writable, r.error),
                    None => continue,
                };
                self.apply(&member, progress, payload, &mut outcomes, &mut in_flight);
            }

            let now = Instant::now();
            for member in &targets {
                if !outcomes.get(*member).is_some_and(Outcome::is_in_flight) {
                    continue;
                }
                let registry = self.poll.registry();
                let progress = match self.connections.get_mut(*member) {
                    Some(conn) => conn.check_stalled(registry, now),
                    None => continue,
                };
                self.apply(member, progress, payload, &mut outcomes, &mut in_flight);
            }

            trace!(
                dispatcher = self.id,
                in_flight,
                total = attempted,
                "broadcast progress"
            );
        }

        let interrupted = self.interrupt.is_interrupted();
        let mut failures = Vec::new();
        for member in &targets {
            let cause = match outcomes.remove(*member) {
                Some(Outcome::Completed) | None => continue,
                Some(Outcome::Failed(cause)) => cause,
                Some(Outcome::InFlight(last)) => {
                    self.give_up(member);
                    if interrupted {
                        self.metrics.inc_messages_failed();
                        SendError::Disconnected
                    } else if let Some(e) = &poll_error {
                        self.metrics.inc_messages_failed();
                        SendError::Io(io::Error::new(e.kind(), e.to_string()))
                    } else if let Some(last) = last {
                        self.record_permanent(member, &last);
                        last
                    } else {
                        let cause = SendError::timeout(member, self.config.timeout_ms);
                        self.record_permanent(member, &cause);
                        cause
                    }
                }
            };
            failures.push(MemberFailure {
                member: (*member).clone(),
                cause,
            });
        }

        debug!(
            dispatcher = self.id,
            members = attempted,
            failed = failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "broadcast finished"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PartialFailure::new(attempted, failures))
        }
    }

    /// Creates the connection if needed, loads the payload and connects.
    ///
    /// A socket kept from an earlier broadcast may have finished its handshake
    /// while nobody polled it; the edge that reported it is gone, so the
    /// handshake is checked here.
    fn load(&mut self, member: &Member, payload: &Payload) -> Result<Progress> {
        let conn = self.connections.entry(member.clone()).or_insert_with(|| {
            let token = Token(self.next_token);
            self.next_token += 1;
            self.tokens.insert(token, member.clone());
            Connection::new(member.clone(), token, &self.config)
        });
        let registry = self.poll.registry();
        conn.set_message(registry, payload)?;
        if !conn.has_socket() {
            conn.connect(registry)?;
            self.metrics.inc_connections_opened();
            return Ok(Progress::NotDone);
        }
        if conn.state() == ConnectionState::Connecting {
            return Ok(conn.on_connectable(registry));
        }
        Ok(Progress::NotDone)
    }

    fn apply(
        &mut self,
        member: &Member,
        progress: Progress,
        payload: &Payload,
        outcomes: &mut HashMap<Member, Outcome>,
        in_flight: &mut usize,
    ) {
        let tracked = outcomes.get(member).is_some_and(Outcome::is_in_flight);
        match progress {
            Progress::NotDone => {}
            Progress::Done if tracked => {
                if let Some(conn) = self.connections.get(member) {
                    self.metrics.add_bytes_sent(conn.message_len() as u64);
                }
                self.metrics.inc_messages_sent();
                if payload.require_ack() {
                    self.metrics.inc_acks_received();
                }
                if self.states.entry(member).record_success() != SenderState::Ready {
                    info!(member = %member, "member recovered");
                }
                outcomes.insert(member.clone(), Outcome::Completed);
                *in_flight -= 1;
            }
            Progress::Done => {}
            Progress::Failed(cause) if tracked => {
                let outcome = self.handle_failure(member, cause);
                if !outcome.is_in_flight() {
                    *in_flight -= 1;
                }
                outcomes.insert(member.clone(), outcome);
            }
            Progress::Failed(cause) => {
                trace!(member = %member, error = %cause, "untracked connection failed");
                self.give_up(member);
            }
        }
    }

    /// Retries `cause` if allowed, otherwise records a permanent failure.
    fn handle_failure(&mut self, member: &Member, mut cause: SendError) -> Outcome {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(member) else {
            return Outcome::Failed(cause);
        };
        let health = self.states.entry(member);

        while cause.is_retryable() && conn.attempts() < self.config.max_retry_attempts {
            let previous = health.record_suspect();
            let attempt = conn.attempts() + 1;
            if previous == SenderState::Failing {
                debug!(member = %member, attempt, error = %cause, "send to failing member failed, retrying");
            } else {
                warn!(member = %member, attempt, error = %cause, "send failed, retrying");
            }
            self.metrics.inc_retries();
            if conn.disconnect(registry) {
                self.metrics.inc_connections_closed();
            }
            match conn.retry(registry) {
                Ok(()) => {
                    self.metrics.inc_connections_opened();
                    return Outcome::InFlight(Some(cause));
                }
                Err(e) => cause = e,
            }
        }

        if conn.has_socket() {
            self.metrics.inc_connections_closed();
        }
        conn.disconnect(registry);
        conn.reset(registry);
        self.record_permanent(member, &cause);
        Outcome::Failed(cause)
    }

    fn record_permanent(&self, member: &Member, cause: &SendError) {
        self.metrics.inc_messages_failed();
        match cause {
            SendError::FailAck { .. } => self.metrics.inc_fail_acks_received(),
            SendError::Timeout { .. } => self.metrics.inc_timeouts(),
            _ => {}
        }
        if self.states.entry(member).record_failing() == SenderState::Failing {
            debug!(member = %member, error = %cause, "send to failing member failed");
        } else {
            error!(member = %member, error = %cause, "send failed");
        }
    }

    /// Drops the in-flight message of a member the broadcast stopped waiting for.
    fn give_up(&mut self, member: &Member) {
        let registry = self.poll.registry();
        if let Some(conn) = self.connections.get_mut(member) {
            if conn.abandon(registry) {
                self.metrics.inc_connections_closed();
            }
        }
    }

    fn nearest_stall(&self, outcomes: &HashMap<Member, Outcome>) -> Option<Instant> {
        outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_in_flight())
            .filter_map(|(member, _)| self.connections.get(member)?.stall_deadline())
            .min()
    }

    fn fail_all(&self, targets: &[&Member], cause: impl Fn() -> SendError) -> PartialFailure {
        let failures = targets
            .iter()
            .map(|member| {
                self.metrics.inc_messages_failed();
                MemberFailure {
                    member: (*member).clone(),
                    cause: cause(),
                }
            })
            .collect();
        PartialFailure::new(targets.len(), failures)
    }

    /// Handles readiness on connections not part of a broadcast.
    fn drain_idle_events(&mut self) {
        if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            trace!(dispatcher = self.id, error = %e, "idle poll failed");
            return;
        }
        let ready: Vec<Readiness> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                error: event.is_error(),
            })
            .collect();
        let registry = self.poll.registry();
        for r in ready {
            let Some(conn) = self
                .tokens
                .get(&r.token)
                .and_then(|member| self.connections.get_mut(member))
            else {
                continue;
            };
            let had_socket = conn.has_socket();
            let progress = conn.on_event(registry, r.readable, r.writable, r.error);
            if let Progress::Failed(cause) = progress {
                debug!(dispatcher = self.id, member = %conn.member(), error = %cause, "idle connection failed");
            }
            if had_socket && !conn.has_socket() {
                self.metrics.inc_connections_closed();
            }
        }
    }
}

impl MessageSender for Dispatcher {
    fn id(&self) -> u64 {
        self.id
    }

    fn send_message(
        &mut self,
        members: &[Member],
        payload: &Payload,
    ) -> std::result::Result<(), PartialFailure> {
        self.broadcast(members, payload)
    }

    /// Closes errored connections and those idle past `keepalive_idle_ms`,
    /// and notices peers that closed idle connections.
    ///
    /// Members left without a socket are forgotten; their next broadcast
    /// creates a fresh connection.
    fn keepalive(&mut self) {
        self.drain_idle_events();
        let registry = self.poll.registry();
        let now = Instant::now();
        let idle_limit = self.config.keepalive_idle();
        let mut closed = Vec::new();
        for (member, conn) in self.connections.iter_mut() {
            let expired = match (idle_limit, conn.idle_for(now)) {
                (Some(limit), Some(idle)) => idle >= limit,
                _ => false,
            };
            if (expired || conn.state() == ConnectionState::Error) && conn.disconnect(registry) {
                debug!(dispatcher = self.id, member = %member, expired, "closed by keepalive");
                self.metrics.inc_connections_closed();
            }
            if !conn.has_socket() && !conn.is_in_flight() {
                closed.push(member.clone());
            }
        }
        for member in closed {
            if let Some(conn) = self.connections.remove(&member) {
                self.tokens.remove(&conn.token());
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.interrupt.is_interrupted()
    }

    fn disconnect(&mut self) {
        let registry = self.poll.registry();
        for conn in self.connections.values_mut() {
            conn.reset(registry);
            if conn.disconnect(registry) {
                self.metrics.inc_connections_closed();
            }
        }
        self.interrupt.clear();
        debug!(dispatcher = self.id, "all connections closed");
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}
