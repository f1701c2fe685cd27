//! Non-blocking connection to a single member.
//!
//! A [`Connection`] owns one socket and at most one outbound message. The
//! dispatcher feeds it readiness events; each call advances the state machine
//! and reports [`Progress`]. The connection never retries on its own.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use tracing::{debug, trace, warn};

use crate::codec::{encode_payload, AckKind, PackageBuffer};
use crate::config::{SenderConfig, SocketOptions};
use crate::error::{Result, SendError};
use crate::member::Member;
use crate::message::Payload;

const READ_CHUNK: usize = 512;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Non-blocking connect issued, handshake pending.
    Connecting,
    /// Connected with nothing in flight.
    Idle,
    /// Draining the write buffer.
    Writing,
    /// Message written, waiting for ACK / FAIL_ACK.
    AckWaiting,
    /// An I/O or protocol error occurred; the socket must be closed.
    Error,
}

impl ConnectionState {
    /// Reactor interest for this state; `None` means not registered.
    fn interest(self) -> Option<Interest> {
        match self {
            ConnectionState::Connecting | ConnectionState::Writing => Some(Interest::WRITABLE),
            ConnectionState::Idle | ConnectionState::AckWaiting => Some(Interest::READABLE),
            ConnectionState::Disconnected | ConnectionState::Error => None,
        }
    }
}

/// Result of handling one readiness event.
#[derive(Debug)]
pub enum Progress {
    /// The message is still in flight.
    NotDone,
    /// The message was delivered (and acknowledged, if requested).
    Done,
    /// The connection failed; it is now in [`ConnectionState::Error`].
    Failed(SendError),
}

/// One reusable connection to a member.
#[derive(Debug)]
pub struct Connection {
    member: Member,
    token: Token,
    options: SocketOptions,
    max_body: u32,
    connect_timeout: Duration,
    io_timeout: Duration,
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    interest: Option<Interest>,
    state: ConnectionState,
    write_buf: Bytes,
    write_pos: usize,
    ack_buf: PackageBuffer,
    require_ack: bool,
    in_flight: bool,
    attempts: u32,
    last_activity: Instant,
}

impl Connection {
    /// Creates a disconnected connection registered under `token`.
    pub fn new(member: Member, token: Token, config: &SenderConfig) -> Self {
        Self {
            member,
            token,
            options: config.socket.clone(),
            max_body: config.max_payload_bytes,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            addr: None,
            stream: None,
            interest: None,
            state: ConnectionState::Disconnected,
            write_buf: Bytes::new(),
            write_pos: 0,
            ack_buf: PackageBuffer::new(config.max_payload_bytes),
            require_ack: false,
            in_flight: false,
            attempts: 0,
            last_activity: Instant::now(),
        }
    }

    /// Destination member.
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Reactor token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries made for the current message.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True while a message is loaded and not yet delivered.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// True when a socket exists, whether or not the handshake finished.
    pub fn has_socket(&self) -> bool {
        self.stream.is_some()
    }

    /// Encoded size of the current message.
    pub fn message_len(&self) -> usize {
        self.write_buf.len()
    }

    /// Address the member resolved to, once a connect has been attempted.
    pub fn resolved_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Time of the last successful socket operation.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Opens a non-blocking socket and registers for connect completion.
    ///
    /// Does nothing if a socket already exists.
    pub fn connect(&mut self, registry: &Registry) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        match self.open(registry) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.interest = Some(Interest::WRITABLE);
                self.state = ConnectionState::Connecting;
                self.last_activity = Instant::now();
                debug!(member = %self.member, token = self.token.0, "connecting");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// The member name is looked up once per connection; reconnects and
    /// retries reuse the cached address.
    fn open(&mut self, registry: &Registry) -> Result<TcpStream> {
        let addr = match self.addr {
            Some(addr) => addr,
            None => {
                let addr = self.member.resolve()?;
                self.addr = Some(addr);
                addr
            }
        };
        let mut stream =
            TcpStream::connect(addr).map_err(|e| SendError::connect(&self.member, e))?;
        apply_socket_options(&stream, &self.options)
            .map_err(|e| SendError::connect(&self.member, e))?;
        registry
            .register(&mut stream, self.token, Interest::WRITABLE)
            .map_err(|e| SendError::connect(&self.member, e))?;
        Ok(stream)
    }

    /// Loads a message, replacing whatever the buffers held before.
    ///
    /// Only legal when nothing is in flight. On an idle connection the write
    /// starts with the next writable event; otherwise it starts once the
    /// handshake completes.
    pub fn set_message(&mut self, registry: &Registry, payload: &Payload) -> Result<()> {
        if self.in_flight
            || matches!(
                self.state,
                ConnectionState::Writing | ConnectionState::AckWaiting
            )
        {
            return Err(SendError::Busy {
                addr: self.member.addr(),
            });
        }
        self.write_buf = encode_payload(payload, self.max_body)?;
        self.require_ack = payload.require_ack();
        self.attempts = 0;
        self.rewind();
        if self.state == ConnectionState::Idle {
            self.transition(registry, ConnectionState::Writing)
                .map_err(|e| SendError::write(&self.member, e))?;
        }
        Ok(())
    }

    /// Closes the socket, reconnects and resends the current message.
    ///
    /// Counts as one retry attempt.
    pub fn retry(&mut self, registry: &Registry) -> Result<()> {
        self.disconnect(registry);
        self.attempts += 1;
        self.rewind();
        self.connect(registry)
    }

    fn rewind(&mut self) {
        self.write_pos = 0;
        self.ack_buf.clear();
        self.in_flight = true;
        self.last_activity = Instant::now();
    }

    /// Routes a readiness event to the handler for the current state.
    pub fn on_event(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        error: bool,
    ) -> Progress {
        match self.state {
            ConnectionState::Connecting if writable || error => self.on_connectable(registry),
            ConnectionState::Writing if writable || error => self.on_writable(registry),
            ConnectionState::AckWaiting | ConnectionState::Idle if readable || error => {
                self.on_readable(registry)
            }
            _ => Progress::NotDone,
        }
    }

    /// Completes a pending handshake and starts writing if a message is loaded.
    pub fn on_connectable(&mut self, registry: &Registry) -> Progress {
        if self.state != ConnectionState::Connecting {
            return Progress::NotDone;
        }
        let handshake = match self.stream.as_ref() {
            Some(stream) => handshake_status(stream),
            None => return Progress::NotDone,
        };
        match handshake {
            Ok(true) => {}
            Ok(false) => return Progress::NotDone,
            Err(e) => return self.fail(registry, SendError::connect(&self.member, e)),
        }

        debug!(member = %self.member, "connected");
        self.last_activity = Instant::now();
        let next = if self.in_flight {
            ConnectionState::Writing
        } else {
            ConnectionState::Idle
        };
        if let Err(e) = self.transition(registry, next) {
            return self.fail(registry, SendError::connect(&self.member, e));
        }
        if next == ConnectionState::Writing {
            self.on_writable(registry)
        } else {
            Progress::NotDone
        }
    }

    /// Writes as much of the buffer as the socket accepts.
    pub fn on_writable(&mut self, registry: &Registry) -> Progress {
        if self.state != ConnectionState::Writing {
            return Progress::NotDone;
        }
        match self.flush() {
            Err(e) => self.fail(registry, SendError::write(&self.member, e)),
            Ok(false) => Progress::NotDone,
            Ok(true) if self.require_ack => {
                match self.transition(registry, ConnectionState::AckWaiting) {
                    Ok(()) => Progress::NotDone,
                    Err(e) => self.fail(registry, SendError::write(&self.member, e)),
                }
            }
            Ok(true) => self.complete(registry, false),
        }
    }

    /// Reads the acknowledgement, or checks an idle socket for a close.
    pub fn on_readable(&mut self, registry: &Registry) -> Progress {
        match self.state {
            ConnectionState::AckWaiting => self.read_ack(registry),
            ConnectionState::Idle => {
                self.probe_liveness(registry);
                Progress::NotDone
            }
            _ => Progress::NotDone,
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        while self.write_pos < self.write_buf.len() {
            match stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.write_pos += n;
                    self.last_activity = Instant::now();
                    trace!(
                        member = %self.member,
                        len = n,
                        remaining = self.write_buf.len() - self.write_pos,
                        "wrote to socket"
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_ack(&mut self, registry: &Registry) -> Progress {
        let peer_closed = match self.fill_ack_buf() {
            Ok(closed) => closed,
            Err(e) => return self.fail(registry, SendError::read(&self.member, e)),
        };

        match self.ack_buf.extract_package() {
            Ok(Some(package)) => match AckKind::classify(&package.body) {
                Some(AckKind::Ack) => {
                    if !self.ack_buf.is_empty() {
                        warn!(
                            member = %self.member,
                            len = self.ack_buf.len(),
                            "discarding bytes after ACK"
                        );
                    }
                    self.complete(registry, peer_closed)
                }
                Some(AckKind::FailAck) => self.fail(
                    registry,
                    SendError::FailAck {
                        addr: self.member.addr(),
                    },
                ),
                None => self.fail(
                    registry,
                    SendError::protocol(
                        &self.member,
                        format!("unexpected {}-byte response", package.body.len()),
                    ),
                ),
            },
            Ok(None) if peer_closed => self.fail(
                registry,
                SendError::read(
                    &self.member,
                    io::Error::new(ErrorKind::UnexpectedEof, "connection closed by peer"),
                ),
            ),
            Ok(None) => Progress::NotDone,
            Err(e) => self.fail(registry, SendError::protocol(&self.member, e.to_string())),
        }
    }

    /// Reads until the socket would block; returns whether the peer closed.
    fn fill_ack_buf(&mut self) -> io::Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.ack_buf.append(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn complete(&mut self, registry: &Registry, peer_closed: bool) -> Progress {
        self.in_flight = false;
        self.ack_buf.clear();
        self.last_activity = Instant::now();
        if peer_closed {
            debug!(member = %self.member, "peer closed after acknowledging");
            self.disconnect(registry);
            return Progress::Done;
        }
        if let Err(e) = self.transition(registry, ConnectionState::Idle) {
            warn!(member = %self.member, error = %e, "failed to park connection");
            self.disconnect(registry);
            return Progress::Done;
        }
        if !self.require_ack {
            self.probe_liveness(registry);
        }
        Progress::Done
    }

    /// Best-effort non-blocking read on an idle socket.
    ///
    /// Unsolicited bytes are discarded. A closed peer drops the socket so the
    /// next message reconnects; it never fails the message that just completed.
    fn probe_liveness(&mut self, registry: &Registry) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut scratch = [0u8; 64];
        let closed = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break true,
                Ok(n) => trace!(member = %self.member, len = n, "discarding unsolicited bytes"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(member = %self.member, error = %e, "liveness read failed");
                    break true;
                }
            }
        };
        if closed {
            debug!(member = %self.member, "peer closed idle connection");
            self.disconnect(registry);
        }
    }

    fn fail(&mut self, registry: &Registry, cause: SendError) -> Progress {
        debug!(member = %self.member, state = ?self.state, error = %cause, "connection failed");
        if let Err(e) = self.transition(registry, ConnectionState::Error) {
            trace!(member = %self.member, error = %e, "deregister failed");
            self.interest = None;
            self.state = ConnectionState::Error;
        }
        Progress::Failed(cause)
    }

    fn transition(&mut self, registry: &Registry, state: ConnectionState) -> io::Result<()> {
        let wanted = state.interest();
        if let Some(stream) = self.stream.as_mut() {
            match (self.interest, wanted) {
                (None, Some(interest)) => registry.register(stream, self.token, interest)?,
                (Some(current), Some(interest)) if current != interest => {
                    registry.reregister(stream, self.token, interest)?
                }
                (Some(_), None) => registry.deregister(stream)?,
                _ => {}
            }
            self.interest = wanted;
        }
        self.state = state;
        Ok(())
    }

    /// Time at which the in-flight message counts as stalled.
    pub fn stall_deadline(&self) -> Option<Instant> {
        if !self.in_flight {
            return None;
        }
        match self.state {
            ConnectionState::Connecting => Some(self.last_activity + self.connect_timeout),
            ConnectionState::Writing | ConnectionState::AckWaiting => {
                Some(self.last_activity + self.io_timeout)
            }
            _ => None,
        }
    }

    /// Fails the connection if it has made no progress within its timeout.
    ///
    /// A stalled handshake is a connect error; a stalled write or ack wait is
    /// a timeout.
    pub fn check_stalled(&mut self, registry: &Registry, now: Instant) -> Progress {
        match self.stall_deadline() {
            Some(deadline) if now >= deadline => {}
            _ => return Progress::NotDone,
        }
        let cause = if self.state == ConnectionState::Connecting {
            SendError::connect(
                &self.member,
                io::Error::new(
                    ErrorKind::TimedOut,
                    format!("no handshake within {}ms", self.connect_timeout.as_millis()),
                ),
            )
        } else {
            SendError::timeout(&self.member, self.io_timeout.as_millis() as u64)
        };
        self.fail(registry, cause)
    }

    /// How long an idle connection has gone unused.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        (self.state == ConnectionState::Idle && !self.in_flight)
            .then(|| now.saturating_duration_since(self.last_activity))
    }

    /// Clears buffers and counters without closing the socket.
    ///
    /// A connection caught mid-write or mid-ack-wait goes back to idle; the
    /// caller is responsible for the stream position in that case. An errored
    /// connection is closed.
    pub fn reset(&mut self, registry: &Registry) {
        self.write_buf = Bytes::new();
        self.write_pos = 0;
        self.ack_buf.clear();
        self.in_flight = false;
        self.attempts = 0;
        match self.state {
            ConnectionState::Writing | ConnectionState::AckWaiting => {
                if self.transition(registry, ConnectionState::Idle).is_err() {
                    self.disconnect(registry);
                }
            }
            ConnectionState::Error => {
                self.disconnect(registry);
            }
            _ => {}
        }
    }

    /// Drops the in-flight message after the broadcast gave up on it.
    ///
    /// A pending handshake keeps its socket for the next message. A partial
    /// write or an outstanding ack leaves the stream position unknown, so
    /// those sockets are closed.
    pub fn abandon(&mut self, registry: &Registry) -> bool {
        let closed = match self.state {
            ConnectionState::Connecting | ConnectionState::Idle => false,
            _ => self.disconnect(registry),
        };
        self.reset(registry);
        closed
    }

    /// Closes the socket. Idempotent; returns whether a socket was open.
    pub fn disconnect(&mut self, registry: &Registry) -> bool {
        let was_open = match self.stream.take() {
            Some(mut stream) => {
                if self.interest.is_some() {
                    let _ = registry.deregister(&mut stream);
                }
                let _ = stream.shutdown(Shutdown::Both);
                debug!(member = %self.member, "disconnected");
                true
            }
            None => false,
        };
        self.interest = None;
        self.state = ConnectionState::Disconnected;
        self.write_pos = 0;
        self.ack_buf.clear();
        was_open
    }
}

/// `Ok(true)` once connected, `Ok(false)` on a spurious wakeup.
fn handshake_status(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

fn apply_socket_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.tcp_nodelay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(options.so_keepalive)?;
    if let Some(secs) = options.so_linger_secs {
        sock.set_linger(Some(Duration::from_secs(secs as u64)))?;
    }
    if let Some(tos) = options.traffic_class {
        if let Err(e) = sock.set_tos(tos) {
            trace!(error = %e, "IP_TOS not applied");
        }
    }
    if options.tx_buffer_size > 0 {
        sock.set_send_buffer_size(options.tx_buffer_size)?;
    }
    if options.rx_buffer_size > 0 {
        sock.set_recv_buffer_size(options.rx_buffer_size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ack_package, encode_package};
    use crate::message::SendOptions;
    use mio::{Events, Poll};
    use std::net::{SocketAddr, TcpListener};
    use std::thread::{self, JoinHandle};

    /// Accepts one connection, reads one package, then writes `reply`.
    fn spawn_peer(reply: Option<Vec<u8>>) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = PackageBuffer::default();
            let mut chunk = [0u8; 4096];
            let body = loop {
                if let Some(pkg) = buf.extract_package().unwrap() {
                    break pkg.body.to_vec();
                }
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break Vec::new();
                }
                buf.append(&chunk[..n]);
            };
            if let Some(reply) = reply {
                stream.write_all(&reply).unwrap();
                thread::sleep(Duration::from_millis(50));
            }
            body
        });
        (addr, handle)
    }

    fn test_config() -> SenderConfig {
        SenderConfig {
            connect_timeout_ms: 1000,
            io_timeout_ms: 1000,
            ..SenderConfig::default()
        }
    }

    fn drive(poll: &mut Poll, conn: &mut Connection) -> Progress {
        let mut events = Events::with_capacity(16);
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            for event in events.iter() {
                let progress = conn.on_event(
                    poll.registry(),
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                );
                if !matches!(progress, Progress::NotDone) {
                    return progress;
                }
            }
            let progress = conn.check_stalled(poll.registry(), Instant::now());
            if !matches!(progress, Progress::NotDone) {
                return progress;
            }
        }
        panic!("connection did not finish");
    }

    fn connection_to(addr: SocketAddr, config: &SenderConfig) -> Connection {
        Connection::new(Member::from_socket_addr(addr), Token(1), config)
    }

    #[test]
    fn test_send_with_ack() {
        let (addr, peer) = spawn_peer(Some(ack_package(AckKind::Ack).to_vec()));
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());

        conn.set_message(poll.registry(), &Payload::with_ack(&b"hello"[..]))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.connect(poll.registry()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(matches!(drive(&mut poll, &mut conn), Progress::Done));
        assert!(!conn.is_in_flight());
        assert_eq!(peer.join().unwrap(), b"hello");
    }

    #[test]
    fn test_fail_ack() {
        let (addr, peer) = spawn_peer(Some(ack_package(AckKind::FailAck).to_vec()));
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());

        conn.set_message(poll.registry(), &Payload::with_ack(&b"x"[..]))
            .unwrap();
        conn.connect(poll.registry()).unwrap();

        match drive(&mut poll, &mut conn) {
            Progress::Failed(SendError::FailAck { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.is_in_flight());
        peer.join().unwrap();
    }

    #[test]
    fn test_unexpected_response_is_protocol_error() {
        let reply = encode_package(SendOptions::no_ack(), b"what?").to_vec();
        let (addr, peer) = spawn_peer(Some(reply));
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());

        conn.set_message(poll.registry(), &Payload::with_ack(&b"x"[..]))
            .unwrap();
        conn.connect(poll.registry()).unwrap();

        match drive(&mut poll, &mut conn) {
            Progress::Failed(e) => assert!(matches!(e, SendError::Protocol { .. })),
            other => panic!("unexpected {other:?}"),
        }
        peer.join().unwrap();
    }

    #[test]
    fn test_peer_close_while_waiting_is_read_error() {
        let (addr, peer) = spawn_peer(None);
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());

        conn.set_message(poll.registry(), &Payload::with_ack(&b"x"[..]))
            .unwrap();
        conn.connect(poll.registry()).unwrap();

        match drive(&mut poll, &mut conn) {
            Progress::Failed(e) => {
                assert!(matches!(e, SendError::Read { .. }));
                assert!(e.is_retryable());
            }
            other => panic!("unexpected {other:?}"),
        }
        peer.join().unwrap();
    }

    #[test]
    fn test_no_ack_completes_after_write() {
        let (addr, peer) = spawn_peer(None);
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());

        conn.set_message(poll.registry(), &Payload::without_ack(&b"fire"[..]))
            .unwrap();
        conn.connect(poll.registry()).unwrap();

        assert!(matches!(drive(&mut poll, &mut conn), Progress::Done));
        assert!(!conn.is_in_flight());
        assert_eq!(peer.join().unwrap(), b"fire");
    }

    #[test]
    fn test_large_payload_survives_partial_writes() {
        let (addr, peer) = spawn_peer(Some(ack_package(AckKind::Ack).to_vec()));
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());
        let data: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

        conn.set_message(poll.registry(), &Payload::with_ack(data.clone()))
            .unwrap();
        conn.connect(poll.registry()).unwrap();

        assert!(matches!(drive(&mut poll, &mut conn), Progress::Done));
        assert_eq!(peer.join().unwrap(), data);
    }

    #[test]
    fn test_refused_connect_fails() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());
        conn.set_message(poll.registry(), &Payload::with_ack(&b"x"[..]))
            .unwrap();

        let cause = match conn.connect(poll.registry()) {
            Err(e) => e,
            Ok(()) => match drive(&mut poll, &mut conn) {
                Progress::Failed(e) => e,
                other => panic!("unexpected {other:?}"),
            },
        };
        assert!(matches!(cause, SendError::Connect { .. }));
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[test]
    fn test_set_message_while_in_flight_is_busy() {
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to("127.0.0.1:9".parse().unwrap(), &test_config());
        let payload = Payload::with_ack(&b"x"[..]);
        conn.set_message(poll.registry(), &payload).unwrap();
        assert!(matches!(
            conn.set_message(poll.registry(), &payload),
            Err(SendError::Busy { .. })
        ));

        conn.reset(poll.registry());
        assert!(!conn.is_in_flight());
        conn.set_message(poll.registry(), &payload).unwrap();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (addr, _peer) = spawn_peer(None);
        let poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());
        conn.connect(poll.registry()).unwrap();
        assert!(conn.has_socket());

        assert!(conn.disconnect(poll.registry()));
        assert!(!conn.disconnect(poll.registry()));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.has_socket());
    }

    #[test]
    fn test_handshake_finished_between_polls_parks_idle() {
        let (addr, peer) = spawn_peer(Some(ack_package(AckKind::Ack).to_vec()));
        let mut poll = Poll::new().unwrap();
        let mut conn = connection_to(addr, &test_config());
        conn.connect(poll.registry()).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(matches!(
            conn.on_event(poll.registry(), false, true, false),
            Progress::NotDone
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.set_message(poll.registry(), &Payload::with_ack(&b"late"[..]))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Writing);
        assert!(matches!(drive(&mut poll, &mut conn), Progress::Done));
        assert_eq!(peer.join().unwrap(), b"late");
    }

    #[test]
    fn test_address_survives_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let poll = Poll::new().unwrap();
        let mut conn = Connection::new(Member::new("127.0.0.1", port), Token(1), &test_config());
        assert!(conn.resolved_addr().is_none());

        conn.connect(poll.registry()).unwrap();
        let resolved = conn.resolved_addr().unwrap();
        assert_eq!(resolved.port(), port);

        conn.retry(poll.registry()).unwrap();
        assert_eq!(conn.attempts(), 1);
        assert_eq!(conn.resolved_addr(), Some(resolved));
        conn.disconnect(poll.registry());
        assert_eq!(conn.resolved_addr(), Some(resolved));
    }

    #[test]
    fn test_stall_deadline_only_when_in_flight() {
        let poll = Poll::new().unwrap();
        let config = test_config();
        let mut conn = connection_to("127.0.0.1:9".parse().unwrap(), &config);
        assert!(conn.stall_deadline().is_none());

        conn.set_message(poll.registry(), &Payload::with_ack(&b"x"[..]))
            .unwrap();
        assert!(conn.stall_deadline().is_none());
        assert!(matches!(
            conn.check_stalled(poll.registry(), Instant::now() + Duration::from_secs(60)),
            Progress::NotDone
        ));
    }
}
