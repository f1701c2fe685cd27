//! Shared peers and fixtures for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcast::{
    codec::ack_package, serve_connection, AckKind, AckReceiver, Dispatcher, Member, Package,
    PackageBuffer, PackageHandler, PartialFailure, Payload, SenderConfig,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Config tuned for fast tests.
pub fn config(timeout_ms: u64, max_retry_attempts: u32) -> SenderConfig {
    SenderConfig {
        timeout_ms,
        connect_timeout_ms: 1000,
        io_timeout_ms: timeout_ms.max(1000),
        max_retry_attempts,
        poll_interval_ms: 50,
        ..SenderConfig::default()
    }
}

/// A receiver answering ACK (or FAIL_ACK when `accept` is false).
pub async fn receiver(accept: bool) -> (Member, AckReceiver) {
    let handler: Arc<dyn PackageHandler> = Arc::new(move |_: &Package, _: SocketAddr| accept);
    let receiver = AckReceiver::bind("127.0.0.1:0", handler).await.unwrap();
    (Member::from_socket_addr(receiver.local_addr()), receiver)
}

/// How a [`Peer`] treats incoming connections.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Acknowledge every package after `delay`.
    DelayedAck(Duration),
    /// Read everything, never answer.
    Silent,
    /// Drop the first `n` connections on accept, then acknowledge.
    DropFirst(usize),
}

/// A scripted member backed by a tokio listener.
pub struct Peer {
    pub member: Member,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Peer {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, behavior)
    }

    /// Serves an already bound listener.
    pub fn serve(listener: TcpListener, behavior: Behavior) -> Self {
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::clone(&connections);
        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, peer, behavior, index));
            }
        });
        Self {
            member: Member::from_socket_addr(addr),
            connections,
            task,
        }
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, peer: SocketAddr, behavior: Behavior, index: usize) {
    match behavior {
        Behavior::DropFirst(n) if index < n => drop(stream),
        Behavior::DropFirst(_) => {
            let handler = |_: &Package, _: SocketAddr| true;
            let _ = serve_connection(stream, peer, &handler, meshcast::codec::DEFAULT_MAX_BODY).await;
        }
        Behavior::Silent => {
            let mut chunk = [0u8; 4096];
            while let Ok(n) = stream.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
            }
        }
        Behavior::DelayedAck(delay) => {
            let mut buf = PackageBuffer::default();
            let mut chunk = [0u8; 4096];
            loop {
                while let Ok(Some(package)) = buf.extract_package() {
                    tokio::time::sleep(delay).await;
                    if package.options.require_ack
                        && stream.write_all(&ack_package(AckKind::Ack)).await.is_err()
                    {
                        return;
                    }
                }
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.append(&chunk[..n]),
                }
            }
        }
    }
}

/// A listener whose accept queue is full, so new handshakes stall.
///
/// The kernel drops incoming SYNs until [`StalledListener::serve`] starts
/// accepting; clients then complete on their next SYN retransmit.
pub struct StalledListener {
    pub member: Member,
    listener: std::net::TcpListener,
    fillers: Vec<std::net::TcpStream>,
}

impl StalledListener {
    pub fn bind() -> Self {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&addr.into()).unwrap();
        socket.listen(0).unwrap();
        let listener: std::net::TcpListener = socket.into();
        let addr = listener.local_addr().unwrap();

        let mut fillers = Vec::new();
        let full = loop {
            if fillers.len() >= 16 {
                break false;
            }
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => fillers.push(stream),
                Err(_) => break true,
            }
        };
        assert!(full, "accept queue never filled");

        Self {
            member: Member::from_socket_addr(addr),
            listener,
            fillers,
        }
    }

    /// Starts accepting and acknowledging every package.
    pub fn serve(self) -> Peer {
        drop(self.fillers);
        self.listener.set_nonblocking(true).unwrap();
        let listener = TcpListener::from_std(self.listener).unwrap();
        Peer::serve(listener, Behavior::DelayedAck(Duration::ZERO))
    }
}

/// A member whose port refuses connections.
pub fn refused_member() -> Member {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Member::from_socket_addr(addr)
}

/// Runs a blocking broadcast off the runtime and hands the dispatcher back.
pub async fn broadcast(
    mut dispatcher: Dispatcher,
    members: Vec<Member>,
    payload: Payload,
) -> (Dispatcher, Result<(), PartialFailure>, Duration) {
    tokio::task::spawn_blocking(move || {
        use meshcast::MessageSender;
        let start = Instant::now();
        let result = dispatcher.send_message(&members, &payload);
        (dispatcher, result, start.elapsed())
    })
    .await
    .unwrap()
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
