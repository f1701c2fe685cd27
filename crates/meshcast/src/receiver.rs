//! Receiving side of the wire protocol.
//!
//! [`AckReceiver`] accepts connections, decodes packages and hands each one to
//! a [`PackageHandler`]. When a package asks for an acknowledgement the handler's
//! verdict is answered with ACK or FAIL_ACK on the same connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{ack_package, AckKind, Package, PackageBuffer, DEFAULT_MAX_BODY};
use crate::error::Result;

const READ_BUF_SIZE: usize = 8192;

/// Consumes received packages.
pub trait PackageHandler: Send + Sync + 'static {
    /// Processes one package; `false` answers FAIL_ACK when an ack is requested.
    fn handle(&self, package: &Package, peer: SocketAddr) -> bool;
}

impl<F> PackageHandler for F
where
    F: Fn(&Package, SocketAddr) -> bool + Send + Sync + 'static,
{
    fn handle(&self, package: &Package, peer: SocketAddr) -> bool {
        self(package, peer)
    }
}

struct CountingHandler {
    inner: Arc<dyn PackageHandler>,
    received: Arc<AtomicU64>,
}

impl PackageHandler for CountingHandler {
    fn handle(&self, package: &Package, peer: SocketAddr) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.inner.handle(package, peer)
    }
}

/// TCP listener answering the broadcast protocol.
pub struct AckReceiver {
    local_addr: SocketAddr,
    received: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AckReceiver {
    /// Binds `addr` and starts accepting connections.
    pub async fn bind(addr: impl ToSocketAddrs, handler: Arc<dyn PackageHandler>) -> Result<Self> {
        Self::bind_with_limit(addr, handler, DEFAULT_MAX_BODY).await
    }

    /// Like [`bind`](Self::bind) with a custom maximum package body.
    pub async fn bind_with_limit(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn PackageHandler>,
        max_body: u32,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let received = Arc::new(AtomicU64::new(0));
        let handler: Arc<dyn PackageHandler> = Arc::new(CountingHandler {
            inner: handler,
            received: Arc::clone(&received),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, handler, shutdown_rx, max_body));
        info!(addr = %local_addr, "ack receiver listening");
        Ok(Self {
            local_addr,
            received,
            shutdown,
            task,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Packages handed to the handler so far.
    pub fn packages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Stops accepting and closes every open connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "ack receiver task failed");
        }
        info!(addr = %self.local_addr, "ack receiver stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn PackageHandler>,
    mut shutdown: watch::Receiver<bool>,
    max_body: u32,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    trace!(peer = %peer, error = %e, "set_nodelay failed");
                }
                debug!(peer = %peer, "accepted connection");
                let handler = Arc::clone(&handler);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        result = serve_connection(stream, peer, handler.as_ref(), max_body) => {
                            match result {
                                Ok(served) => debug!(peer = %peer, served, "connection closed"),
                                Err(e) => debug!(peer = %peer, error = %e, "connection failed"),
                            }
                        }
                    }
                });
            }
        }
    }
}

/// Serves one connection until the peer closes it.
///
/// Returns the number of packages handled. A framing error ends the
/// connection with that error.
pub async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    handler: &dyn PackageHandler,
    max_body: u32,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = PackageBuffer::new(max_body);
    let mut chunk = vec![0u8; READ_BUF_SIZE];
    let mut served = 0u64;
    loop {
        while let Some(package) = buf.extract_package()? {
            served += 1;
            let accepted = handler.handle(&package, peer);
            trace!(
                peer = %peer,
                len = package.body.len(),
                accepted,
                "package received"
            );
            if package.options.require_ack {
                let kind = if accepted {
                    AckKind::Ack
                } else {
                    AckKind::FailAck
                };
                stream.write_all(&ack_package(kind)).await?;
                stream.flush().await?;
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if !buf.is_empty() {
                debug!(peer = %peer, pending = buf.len(), "peer closed mid-package");
            }
            return Ok(served);
        }
        buf.append(&chunk[..n]);
    }
}
