//! Broadcast destinations.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SendError};

/// Identity of a destination member: unique id plus host and port.
///
/// Two members are equal only when id, host and port all match, so a
/// restarted node that reuses its address under a new id gets a fresh
/// connection and health entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    id: Uuid,
    host: String,
    port: u16,
}

impl Member {
    /// Creates a member with a freshly generated id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_id(Uuid::new_v4(), host, port)
    }

    /// Creates a member with a caller supplied id.
    pub fn with_id(id: Uuid, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// Creates a member for a resolved socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// Unique member id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Host name or IP literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form used in logs and errors.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolves the member to a socket address (first match wins).
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| SendError::connect(self, e))?
            .next()
            .ok_or_else(|| {
                SendError::connect(
                    self,
                    std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "address resolved to nothing",
                    ),
                )
            })
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

/// Parses `host:port`, `[v6]:port` or `uuid@host:port`.
impl FromStr for Member {
    type Err = SendError;

    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = match s.split_once('@') {
            Some((id, addr)) => {
                let id = Uuid::parse_str(id.trim())
                    .map_err(|e| SendError::Config(format!("invalid member id {id:?}: {e}")))?;
                (Some(id), addr)
            }
            None => (None, s),
        };

        let (host, port) = addr
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| SendError::Config(format!("member {s:?} is missing a port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(SendError::Config(format!("member {s:?} is missing a host")));
        }
        let port: u16 = port
            .parse()
            .map_err(|e| SendError::Config(format!("invalid port in {s:?}: {e}")))?;

        Ok(match id {
            Some(id) => Member::with_id(id, host, port),
            None => Member::new(host, port),
        })
    }
}
