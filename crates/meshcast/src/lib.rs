#![warn(missing_docs)]

//! meshcast: cluster message transport. Parallel non-blocking broadcast to a
//! set of members with per-member acknowledgement, retries and partial-failure
//! reporting.

pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod member;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod receiver;
pub mod sender;

pub use codec::{AckKind, Package, PackageBuffer};
pub use config::{PoolConfig, SenderConfig, SocketOptions};
pub use connection::{Connection, ConnectionState, Progress};
pub use dispatcher::Dispatcher;
pub use error::{MemberFailure, PartialFailure, Result, SendError};
pub use health::{MemberHealth, SenderState, SenderStates};
pub use member::Member;
pub use message::{Payload, SendOptions};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use pool::{PoolStats, PooledSender, SenderPool};
pub use receiver::{serve_connection, AckReceiver, PackageHandler};
pub use sender::{InterruptHandle, MessageSender};
