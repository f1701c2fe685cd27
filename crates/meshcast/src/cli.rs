//! `meshcast` command line: `send` and `listen`.

use crate::codec::Package;
use crate::config::SenderConfig;
use crate::error::SendError;
use crate::member::Member;
use crate::message::{Payload, SendOptions};
use crate::pool::SenderPool;
use crate::receiver::{AckReceiver, PackageHandler};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Command line interface of the `meshcast` binary.
#[derive(Parser)]
#[command(name = "meshcast")]
#[command(about = "Broadcast messages to cluster members", long_about = None)]
pub struct Cli {
    /// Sender configuration file (.toml or .json).
    #[arg(short, long, env = "MESHCAST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Broadcast a message to members and wait for their acknowledgements.
    Send {
        /// Destination as host:port or id@host:port; repeatable.
        #[arg(short = 'm', long = "member", required = true)]
        members: Vec<Member>,
        /// Message text.
        #[arg(long, conflicts_with = "file")]
        message: Option<String>,
        /// Send the contents of a file.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Do not ask for acknowledgements.
        #[arg(long)]
        no_ack: bool,
        /// Override the overall broadcast timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Accept broadcasts and acknowledge them.
    Listen {
        /// Address to bind.
        #[arg(short, long, default_value = "0.0.0.0:4000")]
        bind: String,
        /// Answer FAIL_ACK instead of ACK.
        #[arg(long)]
        reject: bool,
    },
}

impl Cli {
    /// Runs the selected subcommand.
    pub async fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => SenderConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SenderConfig::default(),
        };
        match self.command {
            Command::Send {
                members,
                message,
                file,
                no_ack,
                timeout_ms,
            } => {
                let data = match (message, file) {
                    (Some(text), _) => Bytes::from(text),
                    (None, Some(path)) => Bytes::from(
                        tokio::fs::read(&path)
                            .await
                            .with_context(|| format!("reading {}", path.display()))?,
                    ),
                    (None, None) => bail!("either --message or --file is required"),
                };
                let mut config = config;
                if let Some(timeout_ms) = timeout_ms {
                    config.timeout_ms = timeout_ms;
                }
                let options = if no_ack || !config.require_ack {
                    SendOptions::no_ack()
                } else {
                    SendOptions::ack()
                };
                send(config, members, Payload::new(data, options)).await
            }
            Command::Listen { bind, reject } => listen(&bind, reject).await,
        }
    }
}

async fn send(config: SenderConfig, members: Vec<Member>, payload: Payload) -> Result<()> {
    let pool = SenderPool::with_dispatchers(Arc::new(config)).context("creating sender pool")?;
    let total = members.len();
    let (result, snapshot) = tokio::task::spawn_blocking(move || {
        let result = pool.send_message(&members, &payload);
        (result, pool.metrics().snapshot())
    })
    .await
    .context("broadcast task failed")?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    match result {
        Ok(()) => {
            println!("delivered to {total} member(s)");
            Ok(())
        }
        Err(SendError::Broadcast(failure)) => {
            for f in failure.failures() {
                eprintln!("  {}: {}", f.member, f.cause);
            }
            bail!(
                "{} of {} member(s) failed",
                failure.failures().len(),
                failure.attempted()
            )
        }
        Err(e) => Err(e.into()),
    }
}

async fn listen(bind: &str, reject: bool) -> Result<()> {
    let handler: Arc<dyn PackageHandler> = Arc::new(move |package: &Package, peer: SocketAddr| {
        info!(peer = %peer, len = package.body.len(), "package received");
        !reject
    });
    let receiver = AckReceiver::bind(bind, handler)
        .await
        .with_context(|| format!("binding {bind}"))?;
    println!("listening on {}", receiver.local_addr());

    tokio::signal::ctrl_c().await?;
    println!("received {} package(s)", receiver.packages_received());
    receiver.shutdown().await;
    Ok(())
}
