//! Wire protocol and client for the privileged helper daemon.
//!
//! Unprivileged processes forward mutating operations to `limbad` over a
//! unix socket. The protocol is newline-delimited JSON: one request, then
//! a stream of events ending in `finished` (or a dropped connection, which
//! the client reports as an internal failure — the daemon most likely
//! crashed mid-transaction).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::graph::PackageStage;
use crate::reporter::Reporter;

/// Errors raised on the client side of the helper protocol.
#[derive(Error, Debug)]
pub enum IpcError {
    /// The socket could not be reached.
    #[error("unable to reach the helper daemon: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon disappeared before finishing the transaction.
    #[error("the helper daemon vanished mid-transaction, so it likely crashed")]
    ConnectionLost,

    /// The daemon reported a failure.
    #[error("{message}")]
    Remote {
        /// Error domain (component name).
        domain: String,
        /// Error tag within the domain.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

/// A request to the helper daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Request {
    /// Install a local bundle file.
    InstallLocal {
        /// Path of the bundle, resolvable by the daemon.
        path: PathBuf,
    },
    /// Install a package from the configured repositories.
    InstallRemote {
        /// Package id to install.
        id: String,
    },
    /// Remove an installed package.
    Remove {
        /// Package id to remove.
        id: String,
    },
    /// Refresh the repository cache.
    Update,
}

/// An event streamed back by the helper daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// Operation progress.
    Progress {
        /// Package the progress belongs to, if any.
        id: Option<String>,
        /// 0..=100.
        percentage: u32,
    },
    /// A package changed its lifecycle stage.
    Stage {
        /// Package id.
        id: String,
        /// New stage.
        stage: PackageStage,
    },
    /// The transaction hit an error (a `finished` event follows).
    Error {
        /// Error domain (component name).
        domain: String,
        /// Error tag within the domain.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// The transaction ended.
    Finished {
        /// Whether it succeeded.
        success: bool,
    },
}

/// Send one request and relay its event stream into `reporter`.
pub async fn request(
    socket: &Path,
    request: &Request,
    reporter: &dyn Reporter,
) -> Result<(), IpcError> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(request).map_err(|e| IpcError::Protocol(e.to_string()))?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let mut last_error: Option<IpcError> = None;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event =
            serde_json::from_str(&line).map_err(|e| IpcError::Protocol(e.to_string()))?;
        match event {
            Event::Progress { id, percentage } => {
                reporter.progress(id.as_deref(), percentage);
            }
            Event::Stage { id, stage } => {
                reporter.stage_changed(&id, stage);
            }
            Event::Error {
                domain,
                code,
                message,
            } => {
                last_error = Some(IpcError::Remote {
                    domain,
                    code,
                    message,
                });
            }
            Event::Finished { success } => {
                return if success {
                    Ok(())
                } else {
                    Err(last_error.unwrap_or(IpcError::Remote {
                        domain: "installer".to_string(),
                        code: "failed".to_string(),
                        message: "transaction failed".to_string(),
                    }))
                };
            }
        }
    }

    // The stream ended without a finished event.
    Err(last_error.unwrap_or(IpcError::ConnectionLost))
}
