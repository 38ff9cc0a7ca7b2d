//! limbad - privileged helper executing Limba transactions.
//!
//! Listens on a unix socket for requests from unprivileged clients and
//! runs them with this process's privileges, streaming progress events
//! back over the connection. Clients are authenticated by peer uid:
//! root, the daemon's own uid and explicitly allowed uids may submit
//! mutating requests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use limba_core::Reporter;
use limba_core::cache::PackageCache;
use limba_core::graph::PackageStage;
use limba_core::installer::{Installer, InstallerError};
use limba_core::ipc::{Event, Request};
use limba_core::manager::{Manager, ManagerError};
use limba_core::paths;

#[derive(Parser)]
#[command(name = "limbad")]
#[command(author, version, about = "Limba helper daemon")]
struct Cli {
    /// Socket path to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Additional uids allowed to submit requests (repeatable)
    #[arg(long = "allow-uid")]
    allow_uids: Vec<u32>,
}

/// Forwards reporter events into the per-connection event stream.
struct ChannelReporter {
    tx: mpsc::UnboundedSender<Event>,
}

impl Reporter for ChannelReporter {
    fn progress(&self, id: Option<&str>, percentage: u32) {
        let _ = self.tx.send(Event::Progress {
            id: id.map(str::to_string),
            percentage,
        });
    }

    fn stage_changed(&self, id: &str, stage: PackageStage) {
        let _ = self.tx.send(Event::Stage {
            id: id.to_string(),
            stage,
        });
    }

    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(paths::helper_socket);

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    // A stale socket from a previous run blocks the bind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("unable to bind {}", socket_path.display()))?;
    set_socket_mode(&socket_path, 0o666)?;
    tracing::info!("listening on {}", socket_path.display());

    let allowed = Arc::new(cli.allow_uids);
    loop {
        let (stream, _addr) = listener.accept().await?;
        let allowed = allowed.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &allowed).await {
                tracing::warn!("client connection failed: {err:#}");
            }
        });
    }
}

fn set_socket_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn peer_allowed(stream: &UnixStream, allowed: &[u32]) -> bool {
    let Ok(cred) = stream.peer_cred() else {
        return false;
    };
    let uid = cred.uid();
    uid == 0 || uid == unsafe { libc::geteuid() } || allowed.contains(&uid)
}

async fn handle_client(stream: UnixStream, allowed: &[u32]) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let authorized = peer_allowed(&stream, allowed);
    let (read_half, mut write_half) = stream.into_split();

    let mut lines = tokio::io::BufReader::new(read_half).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };
    let request: Request = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(err) => {
            send_event(
                &mut write_half,
                &Event::Error {
                    domain: "ipc".to_string(),
                    code: "protocol".to_string(),
                    message: format!("unreadable request: {err}"),
                },
            )
            .await?;
            send_event(&mut write_half, &Event::Finished { success: false }).await?;
            return Ok(());
        }
    };

    if !authorized {
        send_event(
            &mut write_half,
            &Event::Error {
                domain: "ipc".to_string(),
                code: "not-authorized".to_string(),
                message: "peer is not allowed to perform this action".to_string(),
            },
        )
        .await?;
        send_event(&mut write_half, &Event::Finished { success: false }).await?;
        return Ok(());
    }

    tracing::info!("handling request: {request:?}");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let worker = tokio::spawn(execute(request, ChannelReporter { tx }));

    // Relay events while the transaction runs.
    while let Some(event) = rx.recv().await {
        send_event(&mut write_half, &event).await?;
    }

    let outcome = worker.await;
    match outcome {
        Ok(Ok(())) => {
            send_event(&mut write_half, &Event::Finished { success: true }).await?;
        }
        Ok(Err((domain, code, message))) => {
            send_event(
                &mut write_half,
                &Event::Error {
                    domain,
                    code,
                    message,
                },
            )
            .await?;
            send_event(&mut write_half, &Event::Finished { success: false }).await?;
        }
        Err(join_err) => {
            send_event(
                &mut write_half,
                &Event::Error {
                    domain: "installer".to_string(),
                    code: "internal".to_string(),
                    message: format!("transaction task failed: {join_err}"),
                },
            )
            .await?;
            send_event(&mut write_half, &Event::Finished { success: false }).await?;
        }
    }
    Ok(())
}

async fn send_event(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    event: &Event,
) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    Ok(())
}

type WireError = (String, String, String);

async fn execute(request: Request, reporter: ChannelReporter) -> Result<(), WireError> {
    let reporter = Arc::new(reporter);
    match request {
        Request::InstallLocal { path } => {
            let mut installer = new_installer(reporter)?;
            installer
                .open_file(&path)
                .map_err(installer_wire_error)?;
            installer.install().await.map_err(installer_wire_error)
        }
        Request::InstallRemote { id } => {
            let mut installer = new_installer(reporter)?;
            installer
                .open_remote(&id)
                .await
                .map_err(installer_wire_error)?;
            installer.install().await.map_err(installer_wire_error)
        }
        Request::Remove { id } => {
            let mut manager = Manager::new();
            manager.remove_software(&id).map_err(manager_wire_error)
        }
        Request::Update => {
            let mut cache = PackageCache::new(reporter).map_err(|e| {
                (
                    "cache".to_string(),
                    "failed".to_string(),
                    e.to_string(),
                )
            })?;
            cache.update().await.map_err(|e| {
                ("cache".to_string(), "failed".to_string(), e.to_string())
            })
        }
    }
}

fn new_installer(reporter: Arc<ChannelReporter>) -> Result<Installer, WireError> {
    let mut installer = Installer::new(reporter).map_err(installer_wire_error)?;
    // This process is the privilege boundary; never re-forward.
    installer.set_use_helper(false);
    Ok(installer)
}

fn installer_wire_error(err: InstallerError) -> WireError {
    (
        "installer".to_string(),
        err.tag().to_string(),
        err.to_string(),
    )
}

fn manager_wire_error(err: ManagerError) -> WireError {
    let code = match &err {
        ManagerError::NotFound(_) => "not-found",
        ManagerError::RemoveFailed(_) => "remove-failed",
        ManagerError::Dependency { .. } => "dependency",
        ManagerError::Io(_) => "failed",
    };
    ("manager".to_string(), code.to_string(), err.to_string())
}
