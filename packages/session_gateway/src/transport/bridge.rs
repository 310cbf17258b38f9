//! Starting a display host and wiring up its framed channel.
//!
//! The session actor only sees [`HostLauncher`] and [`HostControl`]; how the
//! host is started and how its pipes are created stays behind them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use host_process::{HostConfig, HostHandle, HostManager, StopSignal};

use crate::session::{HostType, SessionId};
use crate::transport::framing::HostChannel;

/// Lifecycle operations on a running host.
pub trait HostControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the host to stop. Resolves once the request is delivered.
    fn stop(&self) -> BoxFuture<'static, ()>;

    /// Resolves with the exit code once the host is gone.
    fn exited(&self) -> BoxFuture<'static, Option<i32>>;
}

impl HostControl for HostHandle {
    fn pid(&self) -> Option<u32> {
        HostHandle::pid(self)
    }

    fn stop(&self) -> BoxFuture<'static, ()> {
        let handle = self.clone();
        Box::pin(async move {
            if let Err(e) = handle.stop(StopSignal::Terminate).await {
                warn!(pid = ?handle.pid(), "failed to stop display host: {}", e);
            }
        })
    }

    fn exited(&self) -> BoxFuture<'static, Option<i32>> {
        let handle = self.clone();
        Box::pin(async move { handle.wait_exit().await.code })
    }
}

/// A started host and its channel.
pub struct HostLink {
    pub channel: HostChannel,
    pub control: Arc<dyn HostControl>,
}

#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub session_id: SessionId,
    pub host_type: HostType,
    /// Increases with every host started for the same session.
    pub generation: u64,
}

pub trait HostLauncher: Send + Sync + 'static {
    fn launch(&self, request: LaunchRequest) -> BoxFuture<'static, Result<HostLink>>;
}

/// Starts host programs as child processes connected over unix sockets.
///
/// For each launch the gateway binds `remotesession_<id>_inputs.sock` and
/// `remotesession_<id>_updates.sock` in the runtime directory, passes both
/// paths to the host, and waits for it to connect to each. Leftover sockets
/// from a previous host of the same session are removed first.
#[cfg(unix)]
pub struct ProcessLauncher {
    hosts: Arc<HostManager>,
    rdp_program: String,
    ssh_program: String,
    runtime_dir: PathBuf,
    connect_timeout: Duration,
}

#[cfg(unix)]
impl ProcessLauncher {
    pub fn new(
        hosts: Arc<HostManager>,
        rdp_program: String,
        ssh_program: String,
        runtime_dir: PathBuf,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            hosts,
            rdp_program,
            ssh_program,
            runtime_dir,
            connect_timeout,
        }
    }

    fn program(&self, host_type: HostType) -> &str {
        match host_type {
            HostType::Rdp => &self.rdp_program,
            HostType::Ssh => &self.ssh_program,
        }
    }
}

pub fn socket_paths(runtime_dir: &Path, session_id: SessionId) -> (PathBuf, PathBuf) {
    (
        runtime_dir.join(format!("remotesession_{session_id}_inputs.sock")),
        runtime_dir.join(format!("remotesession_{session_id}_updates.sock")),
    )
}

async fn remove_socket(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(unix)]
impl HostLauncher for ProcessLauncher {
    fn launch(&self, request: LaunchRequest) -> BoxFuture<'static, Result<HostLink>> {
        use tokio::net::UnixListener;

        let hosts = self.hosts.clone();
        let program = self.program(request.host_type).to_string();
        let runtime_dir = self.runtime_dir.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            tokio::fs::create_dir_all(&runtime_dir)
                .await
                .with_context(|| format!("failed to create {}", runtime_dir.display()))?;

            let (inputs_path, updates_path) = socket_paths(&runtime_dir, request.session_id);
            remove_socket(&inputs_path).await?;
            remove_socket(&updates_path).await?;

            let inputs_listener = UnixListener::bind(&inputs_path)
                .with_context(|| format!("failed to bind {}", inputs_path.display()))?;
            let updates_listener = UnixListener::bind(&updates_path)
                .with_context(|| format!("failed to bind {}", updates_path.display()))?;

            let config = HostConfig {
                program: program.clone(),
                args: vec![
                    "--session".to_string(),
                    request.session_id.to_string(),
                    "--inputs".to_string(),
                    inputs_path.display().to_string(),
                    "--updates".to_string(),
                    updates_path.display().to_string(),
                ],
                ..Default::default()
            };
            let (id, handle) = hosts
                .spawn_handle(config)
                .await
                .with_context(|| format!("failed to start display host '{program}'"))?;
            info!(
                session = %request.session_id,
                generation = request.generation,
                host = %id,
                pid = ?handle.pid(),
                "display host started"
            );

            let accept = async {
                let (inputs, _) = inputs_listener.accept().await?;
                let (updates, _) = updates_listener.accept().await?;
                Ok::<_, std::io::Error>((inputs, updates))
            };
            let connected = tokio::select! {
                result = tokio::time::timeout(connect_timeout, accept) => match result {
                    Ok(Ok(streams)) => Ok(streams),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("display host pipe accept failed")),
                    Err(_) => Err(anyhow::anyhow!(
                        "display host did not connect within {:?}",
                        connect_timeout
                    )),
                },
                exit = handle.wait_exit() => Err(anyhow::anyhow!(
                    "display host exited before connecting (code {:?})",
                    exit.code
                )),
            };

            let _ = remove_socket(&inputs_path).await;
            let _ = remove_socket(&updates_path).await;

            let (inputs, updates) = match connected {
                Ok(streams) => streams,
                Err(e) => {
                    if let Err(stop_err) = handle.stop(StopSignal::Kill).await {
                        warn!(host = %id, "failed to kill unconnected host: {}", stop_err);
                    }
                    return Err(e);
                }
            };
            if handle.has_exited() {
                bail!("display host exited right after connecting");
            }

            Ok(HostLink {
                channel: HostChannel::over_streams(inputs, updates),
                control: Arc::new(handle),
            })
        })
    }
}
