use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::HostError;

/// Configuration for spawning a host process
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            program: "rdp-host".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

/// Snapshot of a host process
#[derive(Clone, Debug)]
pub struct HostState {
    pub running: bool,
    pub pid: Option<u32>,
    pub program: String,
    pub args: Vec<String>,
    /// Unix millis
    pub started_at: i64,
    pub exit: Option<HostExit>,
}

/// How a host process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostExit {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl HostExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// How to ask a host process to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM on unix, a hard kill elsewhere
    Terminate,
    Kill,
}

pub(crate) enum HostMessage {
    GetState {
        respond_to: oneshot::Sender<HostState>,
    },
    Stop {
        signal: StopSignal,
        respond_to: oneshot::Sender<Result<(), HostError>>,
    },
}

/// Handle to communicate with a host process actor
#[derive(Clone)]
pub struct HostHandle {
    sender: mpsc::Sender<HostMessage>,
    exit_rx: watch::Receiver<Option<HostExit>>,
    pid: Option<u32>,
}

impl HostHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Get the current state of the host process
    pub async fn state(&self) -> Result<HostState, HostError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HostMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| HostError::ActorGone)?;
        rx.await.map_err(|_| HostError::ActorGone)
    }

    /// Ask the process to stop. Returns once the signal is delivered, not
    /// once the process is gone; use [`HostHandle::wait_exit`] for that.
    pub async fn stop(&self, signal: StopSignal) -> Result<(), HostError> {
        if self.has_exited() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(HostMessage::Stop {
                signal,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            // Actor already reaped the child.
            return Ok(());
        }
        rx.await.map_err(|_| HostError::ActorGone)?
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the process exits.
    pub async fn wait_exit(&self) -> HostExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Actor dropped without recording an exit; treat as unknown.
                let recorded = *rx.borrow();
                return recorded.unwrap_or(HostExit {
                    code: None,
                    signal: None,
                });
            }
        }
    }
}

/// The actor that owns a single host process
pub struct HostProcessActor {
    child: Child,
    state: HostState,
    receiver: mpsc::Receiver<HostMessage>,
    exit_tx: watch::Sender<Option<HostExit>>,
}

impl HostProcessActor {
    /// Spawn the process and return a handle to it
    pub fn spawn(config: HostConfig) -> Result<HostHandle, HostError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning host process: {} with args: {:?}",
            config.program, config.args
        );

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to spawn host '{}': {}", config.program, source);
            HostError::SpawnFailed {
                program: config.program.clone(),
                source,
            }
        })?;

        let pid = child.id();
        info!("Host process started with PID: {:?}", pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, pid, "stderr"));
        }

        let state = HostState {
            running: true,
            pid,
            program: config.program,
            args: config.args,
            started_at: chrono::Utc::now().timestamp_millis(),
            exit: None,
        };

        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut actor = Self {
            child,
            state,
            receiver: msg_rx,
            exit_tx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(HostHandle {
            sender: msg_tx,
            exit_rx,
            pid,
        })
    }

    async fn run(&mut self) {
        info!(
            "Host actor started for {} with PID: {:?}",
            self.state.program, self.state.pid
        );

        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let exit = match status {
                        Ok(status) => HostExit::from_status(status),
                        Err(e) => {
                            warn!("Failed to wait on host process: {}", e);
                            HostExit { code: None, signal: None }
                        }
                    };
                    info!("Host process {:?} exited: {:?}", self.state.pid, exit);
                    self.state.running = false;
                    self.state.exit = Some(exit);
                    let _ = self.exit_tx.send(Some(exit));
                    break;
                }
                msg = self.receiver.recv() => match msg {
                    Some(HostMessage::GetState { respond_to }) => {
                        let _ = respond_to.send(self.state.clone());
                    }
                    Some(HostMessage::Stop { signal, respond_to }) => {
                        let _ = respond_to.send(self.handle_stop(signal));
                    }
                    None => {
                        debug!("All host handles dropped, killing {:?}", self.state.pid);
                        let _ = self.child.start_kill();
                        let exit = match self.child.wait().await {
                            Ok(status) => HostExit::from_status(status),
                            Err(_) => HostExit { code: None, signal: None },
                        };
                        let _ = self.exit_tx.send(Some(exit));
                        break;
                    }
                },
            }
        }

        // Answer anything still queued so callers do not hang.
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                HostMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state.clone());
                }
                HostMessage::Stop { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
            }
        }

        info!("Host actor shutting down");
    }

    fn handle_stop(&mut self, signal: StopSignal) -> Result<(), HostError> {
        match signal {
            StopSignal::Terminate => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.state.pid {
                        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                            .map_err(|e| HostError::StopFailed(e.to_string()))?;
                    }
                }
                #[cfg(not(unix))]
                {
                    self.child
                        .start_kill()
                        .map_err(|e| HostError::StopFailed(e.to_string()))?;
                }
            }
            StopSignal::Kill => {
                self.child
                    .start_kill()
                    .map_err(|e| HostError::StopFailed(e.to_string()))?;
            }
        }
        Ok(())
    }
}

async fn forward_lines<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(host_pid = ?pid, stream = name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(host_pid = ?pid, "Error reading host {}: {}", name, e);
                break;
            }
        }
    }
}
