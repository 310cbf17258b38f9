use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::AppState;
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::registry::SessionRegistry;
use crate::transport::framing::{self, HostChannel, HostText};
use crate::transport::{HostControl, HostLauncher, HostLink, LaunchRequest};
use crate::update_cache::{PendingUpdate, UpdateFormat};

/// Build an `AppState` whose sessions talk to in-memory fake hosts.
///
/// The returned launcher hands out a [`FakeHost`] for every host a session
/// starts.
pub fn test_app_state() -> (AppState, FakeLauncher) {
    test_app_state_with(GatewayConfig::default())
}

pub fn test_app_state_with(config: GatewayConfig) -> (AppState, FakeLauncher) {
    let launcher = FakeLauncher::new();
    let metrics = Arc::new(GatewayMetrics::new());
    let registry = Arc::new(SessionRegistry::new(
        config.session_policy(),
        Arc::new(launcher.clone()),
        metrics.clone(),
    ));
    let state = AppState {
        registry,
        config: Arc::new(config),
        metrics,
    };
    (state, launcher)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FakeMode {
    Streams,
    Messages,
    Failing,
}

/// Launcher that wires sessions to in-memory hosts driven by the test.
#[derive(Clone)]
pub struct FakeLauncher {
    mode: FakeMode,
    hosts_tx: mpsc::UnboundedSender<FakeHost>,
    hosts_rx: Arc<Mutex<mpsc::UnboundedReceiver<FakeHost>>>,
}

impl FakeLauncher {
    /// Length-prefixed framing over duplex pipes.
    pub fn new() -> Self {
        Self::with_mode(FakeMode::Streams)
    }

    /// Bare message bodies over channels.
    pub fn message_mode() -> Self {
        Self::with_mode(FakeMode::Messages)
    }

    /// Every launch fails.
    pub fn failing() -> Self {
        Self::with_mode(FakeMode::Failing)
    }

    fn with_mode(mode: FakeMode) -> Self {
        let (hosts_tx, hosts_rx) = mpsc::unbounded_channel();
        Self {
            mode,
            hosts_tx,
            hosts_rx: Arc::new(Mutex::new(hosts_rx)),
        }
    }

    /// The next host started by any session.
    pub async fn next_host(&self) -> FakeHost {
        self.hosts_rx
            .lock()
            .await
            .recv()
            .await
            .expect("launcher dropped")
    }
}

impl HostLauncher for FakeLauncher {
    fn launch(&self, request: LaunchRequest) -> BoxFuture<'static, anyhow::Result<HostLink>> {
        let mode = self.mode;
        let hosts = self.hosts_tx.clone();
        Box::pin(async move {
            let (side, channel) = match mode {
                FakeMode::Failing => anyhow::bail!("display host binary not found"),
                FakeMode::Streams => {
                    let (gateway_inputs, host_inputs) = tokio::io::duplex(64 * 1024);
                    let (host_updates, gateway_updates) = tokio::io::duplex(64 * 1024);
                    (
                        HostSide::Streams {
                            inputs: FramedRead::new(host_inputs, framing::codec()),
                            updates: FramedWrite::new(host_updates, framing::codec()),
                        },
                        HostChannel::over_streams(gateway_inputs, gateway_updates),
                    )
                }
                FakeMode::Messages => {
                    let (inputs_tx, inputs_rx) = fmpsc::unbounded::<Bytes>();
                    let (updates_tx, updates_rx) = fmpsc::unbounded::<io::Result<Bytes>>();
                    (
                        HostSide::Messages {
                            inputs: inputs_rx,
                            updates: updates_tx,
                        },
                        HostChannel::over_messages(
                            inputs_tx.sink_map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e)),
                            updates_rx,
                        ),
                    )
                }
            };

            let exit = Arc::new(watch::channel(None).0);
            let host = FakeHost {
                request,
                side,
                exit: exit.clone(),
                next_idx: 0,
            };
            hosts
                .send(host)
                .map_err(|_| anyhow::anyhow!("test dropped the launcher"))?;
            Ok(HostLink {
                channel,
                control: Arc::new(FakeControl { exit }),
            })
        })
    }
}

type ExitCell = Arc<watch::Sender<Option<Option<i32>>>>;

struct FakeControl {
    exit: ExitCell,
}

impl HostControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn stop(&self) -> BoxFuture<'static, ()> {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(None);
                true
            } else {
                false
            }
        });
        Box::pin(async {})
    }

    fn exited(&self) -> BoxFuture<'static, Option<i32>> {
        let mut rx = self.exit.subscribe();
        Box::pin(async move {
            match rx.wait_for(Option::is_some).await {
                Ok(exit) => (*exit).flatten(),
                Err(_) => None,
            }
        })
    }
}

enum HostSide {
    Streams {
        inputs: FramedRead<DuplexStream, LengthDelimitedCodec>,
        updates: FramedWrite<DuplexStream, LengthDelimitedCodec>,
    },
    Messages {
        inputs: fmpsc::UnboundedReceiver<Bytes>,
        updates: fmpsc::UnboundedSender<io::Result<Bytes>>,
    },
}

/// The host end of one launch.
pub struct FakeHost {
    pub request: LaunchRequest,
    side: HostSide,
    exit: ExitCell,
    next_idx: i32,
}

impl FakeHost {
    /// Next command the gateway wrote, or None once it hung up.
    pub async fn next_command(&mut self) -> Option<String> {
        let body = match &mut self.side {
            HostSide::Streams { inputs, .. } => inputs.next().await?.ok()?.freeze(),
            HostSide::Messages { inputs, .. } => inputs.next().await?,
        };
        String::from_utf8(body.to_vec()).ok()
    }

    /// Read commands up to and including `CON`.
    pub async fn expect_handshake(&mut self) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let command = self.next_command().await.expect("gateway hung up");
            let done = command == "CON";
            seen.push(command);
            if done {
                return seen;
            }
        }
    }

    async fn send_body(&mut self, body: Bytes) {
        match &mut self.side {
            HostSide::Streams { updates, .. } => updates.send(body).await.expect("send frame"),
            HostSide::Messages { updates, .. } => {
                updates.unbounded_send(Ok(body)).expect("send frame")
            }
        }
    }

    pub async fn send_image(&mut self, fullscreen: bool) {
        self.next_idx += 1;
        let update = PendingUpdate {
            pos_x: 0,
            pos_y: 0,
            width: 64,
            height: 48,
            format: UpdateFormat::Png,
            quality: 50,
            fullscreen,
            data: Bytes::from_static(b"\x89PNG fake"),
        };
        let body = framing::encode_image(self.next_idx, &update);
        self.send_body(body).await;
    }

    pub async fn send_text(&mut self, text: HostText) {
        self.send_body(framing::encode_text(&text)).await;
    }

    /// Corrupt the updates stream so the gateway sees an I/O error.
    pub async fn break_updates(&mut self) {
        match &mut self.side {
            HostSide::Streams { updates, .. } => {
                let pipe = updates.get_mut();
                pipe.write_all(&[0xff; 4]).await.expect("write");
                pipe.flush().await.expect("flush");
            }
            HostSide::Messages { updates, .. } => {
                updates
                    .unbounded_send(Err(io::Error::other("pipe broken")))
                    .expect("send error");
            }
        }
    }

    /// Exit with a code, closing both pipes.
    pub fn exit(self, code: Option<i32>) {
        self.exit.send_replace(Some(code));
    }
}
