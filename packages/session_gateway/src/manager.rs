//! The session actor.
//!
//! One actor task per session owns the [`Session`], the host bridge, the
//! fan-out registry and every timer. Client requests arrive as
//! [`SessionCommand`]s through a [`SessionHandle`]; everything coming from the
//! host side (frames, exit, bridge errors, timer fires) arrives as internal
//! events on a second channel. Nothing else mutates session state.
//!
//! The update cache is the one structure shared outside the actor, so pull
//! transports can wait on it without a round trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{self, Command};
use crate::error::GatewayError;
use crate::fanout::{FanOut, PushKind, PushSubscription, TransportId};
use crate::metrics::GatewayMetrics;
use crate::session::{
    ClientProgress, ConnectionTarget, DisplaySettings, ExitOutcome, FeatureFlags, Session,
    SessionId, SessionInfo, SessionState,
};
use crate::sharing::{ClientId, GuestAccess, GuestId, GuestInfo, JoinRejection, Role};
use crate::timer::TimerSlot;
use crate::transport::framing::{self, HostChannel, HostFrame, HostText};
use crate::transport::{HostControl, HostLauncher, HostLink, LaunchRequest, Notice};
use crate::update_cache::{PendingUpdate, Update, UpdateCache, UpdateFormat, UpdateKind};

/// Commands queued for the host writer before new ones are refused.
const HOST_INPUT_QUEUE: usize = 1024;

/// Settings a session copies from configuration when it is created.
#[derive(Clone, Debug)]
pub struct SessionPolicy {
    pub idle_timeout: Option<Duration>,
    pub guest_idle_timeout: Option<Duration>,
    pub resize_settle: Duration,
    pub max_active_guests: usize,
    pub reconnect_on_resize: bool,
    pub features: FeatureFlags,
    pub default_display: DisplaySettings,
    pub image_ttl: Duration,
    pub audio_ttl: Duration,
    pub push_capacity: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            guest_idle_timeout: None,
            resize_settle: Duration::from_millis(500),
            max_active_guests: 3,
            reconnect_on_resize: true,
            features: FeatureFlags::default(),
            default_display: DisplaySettings::default(),
            image_ttl: Duration::from_millis(1000),
            audio_ttl: Duration::from_millis(2000),
            push_capacity: 100,
        }
    }
}

/// What a new session is asked to connect to.
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub owner: ClientId,
    pub target: ConnectionTarget,
    pub display: DisplaySettings,
}

/// Result of one input batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputOutcome {
    pub forwarded: usize,
    pub dropped: usize,
}

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

pub(crate) enum SessionCommand {
    Input {
        client: ClientId,
        payload: String,
        respond_to: Reply<InputOutcome>,
    },
    Attach {
        client: ClientId,
        kind: PushKind,
        respond_to: Reply<PushSubscription>,
    },
    Detach {
        transport: TransportId,
    },
    Progress {
        client: ClientId,
        last_idx: Option<u64>,
        latency_ms: Option<u64>,
    },
    OpenQueue {
        client: ClientId,
        respond_to: Reply<Role>,
    },
    NextNotice {
        client: ClientId,
        respond_to: oneshot::Sender<Option<Notice>>,
    },
    Authorize {
        client: ClientId,
        respond_to: Reply<Role>,
    },
    Invite {
        client: ClientId,
        control: bool,
        respond_to: Reply<GuestInfo>,
    },
    ListGuests {
        client: ClientId,
        respond_to: Reply<Vec<GuestInfo>>,
    },
    UpdateGuest {
        client: ClientId,
        guest: GuestId,
        control: bool,
        respond_to: Reply<GuestInfo>,
    },
    RevokeGuest {
        client: ClientId,
        guest: GuestId,
        respond_to: Reply<GuestInfo>,
    },
    Join {
        client: ClientId,
        guest: GuestId,
        respond_to: Reply<GuestInfo>,
    },
    Close {
        client: ClientId,
        respond_to: Reply<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Host-side happenings, tagged with the bridge generation they belong to.
enum ManagerEvent {
    Launched {
        generation: u64,
        result: anyhow::Result<HostLink>,
    },
    Frame {
        generation: u64,
        frame: HostFrame,
    },
    BridgeFailed {
        generation: u64,
        error: String,
    },
    HostExited {
        generation: u64,
        exit_code: Option<i32>,
    },
    ResizeSettled {
        timer: u64,
    },
    OwnerIdle {
        timer: u64,
    },
    GuestIdle {
        client: ClientId,
        timer: u64,
    },
}

/// Handle to communicate with a session actor
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<SessionCommand>,
    cache: Arc<UpdateCache>,
    info: watch::Receiver<SessionInfo>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn info(&self) -> SessionInfo {
        let mut info = self.info.borrow().clone();
        info.last_idx = self.cache.watermark();
        info
    }

    pub fn state(&self) -> SessionState {
        self.info.borrow().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    /// Resolve once the session has ended for good.
    pub async fn wait_terminated(&self) -> SessionInfo {
        let mut rx = self.info.clone();
        loop {
            if rx.borrow_and_update().state == SessionState::Disconnected {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.info()
    }

    pub async fn wait_next(&self, last_known: u64, max_wait: Duration) -> Option<Arc<Update>> {
        self.cache.wait_next(last_known, max_wait).await
    }

    pub async fn get_update(&self, idx: u64) -> Option<Arc<Update>> {
        self.cache.get(idx).await
    }

    pub async fn last_update(&self) -> Option<Arc<Update>> {
        self.cache.last_update().await
    }

    pub fn cache(&self) -> &Arc<UpdateCache> {
        &self.cache
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| GatewayError::SessionGone)?;
        rx.await.map_err(|_| GatewayError::SessionGone)
    }

    /// Decode and forward a batch of client commands.
    pub async fn send_input(
        &self,
        client: &ClientId,
        payload: &str,
    ) -> Result<InputOutcome, GatewayError> {
        self.request(|respond_to| SessionCommand::Input {
            client: client.clone(),
            payload: payload.to_string(),
            respond_to,
        })
        .await?
    }

    /// Register a push transport for a participant.
    pub async fn attach(
        &self,
        client: &ClientId,
        kind: PushKind,
    ) -> Result<PushSubscription, GatewayError> {
        self.request(|respond_to| SessionCommand::Attach {
            client: client.clone(),
            kind,
            respond_to,
        })
        .await?
    }

    pub async fn detach(&self, transport: TransportId) {
        let _ = self
            .sender
            .send(SessionCommand::Detach { transport })
            .await;
    }

    pub async fn record_progress(
        &self,
        client: &ClientId,
        last_idx: Option<u64>,
        latency_ms: Option<u64>,
    ) {
        let _ = self
            .sender
            .send(SessionCommand::Progress {
                client: client.clone(),
                last_idx,
                latency_ms,
            })
            .await;
    }

    /// Authorize a pull client and start parking notices for it.
    pub async fn open_queue(&self, client: &ClientId) -> Result<Role, GatewayError> {
        self.request(|respond_to| SessionCommand::OpenQueue {
            client: client.clone(),
            respond_to,
        })
        .await?
    }

    pub async fn next_notice(&self, client: &ClientId) -> Result<Option<Notice>, GatewayError> {
        self.request(|respond_to| SessionCommand::NextNotice {
            client: client.clone(),
            respond_to,
        })
        .await
    }

    pub async fn authorize(&self, client: &ClientId) -> Result<Role, GatewayError> {
        self.request(|respond_to| SessionCommand::Authorize {
            client: client.clone(),
            respond_to,
        })
        .await?
    }

    pub async fn invite(&self, client: &ClientId, control: bool) -> Result<GuestInfo, GatewayError> {
        self.request(|respond_to| SessionCommand::Invite {
            client: client.clone(),
            control,
            respond_to,
        })
        .await?
    }

    pub async fn list_guests(&self, client: &ClientId) -> Result<Vec<GuestInfo>, GatewayError> {
        self.request(|respond_to| SessionCommand::ListGuests {
            client: client.clone(),
            respond_to,
        })
        .await?
    }

    pub async fn update_guest(
        &self,
        client: &ClientId,
        guest: GuestId,
        control: bool,
    ) -> Result<GuestInfo, GatewayError> {
        self.request(|respond_to| SessionCommand::UpdateGuest {
            client: client.clone(),
            guest,
            control,
            respond_to,
        })
        .await?
    }

    pub async fn revoke_guest(
        &self,
        client: &ClientId,
        guest: GuestId,
    ) -> Result<GuestInfo, GatewayError> {
        self.request(|respond_to| SessionCommand::RevokeGuest {
            client: client.clone(),
            guest,
            respond_to,
        })
        .await?
    }

    pub async fn join(&self, client: &ClientId, guest: GuestId) -> Result<GuestInfo, GatewayError> {
        self.request(|respond_to| SessionCommand::Join {
            client: client.clone(),
            guest,
            respond_to,
        })
        .await?
    }

    /// Owner-initiated close.
    pub async fn close(&self, client: &ClientId) -> Result<(), GatewayError> {
        self.request(|respond_to| SessionCommand::Close {
            client: client.clone(),
            respond_to,
        })
        .await?
    }

    /// Close and stop the host regardless of who asks.
    pub async fn shutdown(&self) {
        let _ = self
            .request(|respond_to| SessionCommand::Shutdown { respond_to })
            .await;
    }
}

/// Create a session, start its first host and return its handle.
pub fn spawn_session(
    request: NewSession,
    policy: SessionPolicy,
    launcher: Arc<dyn HostLauncher>,
    metrics: Arc<GatewayMetrics>,
) -> SessionHandle {
    let id = SessionId::new();
    let mut display = request.display.with_defaults(&policy.default_display);
    display.reconnect_on_resize |= policy.reconnect_on_resize;

    let mut session = Session::new(
        id,
        request.owner,
        request.target,
        display,
        policy.features,
        policy.max_active_guests,
    );
    if let Err(e) = session.begin_connecting() {
        warn!(session = %id, "unexpected initial state: {}", e);
    }

    let cache = Arc::new(UpdateCache::new(policy.image_ttl, policy.audio_ttl));
    let (info_tx, info_rx) = watch::channel(session.info(0));
    let (sender, receiver) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(256);
    metrics.session_created();

    let mut actor = SessionActor {
        session,
        policy,
        cache: cache.clone(),
        fanout: FanOut::new(),
        launcher,
        metrics,
        info_tx,
        receiver,
        events_tx,
        events_rx,
        bridge: None,
        generation: 0,
        resize_timer: TimerSlot::new(),
        owner_idle: TimerSlot::new(),
        guest_idle: HashMap::new(),
        pending_resize: None,
        fullscreen_pending: false,
        progress: HashMap::new(),
    };
    actor.launch();
    actor.arm_owner_idle();
    actor.publish_info();
    tokio::spawn(actor.run());

    SessionHandle {
        id,
        sender,
        cache,
        info: info_rx,
    }
}

/// A connected host: writer queue, lifecycle control and its tasks.
struct ActiveBridge {
    inputs: mpsc::Sender<String>,
    control: Arc<dyn HostControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ActiveBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn arm<F>(slot: &mut TimerSlot, delay: Duration, events: &mpsc::Sender<ManagerEvent>, make: F)
where
    F: FnOnce(u64) -> ManagerEvent + Send + 'static,
{
    let events = events.clone();
    slot.reset(delay, move |timer| async move {
        let _ = events.send(make(timer)).await;
    });
}

struct SessionActor {
    session: Session,
    policy: SessionPolicy,
    cache: Arc<UpdateCache>,
    fanout: FanOut,
    launcher: Arc<dyn HostLauncher>,
    metrics: Arc<GatewayMetrics>,
    info_tx: watch::Sender<SessionInfo>,
    receiver: mpsc::Receiver<SessionCommand>,
    events_tx: mpsc::Sender<ManagerEvent>,
    events_rx: mpsc::Receiver<ManagerEvent>,
    bridge: Option<ActiveBridge>,
    /// Bumped for every host started; events from older hosts are ignored.
    generation: u64,
    resize_timer: TimerSlot,
    owner_idle: TimerSlot,
    guest_idle: HashMap<ClientId, TimerSlot>,
    pending_resize: Option<(u32, u32)>,
    /// Region frames are discarded until the requested fullscreen arrives.
    fullscreen_pending: bool,
    progress: HashMap<ClientId, ClientProgress>,
}

impl SessionActor {
    async fn run(mut self) {
        let id = self.session.id;
        info!(session = %id, host = %self.session.target.host_address, "session started");

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        if let Some(bridge) = self.bridge.take() {
            bridge.control.stop().await;
        }
        debug!(session = %id, "session actor stopped");
    }

    fn publish_info(&self) {
        let mut info = self.session.info(self.cache.watermark());
        info.clients = self.progress.values().cloned().collect();
        self.info_tx.send_replace(info);
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Input {
                client,
                payload,
                respond_to,
            } => {
                let _ = respond_to.send(self.on_input(&client, &payload));
            }
            SessionCommand::Attach {
                client,
                kind,
                respond_to,
            } => {
                let _ = respond_to.send(self.attach(client, kind));
            }
            SessionCommand::Detach { transport } => {
                if self.fanout.deregister(transport) {
                    debug!(session = %self.session.id, transport, "push transport detached");
                }
            }
            SessionCommand::Progress {
                client,
                last_idx,
                latency_ms,
            } => {
                let owner = client == self.session.owner;
                let entry = self.progress.entry(client).or_insert(ClientProgress {
                    owner,
                    last_idx: None,
                    latency_ms: None,
                    updated_at: Utc::now(),
                });
                entry.last_idx = last_idx.or(entry.last_idx);
                entry.latency_ms = latency_ms.or(entry.latency_ms);
                entry.updated_at = Utc::now();
                self.publish_info();
            }
            SessionCommand::OpenQueue { client, respond_to } => {
                let result = self.authorize(&client);
                if result.is_ok() {
                    self.fanout.enable_queue(&client);
                }
                let _ = respond_to.send(result);
            }
            SessionCommand::NextNotice { client, respond_to } => {
                let _ = respond_to.send(self.fanout.next_notice(&client));
            }
            SessionCommand::Authorize { client, respond_to } => {
                let _ = respond_to.send(self.authorize(&client));
            }
            SessionCommand::Invite {
                client,
                control,
                respond_to,
            } => {
                let _ = respond_to.send(self.invite(&client, control));
            }
            SessionCommand::ListGuests { client, respond_to } => {
                let result = self
                    .require_owner(&client)
                    .map(|()| self.session.guests.list());
                let _ = respond_to.send(result);
            }
            SessionCommand::UpdateGuest {
                client,
                guest,
                control,
                respond_to,
            } => {
                let result = self.require_owner(&client).and_then(|()| {
                    self.session
                        .guests
                        .set_control(guest, control)
                        .ok_or(GatewayError::GuestNotFound)
                });
                if result.is_ok() {
                    self.publish_info();
                }
                let _ = respond_to.send(result);
            }
            SessionCommand::RevokeGuest {
                client,
                guest,
                respond_to,
            } => {
                let _ = respond_to.send(self.revoke(&client, guest));
            }
            SessionCommand::Join {
                client,
                guest,
                respond_to,
            } => {
                let _ = respond_to.send(self.join(&client, guest));
            }
            SessionCommand::Close { client, respond_to } => {
                let result = self.require_owner(&client).map(|()| {
                    info!(session = %self.session.id, "owner requested close");
                    self.request_close();
                });
                let _ = respond_to.send(result);
            }
            SessionCommand::Shutdown { respond_to } => {
                self.request_close();
                if let Some(bridge) = &self.bridge {
                    tokio::spawn(bridge.control.stop());
                }
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Launched { generation, result } => {
                self.on_launched(generation, result);
            }
            ManagerEvent::Frame { generation, frame } => {
                if generation == self.generation && self.bridge.is_some() {
                    self.on_frame(frame).await;
                }
            }
            ManagerEvent::BridgeFailed { generation, error } => {
                if generation == self.generation {
                    self.on_bridge_failed(&error);
                }
            }
            ManagerEvent::HostExited {
                generation,
                exit_code,
            } => {
                if generation == self.generation {
                    self.on_host_exit(exit_code);
                }
            }
            ManagerEvent::ResizeSettled { timer } => {
                if self.resize_timer.take_fired(timer) {
                    self.on_resize_settled();
                }
            }
            ManagerEvent::OwnerIdle { timer } => {
                if self.owner_idle.take_fired(timer) {
                    info!(session = %self.session.id, "owner idle, closing session");
                    self.request_close();
                }
            }
            ManagerEvent::GuestIdle { client, timer } => {
                let fired = self
                    .guest_idle
                    .get_mut(&client)
                    .is_some_and(|slot| slot.take_fired(timer));
                if fired && self.session.guests.deactivate(&client) {
                    info!(session = %self.session.id, client = %client, "guest idle, slot freed");
                    self.publish_info();
                }
            }
        }
    }

    // --- host lifecycle ---

    /// Start a new host, replacing whatever bridge existed.
    fn launch(&mut self) {
        self.teardown_bridge();
        self.generation += 1;
        let generation = self.generation;
        let request = LaunchRequest {
            session_id: self.session.id,
            host_type: self.session.target.host_type,
            generation,
        };
        debug!(session = %self.session.id, generation, "launching display host");

        let launch = self.launcher.launch(request);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = launch.await;
            let _ = events
                .send(ManagerEvent::Launched { generation, result })
                .await;
        });
    }

    fn teardown_bridge(&mut self) {
        if self.bridge.take().is_some() {
            debug!(session = %self.session.id, generation = self.generation, "host bridge torn down");
        }
        self.fullscreen_pending = false;
    }

    fn on_launched(&mut self, generation: u64, result: anyhow::Result<HostLink>) {
        if generation != self.generation {
            if let Ok(link) = result {
                debug!(session = %self.session.id, generation, "stopping host from a superseded launch");
                tokio::spawn(link.control.stop());
            }
            return;
        }

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                error!(session = %self.session.id, "failed to start display host: {:#}", e);
                self.metrics.bridge_failure();
                self.session.reconnect = false;
                self.on_host_exit(None);
                return;
            }
        };

        info!(
            session = %self.session.id,
            generation,
            pid = ?link.control.pid(),
            "host bridge established"
        );
        self.install_bridge(generation, link);

        if self.session.state == SessionState::Disconnecting {
            // closed while the host was starting
            if let Some(bridge) = &self.bridge {
                tokio::spawn(bridge.control.stop());
            }
            return;
        }

        let mut handshake = self.session.target.setup_commands();
        handshake.extend(self.session.display.handshake_commands());
        handshake.push(Command::Connect);
        for command in &handshake {
            self.forward(command);
        }
    }

    fn install_bridge(&mut self, generation: u64, link: HostLink) {
        let HostLink { channel, control } = link;
        let HostChannel {
            inputs: mut sink,
            updates: mut stream,
        } = channel;
        let session = self.session.id;

        let (input_tx, mut input_rx) = mpsc::channel::<String>(HOST_INPUT_QUEUE);
        let events = self.events_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(wire) = input_rx.recv().await {
                if let Err(e) = framing::send_command(&mut sink, &wire).await {
                    let _ = events
                        .send(ManagerEvent::BridgeFailed {
                            generation,
                            error: format!("inputs: {e}"),
                        })
                        .await;
                    break;
                }
            }
        });

        let events = self.events_tx.clone();
        let metrics = self.metrics.clone();
        let reader = tokio::spawn(async move {
            while let Some(body) = stream.next().await {
                match body {
                    Ok(body) => match framing::decode_update(body) {
                        Ok(frame) => {
                            if events
                                .send(ManagerEvent::Frame { generation, frame })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            metrics.frame_error();
                            warn!(session = %session, "dropping host frame: {}", e);
                        }
                    },
                    Err(e) => {
                        let _ = events
                            .send(ManagerEvent::BridgeFailed {
                                generation,
                                error: format!("updates: {e}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            debug!(session = %session, generation, "host updates stream closed");
        });

        let events = self.events_tx.clone();
        let exited = control.exited();
        let watcher = tokio::spawn(async move {
            let exit_code = exited.await;
            let _ = events
                .send(ManagerEvent::HostExited {
                    generation,
                    exit_code,
                })
                .await;
        });

        self.bridge = Some(ActiveBridge {
            inputs: input_tx,
            control,
            tasks: vec![writer, reader, watcher],
        });
    }

    fn on_bridge_failed(&mut self, error: &str) {
        error!(session = %self.session.id, "host bridge failed: {}", error);
        self.metrics.bridge_failure();
        self.request_close();
        if let Some(bridge) = &self.bridge {
            tokio::spawn(bridge.control.stop());
        }
    }

    fn on_host_exit(&mut self, exit_code: Option<i32>) {
        self.teardown_bridge();
        self.resize_timer.cancel();
        self.pending_resize = None;
        self.owner_idle.cancel();
        for slot in self.guest_idle.values_mut() {
            slot.cancel();
        }

        match self.session.on_host_exit(exit_code) {
            ExitOutcome::Reconnect => {
                info!(session = %self.session.id, ?exit_code, "host exited, reconnecting");
                self.launch();
                self.arm_owner_idle();
                for client in self.session.guests.active_clients() {
                    self.arm_guest_idle(&client);
                }
            }
            ExitOutcome::Terminated => {
                info!(session = %self.session.id, ?exit_code, "session terminated");
                self.cache.close();
                self.fanout.disconnect_all(exit_code);
                self.metrics.session_terminated();
            }
        }
        self.publish_info();
    }

    // --- frames ---

    async fn on_frame(&mut self, frame: HostFrame) {
        if self.session.on_host_frame() {
            info!(session = %self.session.id, "session connected");
            self.fanout.publish_notice(Notice::Connected);
            self.publish_info();
        }

        match frame {
            HostFrame::Image(pending) => self.on_image(pending).await,
            HostFrame::Text(text) => {
                let notice = match text {
                    HostText::Reload => Notice::Reload,
                    HostText::Clipboard(text) if self.session.features.clipboard => {
                        Notice::Clipboard(text)
                    }
                    HostText::Terminal(text) => Notice::Terminal(text),
                    HostText::PrintJob(name) if self.session.features.print => {
                        Notice::PrintJob(name)
                    }
                    other => {
                        debug!(session = %self.session.id, notice = %other.to_wire(), "feature disabled, notice dropped");
                        return;
                    }
                };
                self.fanout.publish_notice(notice);
            }
        }
    }

    async fn on_image(&mut self, pending: PendingUpdate) {
        if pending.format.kind() == UpdateKind::Audio && !self.session.features.audio {
            return;
        }
        let region = pending.format.kind() == UpdateKind::Image
            && pending.format != UpdateFormat::Cur
            && !pending.fullscreen;
        if self.fullscreen_pending {
            if region {
                self.metrics.update_discarded();
                return;
            }
            if pending.fullscreen {
                self.fullscreen_pending = false;
            }
        }

        let update = self.cache.insert(pending).await;
        self.metrics.update_received();
        let delivery = self.fanout.publish_update(update);
        self.metrics
            .updates_pushed(delivery.delivered, delivery.dropped);
        if delivery.dropped > 0 && !self.fullscreen_pending {
            // lagging transports resume on the next full frame
            if self.forward(&Command::RequestFullscreenUpdate) {
                self.fullscreen_pending = true;
            }
        }
    }

    // --- client requests ---

    fn authorize(&mut self, client: &ClientId) -> Result<Role, GatewayError> {
        if client == &self.session.owner {
            return Ok(Role::Owner);
        }
        match self.session.guests.touch(client) {
            Ok(GuestAccess::Active { control }) => Ok(Role::Guest { control }),
            Ok(GuestAccess::Reclaimed { control }) => {
                info!(session = %self.session.id, client = %client, "guest reclaimed its slot");
                self.arm_guest_idle(client);
                self.publish_info();
                Ok(Role::Guest { control })
            }
            Ok(GuestAccess::NotAGuest) => Err(GatewayError::Forbidden("not a participant")),
            Err(rejection) => {
                self.metrics.join_rejected();
                Err(rejection.into())
            }
        }
    }

    fn require_owner(&self, client: &ClientId) -> Result<(), GatewayError> {
        if client == &self.session.owner {
            Ok(())
        } else {
            Err(GatewayError::Forbidden("owner only"))
        }
    }

    fn on_input(&mut self, client: &ClientId, payload: &str) -> Result<InputOutcome, GatewayError> {
        let role = self.authorize(client)?;
        if role.is_owner() {
            self.arm_owner_idle();
        } else {
            self.arm_guest_idle(client);
        }

        let mut outcome = InputOutcome::default();
        for unit in command::decode_batch(payload) {
            let command = match unit {
                Ok(command) => command,
                Err(e) => {
                    debug!(session = %self.session.id, client = %client, "dropping command: {}", e);
                    self.metrics.command_dropped_protocol();
                    outcome.dropped += 1;
                    continue;
                }
            };
            let kind = command.kind();
            if !role.may_send(kind) {
                debug!(session = %self.session.id, client = %client, command = %command, "not permitted for role");
                self.metrics.command_dropped_permission();
                outcome.dropped += 1;
                continue;
            }
            if !self.session.state.permits(kind) {
                debug!(
                    session = %self.session.id,
                    state = ?self.session.state,
                    command = %command,
                    "not permitted in current state"
                );
                self.metrics.command_dropped_state();
                outcome.dropped += 1;
                continue;
            }
            if self.apply(command) {
                outcome.forwarded += 1;
            } else {
                outcome.dropped += 1;
            }
        }
        Ok(outcome)
    }

    /// Act on a permitted command. False when it was dropped.
    fn apply(&mut self, command: Command) -> bool {
        let features = self.session.features;
        match &command {
            Command::BrowserResize { width, height } => {
                self.pending_resize = Some((*width, *height));
                let delay = self.policy.resize_settle;
                arm(&mut self.resize_timer, delay, &self.events_tx, |timer| {
                    ManagerEvent::ResizeSettled { timer }
                });
                true
            }
            Command::CloseClient => {
                self.request_close();
                true
            }
            Command::RequestFullscreenUpdate => {
                let forwarded = self.forward(&command);
                if forwarded {
                    self.fullscreen_pending = true;
                }
                forwarded
            }
            Command::SendLocalClipboard(_) if !features.clipboard => false,
            Command::SetAudioFormat(_) | Command::SetAudioBitrate(_) if !features.audio => false,
            _ => {
                if self.session.display.apply(&command) {
                    self.publish_info();
                }
                self.forward(&command)
            }
        }
    }

    fn on_resize_settled(&mut self) {
        let Some((width, height)) = self.pending_resize.take() else {
            return;
        };
        if self.session.state != SessionState::Connected {
            debug!(session = %self.session.id, state = ?self.session.state, "resize settled too late, dropped");
            return;
        }
        let resize = Command::BrowserResize { width, height };
        self.session.display.apply(&resize);

        if self.session.display.reconnect_on_resize {
            info!(session = %self.session.id, width, height, "resize settled, reconnecting host");
            if self.session.begin_disconnecting().is_ok() {
                self.session.reconnect = true;
                self.forward(&Command::CloseClient);
            }
        } else {
            debug!(session = %self.session.id, width, height, "resize settled");
            self.forward(&resize);
        }
        self.publish_info();
    }

    /// Move to Disconnecting and ask the host to close. No reconnect follows.
    fn request_close(&mut self) {
        self.session.reconnect = false;
        if self.session.begin_disconnecting().is_err() {
            return;
        }
        self.resize_timer.cancel();
        self.pending_resize = None;
        self.forward(&Command::CloseClient);
        self.publish_info();
    }

    fn attach(&mut self, client: ClientId, kind: PushKind) -> Result<PushSubscription, GatewayError> {
        self.authorize(&client)?;
        let subscription = self
            .fanout
            .register_push(client, kind, self.policy.push_capacity);
        match self.session.state {
            SessionState::Disconnected => {
                self.fanout.notify_transport(
                    subscription.id,
                    Notice::Disconnected {
                        exit_code: self.session.exit_code,
                    },
                );
                self.fanout.deregister(subscription.id);
            }
            SessionState::Connected => {
                self.fanout
                    .notify_transport(subscription.id, Notice::Connected);
            }
            _ => {}
        }
        Ok(subscription)
    }

    fn invite(&mut self, client: &ClientId, control: bool) -> Result<GuestInfo, GatewayError> {
        self.require_owner(client)?;
        if !self.session.features.sharing {
            return Err(JoinRejection::SharingDisabled.into());
        }
        let id = self.session.guests.invite(control);
        info!(session = %self.session.id, guest = %id, control, "guest invited");
        self.session
            .guests
            .get(id)
            .ok_or(GatewayError::GuestNotFound)
    }

    fn join(&mut self, client: &ClientId, guest: GuestId) -> Result<GuestInfo, GatewayError> {
        if client == &self.session.owner {
            return Err(GatewayError::Forbidden("owner cannot join as guest"));
        }
        let result = if self.session.features.sharing {
            self.session
                .guests
                .join(guest, client, self.session.state)
        } else {
            Err(JoinRejection::SharingDisabled)
        };
        match result {
            Ok(info) => {
                info!(session = %self.session.id, guest = %guest, "guest joined");
                self.arm_guest_idle(client);
                self.publish_info();
                Ok(info)
            }
            Err(rejection) => {
                debug!(session = %self.session.id, guest = %guest, "join rejected: {}", rejection);
                self.metrics.join_rejected();
                Err(rejection.into())
            }
        }
    }

    fn revoke(&mut self, client: &ClientId, guest: GuestId) -> Result<GuestInfo, GatewayError> {
        self.require_owner(client)?;
        let revoked = self
            .session
            .guests
            .revoke(guest)
            .ok_or(GatewayError::GuestNotFound)?;
        if let Some(holder) = &revoked.client {
            self.fanout.notify_client(holder, Notice::Reload);
            self.fanout.detach_client(holder);
            self.guest_idle.remove(holder);
            self.progress.remove(holder);
        }
        info!(session = %self.session.id, guest = %guest, "guest revoked");
        self.publish_info();
        Ok(GuestInfo::from(&revoked))
    }

    // --- plumbing ---

    fn forward(&self, command: &Command) -> bool {
        let Some(bridge) = &self.bridge else {
            debug!(session = %self.session.id, command = %command, "no host bridge, command dropped");
            return false;
        };
        match bridge.inputs.try_send(command.encode()) {
            Ok(()) => {
                self.metrics.command_forwarded();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.session.id, command = %command, "host input queue full, command dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %self.session.id, command = %command, "host writer gone, command dropped");
                false
            }
        }
    }

    fn arm_owner_idle(&mut self) {
        if let Some(delay) = self.policy.idle_timeout {
            arm(&mut self.owner_idle, delay, &self.events_tx, |timer| {
                ManagerEvent::OwnerIdle { timer }
            });
        }
    }

    fn arm_guest_idle(&mut self, client: &ClientId) {
        let Some(delay) = self.policy.guest_idle_timeout else {
            return;
        };
        let slot = self.guest_idle.entry(client.clone()).or_default();
        let client = client.clone();
        arm(slot, delay, &self.events_tx, move |timer| {
            ManagerEvent::GuestIdle { client, timer }
        });
    }
}
