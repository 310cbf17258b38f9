//! Session state machine and attribute bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::command::{AudioFormat, Command, CommandError, CommandKind, ImageEncoding};
use crate::sharing::{ClientId, GuestRoster};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a session. Ordering follows the lifecycle, which lets a
/// command's minimum state be compared directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl SessionState {
    /// Whether a command of this kind may be forwarded in this state.
    pub fn permits(self, kind: CommandKind) -> bool {
        kind.min_state() <= self && self < SessionState::Disconnected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} while {state:?}")]
pub struct StateError {
    pub state: SessionState,
    pub action: &'static str,
}

/// What a host exit means for the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// A new host process must be started.
    Reconnect,
    Terminated,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    #[default]
    Rdp,
    Ssh,
}

/// Where the display host connects to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub host_address: String,
    #[serde(default)]
    pub host_type: HostType,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub vm_guid: Option<String>,
    #[serde(default)]
    pub start_program: Option<String>,
}

impl ConnectionTarget {
    /// Setup commands sent once, before `Connect`.
    pub fn setup_commands(&self) -> Vec<Command> {
        let mut commands = vec![Command::ServerAddress(self.host_address.clone())];
        if let Some(guid) = &self.vm_guid {
            commands.push(Command::VmGuid(guid.clone()));
        }
        if let Some(domain) = &self.domain {
            commands.push(Command::UserDomain(domain.clone()));
        }
        if let Some(user) = &self.user_name {
            commands.push(Command::UserName(user.clone()));
        }
        if let Some(password) = &self.password {
            commands.push(Command::UserPassword(password.clone()));
        }
        if let Some(program) = &self.start_program {
            commands.push(Command::StartProgram(program.clone()));
        }
        commands
    }
}

/// Negotiated display parameters. Unset values are left to the host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySettings {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub encoding: Option<ImageEncoding>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub quantity: Option<u8>,
    #[serde(default)]
    pub scale_display: bool,
    #[serde(default)]
    pub reconnect_on_resize: bool,
    #[serde(default)]
    pub audio_format: Option<AudioFormat>,
    #[serde(default)]
    pub audio_bitrate: Option<u32>,
}

impl DisplaySettings {
    /// Fill unset values from server defaults.
    pub fn with_defaults(mut self, defaults: &DisplaySettings) -> Self {
        self.width = self.width.or(defaults.width);
        self.height = self.height.or(defaults.height);
        self.encoding = self.encoding.or(defaults.encoding);
        self.quality = self.quality.or(defaults.quality);
        self.quantity = self.quantity.or(defaults.quantity);
        self.audio_format = self.audio_format.or(defaults.audio_format);
        self.audio_bitrate = self.audio_bitrate.or(defaults.audio_bitrate);
        self
    }

    /// Reject values the host could not be told about. Each replayed
    /// command must survive the codec's own argument checks.
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.width.is_some() != self.height.is_some() {
            return Err(CommandError::InvalidValue {
                kind: CommandKind::BrowserResize,
                value: "width and height must be set together".into(),
            });
        }
        for command in self.handshake_commands() {
            Command::decode(&command.encode())?;
        }
        Ok(())
    }

    /// Record the effect of a settings command. Returns false for commands
    /// that do not touch display settings.
    pub fn apply(&mut self, command: &Command) -> bool {
        match command {
            Command::SetScaleDisplay(on) => self.scale_display = *on,
            Command::SetReconnectSession(on) => self.reconnect_on_resize = *on,
            Command::SetImageEncoding(encoding) => self.encoding = Some(*encoding),
            Command::SetImageQuality(q) => self.quality = Some(*q),
            Command::SetImageQuantity(q) => self.quantity = Some(*q),
            Command::SetAudioFormat(format) => self.audio_format = Some(*format),
            Command::SetAudioBitrate(kbps) => self.audio_bitrate = Some(*kbps),
            Command::BrowserResize { width, height } => {
                self.width = Some(*width);
                self.height = Some(*height);
            }
            _ => return false,
        }
        true
    }

    /// Settings replayed to every new host process, ahead of `Connect`.
    pub fn handshake_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        if let (Some(width), Some(height)) = (self.width, self.height) {
            commands.push(Command::BrowserResize { width, height });
        }
        if let Some(encoding) = self.encoding {
            commands.push(Command::SetImageEncoding(encoding));
        }
        if let Some(quality) = self.quality {
            commands.push(Command::SetImageQuality(quality));
        }
        if let Some(quantity) = self.quantity {
            commands.push(Command::SetImageQuantity(quantity));
        }
        if self.scale_display {
            commands.push(Command::SetScaleDisplay(true));
        }
        if let Some(format) = self.audio_format {
            commands.push(Command::SetAudioFormat(format));
        }
        if let Some(kbps) = self.audio_bitrate {
            commands.push(Command::SetAudioBitrate(kbps));
        }
        commands
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub clipboard: bool,
    pub file_transfer: bool,
    pub print: bool,
    pub sharing: bool,
    pub audio: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            clipboard: true,
            file_transfer: false,
            print: true,
            sharing: true,
            audio: true,
        }
    }
}

/// One remote display session, spanning every host process started for it.
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub target: ConnectionTarget,
    pub display: DisplaySettings,
    pub features: FeatureFlags,
    pub owner: ClientId,
    pub guests: GuestRoster,
    pub exit_code: Option<i32>,
    pub reconnect: bool,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Last progress report from one attached client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProgress {
    pub owner: bool,
    pub last_idx: Option<u64>,
    pub latency_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Serializable view of a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub target: ConnectionTarget,
    pub display: DisplaySettings,
    pub features: FeatureFlags,
    pub max_active_guests: usize,
    pub active_guests: usize,
    pub exit_code: Option<i32>,
    pub reconnect: bool,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_idx: u64,
    #[serde(default)]
    pub clients: Vec<ClientProgress>,
}

impl Session {
    pub fn new(
        id: SessionId,
        owner: ClientId,
        target: ConnectionTarget,
        display: DisplaySettings,
        features: FeatureFlags,
        max_active_guests: usize,
    ) -> Self {
        Self {
            id,
            state: SessionState::NotConnected,
            target,
            display,
            features,
            owner,
            guests: GuestRoster::new(max_active_guests),
            exit_code: None,
            reconnect: false,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn begin_connecting(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::NotConnected => {
                self.state = SessionState::Connecting;
                Ok(())
            }
            state => Err(StateError {
                state,
                action: "start connecting",
            }),
        }
    }

    /// Any frame from the host while connecting means the host is up.
    /// Returns true on the transition.
    pub fn on_host_frame(&mut self) -> bool {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
            true
        } else {
            false
        }
    }

    pub fn begin_disconnecting(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                self.state = SessionState::Disconnecting;
                Ok(())
            }
            state => Err(StateError {
                state,
                action: "disconnect",
            }),
        }
    }

    /// Host exit is authoritative whatever the current state.
    pub fn on_host_exit(&mut self, exit_code: Option<i32>) -> ExitOutcome {
        self.exit_code = exit_code;
        self.state = SessionState::Disconnected;
        if self.reconnect {
            self.reconnect = false;
            self.state = SessionState::Connecting;
            ExitOutcome::Reconnect
        } else {
            self.ended_at = Some(Utc::now());
            ExitOutcome::Terminated
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    pub fn info(&self, last_idx: u64) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state,
            target: self.target.clone(),
            display: self.display.clone(),
            features: self.features,
            max_active_guests: self.guests.max_active(),
            active_guests: self.guests.active_count(),
            exit_code: self.exit_code,
            reconnect: self.reconnect,
            created_at: self.created_at,
            ended_at: self.ended_at,
            last_idx,
            clients: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId::new(),
            ClientId::from("owner"),
            ConnectionTarget {
                host_address: "10.0.0.5".into(),
                user_name: Some("alice".into()),
                password: Some("secret".into()),
                ..Default::default()
            },
            DisplaySettings::default(),
            FeatureFlags::default(),
            2,
        )
    }

    #[test]
    fn test_display_validation_matches_codec() {
        let good = DisplaySettings {
            width: Some(1280),
            height: Some(720),
            quality: Some(100),
            ..Default::default()
        };
        assert!(good.validate().is_ok());
        assert!(DisplaySettings::default().validate().is_ok());

        let loud = DisplaySettings {
            quality: Some(200),
            ..Default::default()
        };
        assert!(loud.validate().is_err());
        let flat = DisplaySettings {
            width: Some(0),
            height: Some(720),
            ..Default::default()
        };
        assert!(flat.validate().is_err());
        let half = DisplaySettings {
            height: Some(720),
            ..Default::default()
        };
        assert!(half.validate().is_err());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut s = session();
        assert_eq!(s.state, SessionState::NotConnected);
        s.begin_connecting().unwrap();
        assert!(s.on_host_frame());
        assert!(!s.on_host_frame());
        assert_eq!(s.state, SessionState::Connected);
        s.begin_disconnecting().unwrap();
        assert_eq!(s.on_host_exit(Some(0)), ExitOutcome::Terminated);
        assert!(s.is_terminated());
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn test_exit_with_reconnect_reenters_connecting() {
        let mut s = session();
        s.begin_connecting().unwrap();
        s.on_host_frame();
        s.reconnect = true;
        assert_eq!(s.on_host_exit(Some(0)), ExitOutcome::Reconnect);
        assert_eq!(s.state, SessionState::Connecting);
        assert!(!s.reconnect);
        assert!(s.ended_at.is_none());
    }

    #[test]
    fn test_exit_is_authoritative_while_connecting() {
        let mut s = session();
        s.begin_connecting().unwrap();
        assert_eq!(s.on_host_exit(Some(7)), ExitOutcome::Terminated);
        assert_eq!(s.exit_code, Some(7));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut s = session();
        assert!(s.begin_disconnecting().is_err());
        s.begin_connecting().unwrap();
        assert!(s.begin_connecting().is_err());
    }

    #[test]
    fn test_permits_by_min_state() {
        assert!(!SessionState::Connecting.permits(CommandKind::SetImageQuality));
        assert!(SessionState::Connected.permits(CommandKind::SetImageQuality));
        assert!(SessionState::Disconnecting.permits(CommandKind::MouseMove));
        assert!(SessionState::Connecting.permits(CommandKind::CloseClient));
        assert!(!SessionState::Disconnected.permits(CommandKind::CloseClient));
        assert!(!SessionState::NotConnected.permits(CommandKind::BrowserPulse));
    }

    #[test]
    fn test_setup_commands_order() {
        let wire: Vec<String> = session()
            .target
            .setup_commands()
            .iter()
            .map(Command::encode)
            .collect();
        assert_eq!(wire, vec!["SRV10.0.0.5", "USRalice", "PWDsecret"]);
    }

    #[test]
    fn test_display_apply_and_handshake() {
        let mut display = DisplaySettings::default();
        assert!(display.apply(&Command::SetImageQuality(40)));
        assert!(display.apply(&Command::BrowserResize {
            width: 1024,
            height: 768
        }));
        assert!(!display.apply(&Command::RequestFullscreenUpdate));

        let wire: Vec<String> = display
            .handshake_commands()
            .iter()
            .map(Command::encode)
            .collect();
        assert_eq!(wire, vec!["RSZ1024x768", "QLT40"]);
    }

    #[test]
    fn test_display_defaults_do_not_override() {
        let defaults = DisplaySettings {
            width: Some(1920),
            height: Some(1080),
            quality: Some(50),
            ..Default::default()
        };
        let display = DisplaySettings {
            quality: Some(90),
            ..Default::default()
        }
        .with_defaults(&defaults);
        assert_eq!(display.width, Some(1920));
        assert_eq!(display.quality, Some(90));
    }

    #[test]
    fn test_password_not_serialized() {
        let json = serde_json::to_string(&session().target).unwrap();
        assert!(!json.contains("secret"));
    }
}
