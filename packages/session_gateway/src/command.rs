//! Short-prefix command protocol.
//!
//! Every command is a three character prefix followed by a free-form
//! argument: `KSC30-1-0`, `RSZ1280x720`, `CON`. The same wire form travels
//! from browsers to the gateway (batched, comma separated) and from the
//! gateway to the display host (one command per frame).

use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionState;

/// Separator between commands in one client message.
pub const BATCH_SEPARATOR: char = ',';
/// Separator between sub-fields of a composite argument.
pub const FIELD_SEPARATOR: char = '-';

const PREFIX_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    ServerAddress,
    VmGuid,
    UserDomain,
    UserName,
    UserPassword,
    StartProgram,
    Connect,
    BrowserResize,
    BrowserPulse,
    KeyUnicode,
    KeyScancode,
    MouseMove,
    MouseLeftButton,
    MouseMiddleButton,
    MouseRightButton,
    MouseWheelUp,
    MouseWheelDown,
    SetScaleDisplay,
    SetReconnectSession,
    SetImageEncoding,
    SetImageQuality,
    SetImageQuantity,
    SetAudioFormat,
    SetAudioBitrate,
    SetScreenshotConfig,
    StartTakingScreenshots,
    StopTakingScreenshots,
    TakeScreenshot,
    RequestFullscreenUpdate,
    SendLocalClipboard,
    CloseClient,
}

/// Prefix table, in declaration order of [`CommandKind`].
const PREFIXES: [(CommandKind, &str); 31] = [
    (CommandKind::ServerAddress, "SRV"),
    (CommandKind::VmGuid, "VMG"),
    (CommandKind::UserDomain, "DOM"),
    (CommandKind::UserName, "USR"),
    (CommandKind::UserPassword, "PWD"),
    (CommandKind::StartProgram, "PRG"),
    (CommandKind::Connect, "CON"),
    (CommandKind::BrowserResize, "RSZ"),
    (CommandKind::BrowserPulse, "PLS"),
    (CommandKind::KeyUnicode, "KUC"),
    (CommandKind::KeyScancode, "KSC"),
    (CommandKind::MouseMove, "MMO"),
    (CommandKind::MouseLeftButton, "MLB"),
    (CommandKind::MouseMiddleButton, "MMB"),
    (CommandKind::MouseRightButton, "MRB"),
    (CommandKind::MouseWheelUp, "MWU"),
    (CommandKind::MouseWheelDown, "MWD"),
    (CommandKind::SetScaleDisplay, "SCA"),
    (CommandKind::SetReconnectSession, "RCN"),
    (CommandKind::SetImageEncoding, "ECD"),
    (CommandKind::SetImageQuality, "QLT"),
    (CommandKind::SetImageQuantity, "QNT"),
    (CommandKind::SetAudioFormat, "AUD"),
    (CommandKind::SetAudioBitrate, "ABR"),
    (CommandKind::SetScreenshotConfig, "SSC"),
    (CommandKind::StartTakingScreenshots, "SSS"),
    (CommandKind::StopTakingScreenshots, "SSE"),
    (CommandKind::TakeScreenshot, "SST"),
    (CommandKind::RequestFullscreenUpdate, "FSU"),
    (CommandKind::SendLocalClipboard, "CLP"),
    (CommandKind::CloseClient, "CLO"),
];

/// Who may originate a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Only the gateway itself, during connection setup.
    Gateway,
    Owner,
    /// The owner and guests holding control.
    Control,
    Anyone,
}

impl CommandKind {
    pub fn all() -> impl Iterator<Item = CommandKind> {
        PREFIXES.iter().map(|(kind, _)| *kind)
    }

    pub const fn prefix(self) -> &'static str {
        PREFIXES[self as usize].1
    }

    pub fn from_prefix(prefix: &str) -> Option<CommandKind> {
        PREFIXES
            .iter()
            .find(|(_, p)| *p == prefix)
            .map(|(kind, _)| *kind)
    }

    /// Lowest session state in which the command may be forwarded.
    pub const fn min_state(self) -> SessionState {
        use CommandKind::*;
        match self {
            ServerAddress | VmGuid | UserDomain | UserName | UserPassword | StartProgram
            | Connect | BrowserPulse | CloseClient => SessionState::Connecting,
            _ => SessionState::Connected,
        }
    }

    pub const fn access(self) -> Access {
        use CommandKind::*;
        match self {
            ServerAddress | VmGuid | UserDomain | UserName | UserPassword | StartProgram
            | Connect => Access::Gateway,
            KeyUnicode | KeyScancode | MouseMove | MouseLeftButton | MouseMiddleButton
            | MouseRightButton | MouseWheelUp | MouseWheelDown | SendLocalClipboard => {
                Access::Control
            }
            BrowserPulse | RequestFullscreenUpdate => Access::Anyone,
            BrowserResize | SetScaleDisplay | SetReconnectSession | SetImageEncoding
            | SetImageQuality | SetImageQuantity | SetAudioFormat | SetAudioBitrate
            | SetScreenshotConfig | StartTakingScreenshots | StopTakingScreenshots
            | TakeScreenshot | CloseClient => Access::Owner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command too short: {0:?}")]
    Truncated(String),

    #[error("unknown command prefix {0:?}")]
    UnknownPrefix(String),

    #[error("{kind:?} expects {expected} fields, got {found}")]
    Arity {
        kind: CommandKind,
        expected: usize,
        found: usize,
    },

    #[error("{kind:?}: invalid value {value:?}")]
    InvalidValue { kind: CommandKind, value: String },

    #[error("{kind:?} takes no argument, got {value:?}")]
    UnexpectedArgument { kind: CommandKind, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WheelDirection {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Auto,
    Png,
    Jpeg,
    Webp,
}

impl ImageEncoding {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Auto),
            1 => Some(Self::Png),
            2 => Some(Self::Jpeg),
            3 => Some(Self::Webp),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    None,
    Wav,
    Mp3,
}

impl AudioFormat {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Wav),
            2 => Some(Self::Mp3),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotFormat {
    Png,
    Jpeg,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    pub interval_secs: u32,
    pub format: ScreenshotFormat,
    pub path: String,
}

/// A decoded command with its typed argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ServerAddress(String),
    VmGuid(String),
    UserDomain(String),
    UserName(String),
    UserPassword(String),
    StartProgram(String),
    Connect,
    BrowserResize { width: u32, height: u32 },
    BrowserPulse,
    KeyUnicode { code: u32, pressed: bool },
    KeyScancode { code: u32, pressed: bool, extended: bool },
    MouseMove { x: u32, y: u32 },
    MouseButton { button: MouseButton, pressed: bool, x: u32, y: u32 },
    MouseWheel { direction: WheelDirection, x: u32, y: u32 },
    SetScaleDisplay(bool),
    SetReconnectSession(bool),
    SetImageEncoding(ImageEncoding),
    SetImageQuality(u8),
    SetImageQuantity(u8),
    SetAudioFormat(AudioFormat),
    SetAudioBitrate(u32),
    SetScreenshotConfig(ScreenshotConfig),
    StartTakingScreenshots,
    StopTakingScreenshots,
    TakeScreenshot,
    RequestFullscreenUpdate,
    SendLocalClipboard(String),
    CloseClient,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        use CommandKind as K;
        match self {
            Command::ServerAddress(_) => K::ServerAddress,
            Command::VmGuid(_) => K::VmGuid,
            Command::UserDomain(_) => K::UserDomain,
            Command::UserName(_) => K::UserName,
            Command::UserPassword(_) => K::UserPassword,
            Command::StartProgram(_) => K::StartProgram,
            Command::Connect => K::Connect,
            Command::BrowserResize { .. } => K::BrowserResize,
            Command::BrowserPulse => K::BrowserPulse,
            Command::KeyUnicode { .. } => K::KeyUnicode,
            Command::KeyScancode { .. } => K::KeyScancode,
            Command::MouseMove { .. } => K::MouseMove,
            Command::MouseButton { button, .. } => match button {
                MouseButton::Left => K::MouseLeftButton,
                MouseButton::Middle => K::MouseMiddleButton,
                MouseButton::Right => K::MouseRightButton,
            },
            Command::MouseWheel { direction, .. } => match direction {
                WheelDirection::Up => K::MouseWheelUp,
                WheelDirection::Down => K::MouseWheelDown,
            },
            Command::SetScaleDisplay(_) => K::SetScaleDisplay,
            Command::SetReconnectSession(_) => K::SetReconnectSession,
            Command::SetImageEncoding(_) => K::SetImageEncoding,
            Command::SetImageQuality(_) => K::SetImageQuality,
            Command::SetImageQuantity(_) => K::SetImageQuantity,
            Command::SetAudioFormat(_) => K::SetAudioFormat,
            Command::SetAudioBitrate(_) => K::SetAudioBitrate,
            Command::SetScreenshotConfig(_) => K::SetScreenshotConfig,
            Command::StartTakingScreenshots => K::StartTakingScreenshots,
            Command::StopTakingScreenshots => K::StopTakingScreenshots,
            Command::TakeScreenshot => K::TakeScreenshot,
            Command::RequestFullscreenUpdate => K::RequestFullscreenUpdate,
            Command::SendLocalClipboard(_) => K::SendLocalClipboard,
            Command::CloseClient => K::CloseClient,
        }
    }

    fn argument(&self) -> String {
        match self {
            Command::ServerAddress(s)
            | Command::VmGuid(s)
            | Command::UserDomain(s)
            | Command::UserName(s)
            | Command::UserPassword(s)
            | Command::StartProgram(s) => s.clone(),
            Command::BrowserResize { width, height } => format!("{width}x{height}"),
            Command::KeyUnicode { code, pressed } => format!("{code}-{}", flag(*pressed)),
            Command::KeyScancode {
                code,
                pressed,
                extended,
            } => format!("{code}-{}-{}", flag(*pressed), flag(*extended)),
            Command::MouseMove { x, y } | Command::MouseWheel { x, y, .. } => {
                format!("{x}-{y}")
            }
            Command::MouseButton { pressed, x, y, .. } => {
                format!("{}-{x}-{y}", flag(*pressed))
            }
            Command::SetScaleDisplay(on) | Command::SetReconnectSession(on) => {
                flag(*on).to_string()
            }
            Command::SetImageEncoding(encoding) => encoding.code().to_string(),
            Command::SetImageQuality(v) | Command::SetImageQuantity(v) => v.to_string(),
            Command::SetAudioFormat(format) => format.code().to_string(),
            Command::SetAudioBitrate(kbps) => kbps.to_string(),
            Command::SetScreenshotConfig(config) => {
                let format = match config.format {
                    ScreenshotFormat::Png => "png",
                    ScreenshotFormat::Jpeg => "jpeg",
                };
                format!("{}|{}|{}", config.interval_secs, format, config.path)
            }
            Command::SendLocalClipboard(text) => {
                utf8_percent_encode(text, NON_ALPHANUMERIC).to_string()
            }
            Command::Connect
            | Command::BrowserPulse
            | Command::StartTakingScreenshots
            | Command::StopTakingScreenshots
            | Command::TakeScreenshot
            | Command::RequestFullscreenUpdate
            | Command::CloseClient => String::new(),
        }
    }

    /// Wire form: prefix followed by the argument.
    pub fn encode(&self) -> String {
        let mut out = String::from(self.kind().prefix());
        out.push_str(&self.argument());
        out
    }

    /// Decode a single command unit.
    pub fn decode(unit: &str) -> Result<Command, CommandError> {
        let (prefix, arg) = unit
            .split_at_checked(PREFIX_LEN)
            .ok_or_else(|| CommandError::Truncated(unit.to_string()))?;
        let kind = CommandKind::from_prefix(prefix)
            .ok_or_else(|| CommandError::UnknownPrefix(prefix.to_string()))?;

        use CommandKind as K;
        let command = match kind {
            K::ServerAddress => Command::ServerAddress(arg.to_string()),
            K::VmGuid => Command::VmGuid(arg.to_string()),
            K::UserDomain => Command::UserDomain(arg.to_string()),
            K::UserName => Command::UserName(arg.to_string()),
            K::UserPassword => Command::UserPassword(arg.to_string()),
            K::StartProgram => Command::StartProgram(arg.to_string()),
            K::Connect => no_argument(kind, arg, Command::Connect)?,
            K::BrowserPulse => no_argument(kind, arg, Command::BrowserPulse)?,
            K::StartTakingScreenshots => no_argument(kind, arg, Command::StartTakingScreenshots)?,
            K::StopTakingScreenshots => no_argument(kind, arg, Command::StopTakingScreenshots)?,
            K::TakeScreenshot => no_argument(kind, arg, Command::TakeScreenshot)?,
            K::RequestFullscreenUpdate => {
                no_argument(kind, arg, Command::RequestFullscreenUpdate)?
            }
            K::CloseClient => no_argument(kind, arg, Command::CloseClient)?,
            K::BrowserResize => {
                let (w, h) = arg.split_once('x').ok_or_else(|| invalid(kind, arg))?;
                let width = number(kind, w)?;
                let height = number(kind, h)?;
                if width == 0 || height == 0 {
                    return Err(invalid(kind, arg));
                }
                Command::BrowserResize { width, height }
            }
            K::KeyUnicode => {
                let f = fields::<2>(kind, arg)?;
                Command::KeyUnicode {
                    code: number(kind, f[0])?,
                    pressed: parse_flag(kind, f[1])?,
                }
            }
            K::KeyScancode => {
                let f = fields::<3>(kind, arg)?;
                Command::KeyScancode {
                    code: number(kind, f[0])?,
                    pressed: parse_flag(kind, f[1])?,
                    extended: parse_flag(kind, f[2])?,
                }
            }
            K::MouseMove => {
                let f = fields::<2>(kind, arg)?;
                Command::MouseMove {
                    x: number(kind, f[0])?,
                    y: number(kind, f[1])?,
                }
            }
            K::MouseLeftButton | K::MouseMiddleButton | K::MouseRightButton => {
                let button = match kind {
                    K::MouseLeftButton => MouseButton::Left,
                    K::MouseMiddleButton => MouseButton::Middle,
                    _ => MouseButton::Right,
                };
                let f = fields::<3>(kind, arg)?;
                Command::MouseButton {
                    button,
                    pressed: parse_flag(kind, f[0])?,
                    x: number(kind, f[1])?,
                    y: number(kind, f[2])?,
                }
            }
            K::MouseWheelUp | K::MouseWheelDown => {
                let direction = if kind == K::MouseWheelUp {
                    WheelDirection::Up
                } else {
                    WheelDirection::Down
                };
                let f = fields::<2>(kind, arg)?;
                Command::MouseWheel {
                    direction,
                    x: number(kind, f[0])?,
                    y: number(kind, f[1])?,
                }
            }
            K::SetScaleDisplay => Command::SetScaleDisplay(parse_flag(kind, arg)?),
            K::SetReconnectSession => Command::SetReconnectSession(parse_flag(kind, arg)?),
            K::SetImageEncoding => Command::SetImageEncoding(
                ImageEncoding::from_code(number(kind, arg)?).ok_or_else(|| invalid(kind, arg))?,
            ),
            K::SetImageQuality => Command::SetImageQuality(percent(kind, arg)?),
            K::SetImageQuantity => Command::SetImageQuantity(percent(kind, arg)?),
            K::SetAudioFormat => Command::SetAudioFormat(
                AudioFormat::from_code(number(kind, arg)?).ok_or_else(|| invalid(kind, arg))?,
            ),
            K::SetAudioBitrate => Command::SetAudioBitrate(number(kind, arg)?),
            K::SetScreenshotConfig => {
                let mut parts = arg.splitn(3, '|');
                let (Some(interval), Some(format), Some(path)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(CommandError::Arity {
                        kind,
                        expected: 3,
                        found: arg.split('|').count(),
                    });
                };
                let format = match format {
                    "png" => ScreenshotFormat::Png,
                    "jpeg" | "jpg" => ScreenshotFormat::Jpeg,
                    other => return Err(invalid(kind, other)),
                };
                Command::SetScreenshotConfig(ScreenshotConfig {
                    interval_secs: number(kind, interval)?,
                    format,
                    path: path.to_string(),
                })
            }
            K::SendLocalClipboard => {
                let text = percent_decode_str(arg)
                    .decode_utf8()
                    .map_err(|_| invalid(kind, arg))?;
                Command::SendLocalClipboard(text.into_owned())
            }
        };
        Ok(command)
    }
}

impl std::fmt::Display for Command {
    /// Renders the wire form, with the password masked.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::UserPassword(_) => write!(f, "{}***", CommandKind::UserPassword.prefix()),
            other => f.write_str(&other.encode()),
        }
    }
}

/// Split a client message into units and decode each one independently.
///
/// Empty units (a trailing separator) are skipped; a malformed unit yields
/// an error in its slot without affecting its neighbours.
pub fn decode_batch(payload: &str) -> Vec<Result<Command, CommandError>> {
    payload
        .split(BATCH_SEPARATOR)
        .filter(|unit| !unit.is_empty())
        .map(Command::decode)
        .collect()
}

fn flag(on: bool) -> &'static str {
    if on { "1" } else { "0" }
}

fn invalid(kind: CommandKind, value: &str) -> CommandError {
    CommandError::InvalidValue {
        kind,
        value: value.to_string(),
    }
}

fn no_argument(kind: CommandKind, arg: &str, command: Command) -> Result<Command, CommandError> {
    if arg.is_empty() {
        Ok(command)
    } else {
        Err(CommandError::UnexpectedArgument {
            kind,
            value: arg.to_string(),
        })
    }
}

fn fields<const N: usize>(kind: CommandKind, arg: &str) -> Result<[&str; N], CommandError> {
    let parts: Vec<&str> = arg.split(FIELD_SEPARATOR).collect();
    let found = parts.len();
    parts.try_into().map_err(|_| CommandError::Arity {
        kind,
        expected: N,
        found,
    })
}

fn number<T: std::str::FromStr>(kind: CommandKind, value: &str) -> Result<T, CommandError> {
    value.parse().map_err(|_| invalid(kind, value))
}

fn percent(kind: CommandKind, value: &str) -> Result<u8, CommandError> {
    let v: u8 = number(kind, value)?;
    if v > 100 {
        return Err(invalid(kind, value));
    }
    Ok(v)
}

fn parse_flag(kind: CommandKind, value: &str) -> Result<bool, CommandError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(invalid(kind, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_prefix_table_is_bijective() {
        let kinds: Vec<CommandKind> = CommandKind::all().collect();
        let prefixes: HashSet<&str> = kinds.iter().map(|k| k.prefix()).collect();
        assert_eq!(prefixes.len(), kinds.len());

        for (position, kind) in kinds.iter().enumerate() {
            assert_eq!(*kind as usize, position, "table out of order at {kind:?}");
            assert_eq!(kind.prefix().len(), PREFIX_LEN);
            assert_eq!(CommandKind::from_prefix(kind.prefix()), Some(*kind));
        }
    }

    #[test]
    fn test_unknown_prefix_is_an_error() {
        assert_eq!(
            Command::decode("ZZZ1"),
            Err(CommandError::UnknownPrefix("ZZZ".into()))
        );
        assert_eq!(
            Command::decode("KS"),
            Err(CommandError::Truncated("KS".into()))
        );
    }

    #[test]
    fn test_decode_scancode() {
        assert_eq!(
            Command::decode("KSC30-1-0").unwrap(),
            Command::KeyScancode {
                code: 30,
                pressed: true,
                extended: false
            }
        );
    }

    #[test]
    fn test_scancode_arity_is_checked() {
        assert_eq!(
            Command::decode("KSC30-1"),
            Err(CommandError::Arity {
                kind: CommandKind::KeyScancode,
                expected: 3,
                found: 2
            })
        );
        assert!(matches!(
            Command::decode("KSC30-2-0"),
            Err(CommandError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_decode_resize_and_mouse() {
        assert_eq!(
            Command::decode("RSZ1280x720").unwrap(),
            Command::BrowserResize {
                width: 1280,
                height: 720
            }
        );
        assert!(Command::decode("RSZ0x720").is_err());
        assert_eq!(
            Command::decode("MRB1-10-20").unwrap(),
            Command::MouseButton {
                button: MouseButton::Right,
                pressed: true,
                x: 10,
                y: 20
            }
        );
        assert_eq!(
            Command::decode("MWD5-6").unwrap().kind(),
            CommandKind::MouseWheelDown
        );
    }

    #[test]
    fn test_settings_ranges() {
        assert_eq!(
            Command::decode("QLT50").unwrap(),
            Command::SetImageQuality(50)
        );
        assert!(Command::decode("QLT101").is_err());
        assert_eq!(
            Command::decode("ECD2").unwrap(),
            Command::SetImageEncoding(ImageEncoding::Jpeg)
        );
        assert!(Command::decode("ECD9").is_err());
        assert!(Command::decode("FSUx").is_err());
    }

    #[test]
    fn test_screenshot_config_keeps_path_intact() {
        let command = Command::decode("SSC60|png|/tmp/shots|a").unwrap();
        assert_eq!(
            command,
            Command::SetScreenshotConfig(ScreenshotConfig {
                interval_secs: 60,
                format: ScreenshotFormat::Png,
                path: "/tmp/shots|a".into()
            })
        );
        assert!(Command::decode("SSC60|png").is_err());
    }

    #[test]
    fn test_clipboard_survives_batching() {
        let command = Command::SendLocalClipboard("a, b-c".into());
        let wire = command.encode();
        assert!(!wire.contains(','));

        let payload = format!("{wire},FSU");
        let decoded: Vec<_> = decode_batch(&payload).into_iter().collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap(), &command);
    }

    #[test]
    fn test_encode_matches_decode_for_composites() {
        let commands = [
            Command::KeyScancode {
                code: 57,
                pressed: false,
                extended: true,
            },
            Command::BrowserResize {
                width: 800,
                height: 600,
            },
            Command::SetAudioFormat(AudioFormat::Mp3),
            Command::CloseClient,
        ];
        for command in commands {
            assert_eq!(Command::decode(&command.encode()).unwrap(), command);
        }
    }

    #[test]
    fn test_batch_with_bad_middle_unit() {
        let results = decode_batch("KUC65-1,KSC30-x,MMO10-20");
        assert_eq!(results.len(), 3);
        let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0].kind(), CommandKind::KeyUnicode);
        assert_eq!(ok[1].kind(), CommandKind::MouseMove);
    }

    #[test]
    fn test_batch_skips_empty_units() {
        assert_eq!(decode_batch("FSU,,PLS,").len(), 2);
        assert!(decode_batch("").is_empty());
    }

    #[test]
    fn test_password_is_masked_in_display() {
        let command = Command::UserPassword("hunter2".into());
        assert_eq!(command.to_string(), "PWD***");
        assert_eq!(command.encode(), "PWDhunter2");
    }

    #[test]
    fn test_min_state_and_access() {
        assert_eq!(
            CommandKind::SetImageQuality.min_state(),
            SessionState::Connected
        );
        assert_eq!(CommandKind::CloseClient.min_state(), SessionState::Connecting);
        assert_eq!(CommandKind::Connect.access(), Access::Gateway);
        assert_eq!(CommandKind::RequestFullscreenUpdate.access(), Access::Anyone);
        assert_eq!(CommandKind::SendLocalClipboard.access(), Access::Control);
    }
}
