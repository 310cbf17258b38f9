pub mod bridge;
pub mod framing;
pub mod wire;

pub use bridge::{HostControl, HostLauncher, HostLink, LaunchRequest};
pub use wire::Notice;
