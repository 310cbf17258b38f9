//! Host Process - lifecycle management for display host processes
//!
//! A display host is an external program (an RDP or SSH client) that renders
//! a remote desktop and talks to the gateway over a pair of framed pipes.
//! This crate only deals with the process itself: starting it, stopping it,
//! reporting its identity, and announcing its exit. It knows nothing about
//! the pipe protocol.
//!
//! # Example
//!
//! ```no_run
//! use host_process::{HostConfig, HostEvent, HostManager, StopSignal};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = HostManager::new();
//!     let mut events = manager.subscribe();
//!
//!     let config = HostConfig {
//!         program: "/usr/local/bin/rdp-host".to_string(),
//!         args: vec!["--session".to_string(), "42".to_string()],
//!         ..Default::default()
//!     };
//!
//!     let id = manager.spawn(config).await.unwrap();
//!     manager.stop(id, StopSignal::Terminate).await.unwrap();
//!
//!     while let Ok(event) = events.recv().await {
//!         let HostEvent::Exited { id, exit_code } = event;
//!         println!("host {} exited with {:?}", id, exit_code);
//!         break;
//!     }
//! }
//! ```

mod error;
mod manager;
pub mod process;

pub use error::HostError;
pub use manager::{HostEvent, HostId, HostManager};
pub use process::{HostConfig, HostExit, HostHandle, HostProcessActor, HostState, StopSignal};
