use thiserror::Error;

/// Errors that can occur while managing a host process
#[derive(Debug, Error)]
pub enum HostError {
    /// The program could not be started
    #[error("failed to spawn host process `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// No host with this id is managed
    #[error("host process not found: {0}")]
    NotFound(u64),
    /// Delivering a stop signal failed
    #[error("failed to stop host process: {0}")]
    StopFailed(String),
    /// The actor behind a handle is gone
    #[error("host process actor is gone")]
    ActorGone,
}
