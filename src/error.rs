//! Error taxonomy for hub operations

use thiserror::Error;

/// Errors surfaced by hub operations.
///
/// Creating an environment whose directory already exists is a logged no-op,
/// not an error. Proxy control failures (start/reload/stop of the proxy
/// binary) are likewise logged and swallowed so the hub stays serviceable
/// even when the proxy is missing.
#[derive(Debug, Error)]
pub enum HubError {
    /// No environment registered under this name
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// The environment is mid-build and cannot be started or deleted yet
    #[error("environment '{0}' is still building")]
    EnvironmentBuilding(String),

    /// The port allocator ran out of probes before finding enough free ports
    #[error("no free TCP ports found after {probes} probes")]
    ResourceExhausted { probes: usize },

    /// The external build tool exited non-zero
    #[error("environment build failed with {status}")]
    BuildFailure { status: std::process::ExitStatus },

    /// The payload server never answered the liveness probe
    #[error("payload server on port {port} did not respond within {timeout_secs}s")]
    StartupTimeout { port: u16, timeout_secs: u64 },

    /// The declarative environment manifest could not be parsed
    #[error("invalid environment manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
