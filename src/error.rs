//! Error taxonomy for the proxy supervisor.
//!
//! Only `ConfigInvalid`, `ExecutableUnavailable` and a second `SpawnRace` are fatal for a start
//! attempt. The periodic loops log everything else and carry on.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing blacklist/addon file or an out-of-range setting.
    #[error("invalid proxy configuration: {0}")]
    ConfigInvalid(String),

    /// `--version` check failed, timed out or exited non-zero.
    #[error("proxy executable {} is unavailable: {reason}", path.display())]
    ExecutableUnavailable { path: PathBuf, reason: String },

    /// The child died inside the startup liveness window, usually because another
    /// instance bound the port first.
    #[error("proxy exited during startup on port {port} (exit code {code:?}); port likely taken")]
    SpawnRace { port: u16, code: Option<i32> },

    #[error("failed to spawn proxy {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("owned proxy (pid {pid}) exited unexpectedly (exit code {code:?})")]
    ProcessCrashed { pid: u32, code: Option<i32> },

    #[error("orphan detection inconclusive: {0}")]
    OrphanDetectionUncertain(String),

    #[error("no previous proxy configuration is held")]
    NoPriorConfig,

    #[error("proxy is not running")]
    NotRunning,

    #[error("system proxy settings: {0}")]
    SystemProxy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for failures the startup wait-and-retry protocol may resolve.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SpawnRace { .. } | Self::Spawn { .. })
    }
}
