//! Process-tree introspection - delegates to platform tooling
//!
//! - Unix (Linux, macOS): `lsof` for port ownership, `ps` for parent lookup
//! - Elsewhere: no introspection, every lookup answers [`Lookup::Unknown`]

use crate::error::ProxyError;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix_inspect;
        pub use unix_inspect::LsofInspector as PlatformInspector;
    } else {
        mod null_inspect;
        pub use null_inspect::NullInspector as PlatformInspector;
    }
}

/// Outcome of a single introspection query.
///
/// `Missing` and `Unknown` are deliberately distinct: the first means the tool ran and found
/// nothing, the second means the question could not be answered at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Missing,
    Unknown(String),
}

/// Immediate parent of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInfo {
    pub ppid: u32,
    pub command: String,
}

/// Capability to map a listening port to its owner and walk one step up the process tree.
pub trait ProcessInspector: Send + Sync {
    /// Pid of the process listening on `port`.
    fn find_owning_pid(&self, port: u16) -> Lookup<u32>;

    /// Parent pid and the parent's command name.
    fn parent_of(&self, pid: u32) -> Lookup<ParentInfo>;

    /// Forcibly kill `pid`. Used only by the orphan-takeover path.
    fn force_kill(&self, pid: u32) -> Result<(), ProxyError>;
}
