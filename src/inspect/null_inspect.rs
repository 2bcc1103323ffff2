//! Inspector for platforms without process-tree introspection

use super::{Lookup, ParentInfo, ProcessInspector};
use crate::error::ProxyError;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullInspector;

impl NullInspector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ProcessInspector for NullInspector {
    fn find_owning_pid(&self, _port: u16) -> Lookup<u32> {
        Lookup::Unknown("process introspection is not supported on this platform".into())
    }

    fn parent_of(&self, _pid: u32) -> Lookup<ParentInfo> {
        Lookup::Unknown("process introspection is not supported on this platform".into())
    }

    fn force_kill(&self, pid: u32) -> Result<(), ProxyError> {
        Err(ProxyError::OrphanDetectionUncertain(format!(
            "refusing to kill pid {pid}: no process introspection on this platform"
        )))
    }
}
