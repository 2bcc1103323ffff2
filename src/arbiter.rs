//! Ownership arbitration: who serves the port, and is that process still supervised?
//!
//! There is no lock service. The bound port says *someone* owns the proxy; the process tree
//! says whether that someone still has a live host above it.

use crate::inspect::{Lookup, ProcessInspector};
use crate::state::OwnershipState;
use crate::supervisor::HandleState;

/// Result of orphan classification for a port this instance does not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanVerdict {
    /// No recognised host above the proxy. `pid` is the process to kill, when known.
    Orphaned { pid: Option<u32>, reason: String },
    Healthy { pid: u32, parent_command: String },
    /// Introspection unavailable or inconclusive; treated as healthy.
    Uncertain { reason: String },
}

impl OrphanVerdict {
    #[inline]
    pub fn is_orphaned(&self) -> bool {
        matches!(self, OrphanVerdict::Orphaned { .. })
    }
}

/// Classify the process listening on `port`.
///
/// An unresolvable owner or parent counts as orphaned (an unsupervised proxy is worse than a
/// brief double spawn). A question the platform cannot answer at all never does.
///
/// The command-name match is a substring heuristic: a legitimate host whose executable name
/// matches none of `host_names` is misclassified as orphaned.
pub fn classify_orphan(
    inspector: &dyn ProcessInspector,
    port: u16,
    host_names: &[String],
) -> OrphanVerdict {
    let pid = match inspector.find_owning_pid(port) {
        Lookup::Found(pid) => pid,
        Lookup::Missing => {
            return OrphanVerdict::Orphaned {
                pid: None,
                reason: format!("no owning process resolvable for port {port}"),
            };
        }
        Lookup::Unknown(reason) => return OrphanVerdict::Uncertain { reason },
    };

    let parent = match inspector.parent_of(pid) {
        Lookup::Found(parent) => parent,
        Lookup::Missing => {
            return OrphanVerdict::Orphaned {
                pid: Some(pid),
                reason: format!("parent of pid {pid} cannot be resolved"),
            };
        }
        Lookup::Unknown(reason) => return OrphanVerdict::Uncertain { reason },
    };

    if host_names
        .iter()
        .any(|name| !name.is_empty() && parent.command.contains(name.as_str()))
    {
        OrphanVerdict::Healthy {
            pid,
            parent_command: parent.command,
        }
    } else {
        OrphanVerdict::Orphaned {
            pid: Some(pid),
            reason: format!(
                "parent {} ({}) of pid {pid} is not a host process",
                parent.ppid, parent.command
            ),
        }
    }
}

/// What `start` should do after probing the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPlan {
    /// Port free: try to spawn.
    Spawn,
    /// Port bound by someone else: share it.
    Share,
    /// Port bound by our own live child.
    AlreadyOwned,
}

pub fn plan_start(port_bound: bool, handle: HandleState) -> StartPlan {
    match (port_bound, handle) {
        (_, HandleState::Alive { .. }) => StartPlan::AlreadyOwned,
        (false, _) => StartPlan::Spawn,
        (true, _) => StartPlan::Share,
    }
}

/// Drift repair chosen by one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Steady state: our child is alive.
    None,
    /// Our child died after starting.
    RespawnCrashed { old_pid: u32 },
    /// Nobody serves the port.
    TakeOver,
    /// Someone else serves the port; classify before acting.
    CheckOrphan,
}

pub fn plan_repair(port_bound: bool, handle: HandleState) -> Repair {
    match (port_bound, handle) {
        (_, HandleState::Alive { .. }) => Repair::None,
        (_, HandleState::Exited { pid, .. }) => Repair::RespawnCrashed { old_pid: pid },
        (false, HandleState::Empty) => Repair::TakeOver,
        (true, HandleState::Empty) => Repair::CheckOrphan,
    }
}

/// Ownership derived from lifecycle and handle presence.
pub fn derive_ownership(running: bool, handle: HandleState) -> OwnershipState {
    match (running, handle) {
        (false, _) => OwnershipState::NotRunning,
        (true, HandleState::Alive { .. }) => OwnershipState::OwnedByThisInstance,
        (true, _) => OwnershipState::SharedFromOtherInstance,
    }
}
