//! Lifecycle and ownership states shared across the supervisor.

use serde::Serialize;

/// State of one spawned child as published by its monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Spawned, liveness window not yet elapsed.
    Starting,
    Running,
    /// Exit observed; `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },
}

impl ProcState {
    #[inline]
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcState::Exited { .. })
    }
}

/// Explicit lifecycle of a manager. Periodic loops only exist while `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Stopped,
    Running,
}

impl Lifecycle {
    #[inline]
    pub fn is_running(&self) -> bool {
        *self == Lifecycle::Running
    }
}

/// Derived ownership of the shared proxy, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipState {
    NotRunning,
    /// This instance spawned the proxy and holds a live handle to it.
    OwnedByThisInstance,
    /// Another process serves the port; this instance only points at it.
    SharedFromOtherInstance,
}

/// Read-only snapshot handed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: Option<u16>,
    /// Set only while this instance owns the proxy.
    pub pid: Option<u32>,
}

impl ProxyStatus {
    pub fn ownership(&self) -> OwnershipState {
        match (self.running, self.pid) {
            (false, _) => OwnershipState::NotRunning,
            (true, Some(_)) => OwnershipState::OwnedByThisInstance,
            (true, None) => OwnershipState::SharedFromOtherInstance,
        }
    }
}
