use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;

/// Event bus size – small fixed size → zero heap growth.
pub const BUS_BOUND: usize = 128;

/// What happened to the shared proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// This instance spawned the proxy from `start`.
    Started { port: u16, pid: u32 },
    /// `start` found the port served by another instance.
    SharingProxy { port: u16 },
    /// Reconciliation found the port free and spawned a proxy.
    TookOverSharedProxy { port: u16, pid: u32 },
    /// Reconciliation killed an orphaned proxy and replaced it.
    TookOverOrphan { port: u16, killed_pid: Option<u32>, pid: u32 },
    RestartedAfterCrash { port: u16, old_pid: u32, pid: u32 },
    IdleShutdown { port: u16, idle_minutes: u64 },
    BlockedRequest { method: String, url: String },
    Stopped { port: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Bounded, non-blocking notification channel towards collaborators (UI, CLI log).
///
/// Receivers compete for events, so a bus is meant to have a single consumer. The bus needs
/// one: undrained, it holds [`BUS_BOUND`] events and drops everything after them.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<ProxyEvent>,
    rx: Receiver<ProxyEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded::<ProxyEvent>(BUS_BOUND);
        Self { tx, rx }
    }

    /// Publish without ever blocking the supervisor; a full bus drops the event.
    pub fn emit(&self, kind: EventKind) {
        let evt = ProxyEvent {
            ts: Utc::now(),
            kind,
        };
        match self.tx.try_send(evt) {
            Ok(()) => {}
            Err(TrySendError::Full(evt)) => {
                log::warn!("event bus full (no consumer draining it?), dropping {:?}", evt.kind);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn subscribe(&self) -> Receiver<ProxyEvent> {
        self.rx.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bus_drops_instead_of_blocking() {
        let bus = EventBus::new();
        for _ in 0..BUS_BOUND + 10 {
            bus.emit(EventKind::Stopped { port: Some(1) });
        }
        let rx = bus.subscribe();
        assert_eq!(rx.len(), BUS_BOUND);

        // a consumer that catches up gets new events again
        rx.try_iter().for_each(drop);
        bus.emit(EventKind::Stopped { port: Some(2) });
        assert_eq!(rx.try_recv().map(|e| e.kind), Ok(EventKind::Stopped { port: Some(2) }));
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let evt = ProxyEvent {
            ts: Utc::now(),
            kind: EventKind::BlockedRequest {
                method: "GET".into(),
                url: "https://example.com/a".into(),
            },
        };
        let json = serde_json::to_value(&evt).expect("serialize");
        assert_eq!(json["kind"], "blocked_request");
        assert_eq!(json["method"], "GET");
    }
}
