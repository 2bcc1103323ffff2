use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, error, info, trace, warn};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::arbiter::{
    OrphanVerdict, Repair, StartPlan, classify_orphan, derive_ownership, plan_repair, plan_start,
};
use crate::config::{ProxyConfig, Timings};
use crate::error::ProxyError;
use crate::events::{EventBus, EventKind, ProxyEvent};
use crate::idle::{self, ActivityTracker, IdleDecision};
use crate::inspect::{PlatformInspector, ProcessInspector};
use crate::port;
use crate::state::{Lifecycle, OwnershipState, ProxyStatus};
use crate::supervisor::ProcessSupervisor;
use crate::system_proxy::{MemoryProxySettings, SystemProxyConfigurator};

/// Mutable per-instance state. Held across a whole lifecycle transition or tick.
struct Session {
    lifecycle: Lifecycle,
    /// Config of the running session.
    config: Option<ProxyConfig>,
    /// Survives `stop` so `restart` can reuse it.
    last_config: Option<ProxyConfig>,
    supervisor: ProcessSupervisor,
}

/// Detached reconciliation and idle tasks. Both exit once `token` is cancelled.
struct Loops {
    token: CancellationToken,
}

struct Inner {
    session: Mutex<Session>,
    loops: std::sync::Mutex<Option<Loops>>,
    status_tx: Arc<watch::Sender<ProxyStatus>>,
    inspector: Arc<dyn ProcessInspector>,
    configurator: Arc<dyn SystemProxyConfigurator>,
    events: EventBus,
    activity: ActivityTracker,
    host_names: Vec<String>,
    timings: Timings,
}

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A lifecycle transition held the session; nothing was done.
    Skipped,
    Steady,
    Repaired,
    Failed,
}

/// Supervises the shared proxy for one instance: start/stop/restart plus the periodic
/// reconciliation and idle loops.
///
/// Cheap to clone; all clones drive the same instance. Dropping the last clone kills an
/// owned child and clears proxy indirection synchronously.
#[derive(Clone)]
pub struct ProxyManager {
    inner: Arc<Inner>,
}

pub struct ProxyManagerBuilder {
    inspector: Option<Arc<dyn ProcessInspector>>,
    configurator: Option<Arc<dyn SystemProxyConfigurator>>,
    host_names: Vec<String>,
    timings: Timings,
    events: Option<EventBus>,
}

impl ProxyManagerBuilder {
    pub fn inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn configurator(mut self, configurator: Arc<dyn SystemProxyConfigurator>) -> Self {
        self.configurator = Some(configurator);
        self
    }

    /// Parent command names that mark a proxy as supervised by a live host.
    pub fn host_process_names(mut self, names: Vec<String>) -> Self {
        self.host_names = names;
        self
    }

    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> ProxyManager {
        let events = self.events.unwrap_or_default();
        let activity = ActivityTracker::new();
        let (status_tx, _) = watch::channel(ProxyStatus::default());
        let status_tx = Arc::new(status_tx);
        let supervisor = ProcessSupervisor::new(activity.clone(), events.clone(), self.timings)
            .publish_exits_to(status_tx.clone());
        ProxyManager {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    lifecycle: Lifecycle::Stopped,
                    config: None,
                    last_config: None,
                    supervisor,
                }),
                loops: std::sync::Mutex::new(None),
                status_tx,
                inspector: self
                    .inspector
                    .unwrap_or_else(|| Arc::new(PlatformInspector::new())),
                configurator: self
                    .configurator
                    .unwrap_or_else(|| Arc::new(MemoryProxySettings::new())),
                events,
                activity,
                host_names: self.host_names,
                timings: self.timings,
            }),
        }
    }
}

impl ProxyManager {
    pub fn builder() -> ProxyManagerBuilder {
        ProxyManagerBuilder {
            inspector: None,
            configurator: None,
            host_names: vec!["Electron".into(), "Code".into(), "node".into()],
            timings: Timings::default(),
            events: None,
        }
    }

    /// Start or join the shared proxy on `config.port`.
    ///
    /// Idempotent for the port already running. A different port restarts the session.
    pub async fn start(&self, config: ProxyConfig) -> Result<OwnershipState, ProxyError> {
        let mut session = self.inner.session.lock().await;

        if session.lifecycle.is_running() {
            let same_port = session.config.as_ref().map(|c| c.port) == Some(config.port);
            if same_port {
                let state = derive_ownership(true, session.supervisor.refresh());
                debug!("Proxy already running on port {} ({state:?})", config.port);
                return Ok(state);
            }
            info!("Port changed to {}, restarting proxy session", config.port);
            self.inner.cancel_loops();
            self.inner.stop_locked(&mut session).await;
        }

        let result = self.start_locked(&mut session, config).await;
        self.inner.publish(&session);
        result
    }

    async fn start_locked(
        &self,
        session: &mut Session,
        config: ProxyConfig,
    ) -> Result<OwnershipState, ProxyError> {
        session.last_config = Some(config.clone());

        info!("Checking if proxy is already running on port {}...", config.port);
        let bound = port::is_port_bound(config.port);

        match plan_start(bound, session.supervisor.refresh()) {
            StartPlan::AlreadyOwned => {
                self.begin_session(session, config);
                Ok(OwnershipState::OwnedByThisInstance)
            }
            StartPlan::Share => self.join_shared(session, config),
            StartPlan::Spawn => {
                info!("Port {} is free, attempting to start proxy...", config.port);
                match session.supervisor.spawn(&config).await {
                    Ok(pid) => {
                        self.inner.point_indirection(config.port);
                        info!("✓ This instance now owns the proxy (PID: {pid})");
                        self.inner.events.emit(EventKind::Started {
                            port: config.port,
                            pid,
                        });
                        self.begin_session(session, config);
                        Ok(OwnershipState::OwnedByThisInstance)
                    }
                    Err(e) if e.is_retryable() => {
                        warn!("Failed to start ({e}), checking if another instance succeeded...");
                        tokio::time::sleep(self.inner.timings.race_retry_delay).await;
                        if port::is_port_bound(config.port) {
                            info!("✓ Another instance started the proxy (race resolved)");
                            self.join_shared(session, config)
                        } else {
                            error!("✗ Failed to start proxy on port {}", config.port);
                            Err(e)
                        }
                    }
                    Err(e) => {
                        error!("✗ Failed to start proxy: {e}");
                        Err(e)
                    }
                }
            }
        }
    }

    fn join_shared(
        &self,
        session: &mut Session,
        config: ProxyConfig,
    ) -> Result<OwnershipState, ProxyError> {
        let port = config.port;
        info!("✓ Proxy is already running on port {port}, using shared proxy");
        match self.inner.configurator.current() {
            Ok(current) if current.targets_port(port) => {
                debug!("Proxy indirection already targets port {port}");
            }
            Ok(_) => self.inner.point_indirection(port),
            Err(e) => {
                warn!("Could not read proxy settings ({e}), overwriting");
                self.inner.point_indirection(port);
            }
        }
        self.inner.events.emit(EventKind::SharingProxy { port });
        self.begin_session(session, config);
        Ok(OwnershipState::SharedFromOtherInstance)
    }

    /// Mark the session running and (re)start the periodic loops.
    fn begin_session(&self, session: &mut Session, config: ProxyConfig) {
        self.inner.cancel_loops();

        let token = CancellationToken::new();
        let weak = Arc::downgrade(&self.inner);
        info!(
            "Starting health check (polls every {:?})",
            self.inner.timings.reconcile_interval
        );
        tokio::spawn(reconcile_loop(
            weak.clone(),
            token.clone(),
            self.inner.timings.reconcile_interval,
        ));
        if config.idle_timeout_minutes > 0 {
            info!(
                "Starting idle monitoring (timeout: {} minutes)",
                config.idle_timeout_minutes
            );
            tokio::spawn(idle_loop(
                weak,
                token.clone(),
                self.inner.timings.idle_check_interval,
                config.idle_timeout_minutes,
            ));
        }

        *self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner) = Some(Loops { token });
        session.config = Some(config);
        session.lifecycle = Lifecycle::Running;
    }

    /// Stop loops, clear indirection, terminate an owned child. Always ends `NotRunning`.
    pub async fn stop(&self) {
        // loops first so no tick resurrects what is being stopped
        self.inner.cancel_loops();
        let mut session = self.inner.session.lock().await;
        self.inner.stop_locked(&mut session).await;
        self.inner.publish(&session);
    }

    /// `stop` then `start` with the last configuration.
    pub async fn restart(&self) -> Result<OwnershipState, ProxyError> {
        let config = self
            .inner
            .session
            .lock()
            .await
            .last_config
            .clone()
            .ok_or(ProxyError::NoPriorConfig)?;
        self.stop().await;
        self.start(config).await
    }

    /// Restart so the addon re-reads its blacklist.
    pub async fn reload_blacklist(&self) -> Result<OwnershipState, ProxyError> {
        if !self.status().running {
            return Err(ProxyError::NotRunning);
        }
        info!("Reloading blacklist...");
        self.restart().await
    }

    pub fn status(&self) -> ProxyStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProxyStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn ownership(&self) -> OwnershipState {
        self.status().ownership()
    }

    pub fn owns_proxy(&self) -> bool {
        self.ownership() == OwnershipState::OwnedByThisInstance
    }

    pub fn is_using_shared_proxy(&self) -> bool {
        self.ownership() == OwnershipState::SharedFromOtherInstance
    }

    /// Lifecycle and blocked-request events. Drain it: an undrained bus fills up and drops
    /// later events.
    pub fn events(&self) -> Receiver<ProxyEvent> {
        self.inner.events.subscribe()
    }

    /// Run one reconciliation pass now, as the periodic loop would.
    pub async fn reconcile_now(&self) -> TickOutcome {
        let token = self
            .inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.token.clone());
        match token {
            Some(token) => self.inner.reconcile_tick(&token).await,
            None => TickOutcome::Skipped,
        }
    }

    /// Synchronous teardown for exit paths that cannot await: kill an owned child and
    /// clear indirection. Best effort.
    pub fn shutdown_blocking(&self) {
        self.inner.cancel_loops();
        match self.inner.session.try_lock() {
            Ok(mut session) => {
                session.supervisor.kill_now();
                session.lifecycle = Lifecycle::Stopped;
                session.config = None;
                self.inner.publish(&session);
            }
            Err(_) => {
                warn!("Lifecycle transition in flight during teardown; relying on kill-on-drop");
            }
        }
        if let Err(e) = self.inner.configurator.clear() {
            error!("Failed to clear proxy settings during teardown: {e}");
        }
    }
}

impl Inner {
    fn cancel_loops(&self) {
        if let Some(loops) = self.loops.lock().unwrap_or_else(PoisonError::into_inner).take() {
            loops.token.cancel();
            info!("Stopped health check and idle monitoring");
        }
    }

    fn publish(&self, session: &Session) {
        let running = session.lifecycle.is_running();
        self.status_tx.send_replace(ProxyStatus {
            running,
            port: session.config.as_ref().filter(|_| running).map(|c| c.port),
            pid: session.supervisor.live_pid().filter(|_| running),
        });
    }

    fn point_indirection(&self, port: u16) {
        let url = port::proxy_url(port);
        match self.configurator.point_at(&url) {
            Ok(()) => info!("Configured proxy indirection: {url}"),
            Err(e) => error!("Failed to configure proxy indirection {url}: {e}"),
        }
    }

    async fn stop_locked(&self, session: &mut Session) {
        self.cancel_loops();

        match self.configurator.clear() {
            Ok(()) => info!("Cleared proxy settings"),
            Err(e) => error!("Failed to clear proxy settings: {e}"),
        }

        if session.supervisor.live_pid().is_some() {
            info!("Stopping proxy process (owned by this instance)...");
            if let Err(e) = session.supervisor.terminate().await {
                error!("Error stopping proxy: {e}");
            }
            info!("Proxy stopped; other instances will take over if needed");
        } else {
            // drops a crashed handle as well
            let _ = session.supervisor.terminate().await;
            debug!("Not owning proxy, just cleared settings");
        }

        let was_running = session.lifecycle.is_running();
        let port = session.config.take().map(|c| c.port);
        session.lifecycle = Lifecycle::Stopped;
        if was_running {
            self.events.emit(EventKind::Stopped { port });
        }
    }

    async fn reconcile_tick(&self, token: &CancellationToken) -> TickOutcome {
        let Ok(mut session) = self.session.try_lock() else {
            debug!("Lifecycle transition in flight, skipping health check");
            return TickOutcome::Skipped;
        };
        if token.is_cancelled() || !session.lifecycle.is_running() {
            return TickOutcome::Skipped;
        }

        let outcome = match self.repair(&mut session).await {
            Ok(true) => TickOutcome::Repaired,
            Ok(false) => TickOutcome::Steady,
            Err(e) => {
                error!("Health check error: {e}");
                TickOutcome::Failed
            }
        };
        self.publish(&session);
        outcome
    }

    /// Returns whether a repair was performed.
    async fn repair(&self, session: &mut Session) -> Result<bool, ProxyError> {
        let Some(config) = session.config.clone() else {
            return Ok(false);
        };
        let port = config.port;
        let bound = port::is_port_bound(port);

        match plan_repair(bound, session.supervisor.refresh()) {
            Repair::None => {
                trace!("Health check: proxy on port {port} OK");
                Ok(false)
            }
            Repair::RespawnCrashed { old_pid } => {
                warn!(
                    "Health check: {}, restarting...",
                    ProxyError::ProcessCrashed {
                        pid: old_pid,
                        code: None,
                    }
                );
                let pid = session.supervisor.spawn(&config).await?;
                self.events.emit(EventKind::RestartedAfterCrash {
                    port,
                    old_pid,
                    pid,
                });
                Ok(true)
            }
            Repair::TakeOver => {
                warn!("Health check: proxy not running! This instance is taking over ownership");
                let pid = session.supervisor.spawn(&config).await?;
                info!("✓ This instance now owns the proxy (PID: {pid})");
                self.events.emit(EventKind::TookOverSharedProxy { port, pid });
                Ok(true)
            }
            Repair::CheckOrphan => {
                let inspector = self.inspector.clone();
                let names = self.host_names.clone();
                let verdict = tokio::task::spawn_blocking(move || {
                    classify_orphan(inspector.as_ref(), port, &names)
                })
                .await
                .map_err(|e| ProxyError::Io(std::io::Error::other(e)))?;

                match verdict {
                    OrphanVerdict::Orphaned { pid, reason } => {
                        self.take_over_orphan(session, &config, pid, &reason).await?;
                        Ok(true)
                    }
                    OrphanVerdict::Healthy {
                        pid,
                        parent_command,
                    } => {
                        trace!("Shared proxy (PID: {pid}) is supervised by {parent_command}");
                        Ok(false)
                    }
                    OrphanVerdict::Uncertain { reason } => {
                        debug!(
                            "{}; leaving shared proxy alone",
                            ProxyError::OrphanDetectionUncertain(reason)
                        );
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn take_over_orphan(
        &self,
        session: &mut Session,
        config: &ProxyConfig,
        orphan_pid: Option<u32>,
        reason: &str,
    ) -> Result<(), ProxyError> {
        let port = config.port;
        match orphan_pid {
            Some(pid) => {
                warn!("Health check: killing orphaned proxy (PID: {pid}) on port {port}: {reason}");
                self.inspector.force_kill(pid)?;
            }
            None => {
                warn!("Health check: orphaned proxy on port {port} has no resolvable pid: {reason}");
            }
        }

        tokio::time::sleep(self.timings.port_release_wait).await;

        let pid = session.supervisor.spawn(config).await?;
        info!("✓ Killed orphaned proxy and took ownership (PID: {pid})");
        self.events.emit(EventKind::TookOverOrphan {
            port,
            killed_pid: orphan_pid,
            pid,
        });
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(loops) = self.loops.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            loops.token.cancel();
        }
        let session = self.session.get_mut();
        if session.lifecycle.is_running() {
            session.supervisor.kill_now();
            if let Err(e) = self.configurator.clear() {
                error!("Failed to clear proxy settings during teardown: {e}");
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    // an overrunning tick is skipped, never queued
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn reconcile_loop(inner: Weak<Inner>, token: CancellationToken, period: Duration) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.reconcile_tick(&token).await;
    }
    debug!("Reconciliation loop exited");
}

async fn idle_loop(
    inner: Weak<Inner>,
    token: CancellationToken,
    period: Duration,
    timeout_minutes: u32,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let status = *inner.status_tx.borrow();
        let owns = status.ownership() == OwnershipState::OwnedByThisInstance;
        match idle::evaluate(inner.activity.idle_for(), timeout_minutes, owns) {
            IdleDecision::KeepRunning => {}
            IdleDecision::NotOwner => {
                trace!("Idle timeout reached but proxy is shared; not stopping");
            }
            IdleDecision::Shutdown { idle_minutes } => {
                warn!(
                    "Idle timeout reached ({idle_minutes} minutes of inactivity), stopping proxy (PID: {:?})",
                    status.pid
                );
                let manager = ProxyManager { inner };
                manager.stop().await;
                manager.inner.events.emit(EventKind::IdleShutdown {
                    port: status.port.unwrap_or_default(),
                    idle_minutes,
                });
                break;
            }
        }
    }
    debug!("Idle monitor exited");
}
