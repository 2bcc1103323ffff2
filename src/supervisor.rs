//! Spawns, streams and terminates the single proxy child owned by an instance.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::{ProxyConfig, Timings};
use crate::error::ProxyError;
use crate::events::{EventBus, EventKind};
use crate::idle::ActivityTracker;
use crate::state::{ProcState, ProxyStatus};

/// Log target for forwarded child output.
pub const PROXY_LOG_TARGET: &str = "proxy";

/// How often the monitor polls the child for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on the wait after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

static BLOCKED_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\[BLOCKED\]\s+(\w+)\s+(.+)"));

/// Extract `(method, url)` from an addon `[BLOCKED] <METHOD> <URL>` line.
pub fn parse_blocked(line: &str) -> Option<(String, String)> {
    let re = BLOCKED_RE.as_ref().ok()?;
    let caps = re.captures(line)?;
    Some((caps[1].to_string(), caps[2].trim().to_string()))
}

/// Next output line, decoded lossily; `None` at EOF or on a read error.
///
/// Proxy output is not guaranteed UTF-8. Stopping at an undecodable line would close the pipe
/// under a live child.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => {
            let text = String::from_utf8_lossy(buf);
            Some(text.trim_end_matches(['\n', '\r']).to_string())
        }
        Err(e) => {
            log::debug!("Proxy output stream error: {e}");
            None
        }
    }
}

/// Observable state of the supervisor's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Empty,
    Alive { pid: u32 },
    /// The owned child died after it was started; nothing has replaced it yet.
    Exited { pid: u32, code: Option<i32> },
}

struct ProcessHandle {
    pid: u32,
    process: Arc<Mutex<Option<Child>>>, // Shared ownership with monitor via Arc
    state_tx: Arc<watch::Sender<ProcState>>,
    state_rx: watch::Receiver<ProcState>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    fn abort_tasks(&mut self) {
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

enum Slot {
    Empty,
    Live(ProcessHandle),
    Exited { pid: u32, code: Option<i32> },
}

pub struct ProcessSupervisor {
    slot: Slot,
    activity: ActivityTracker,
    events: EventBus,
    timings: Timings,
    /// Status snapshot the exit monitor clears the owned pid from.
    status: Option<Arc<watch::Sender<ProxyStatus>>>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(activity: ActivityTracker, events: EventBus, timings: Timings) -> Self {
        Self {
            slot: Slot::Empty,
            activity,
            events,
            timings,
            status: None,
        }
    }

    /// Have the exit monitor drop the child's pid from `status` the moment it dies.
    #[must_use]
    pub fn publish_exits_to(mut self, status: Arc<watch::Sender<ProxyStatus>>) -> Self {
        self.status = Some(status);
        self
    }

    /// Fold an exit observed by the monitor into the slot and report the result.
    pub fn refresh(&mut self) -> HandleState {
        if let Slot::Live(handle) = &mut self.slot {
            let state = *handle.state_rx.borrow();
            if let ProcState::Exited { code } = state {
                let pid = handle.pid;
                // forwarders stay detached and drain the dead child's last output to EOF
                if let Some(monitor) = handle.monitor_handle.take() {
                    monitor.abort();
                }
                self.slot = Slot::Exited { pid, code };
            }
        }
        match &self.slot {
            Slot::Empty => HandleState::Empty,
            Slot::Live(handle) => HandleState::Alive { pid: handle.pid },
            Slot::Exited { pid, code } => HandleState::Exited {
                pid: *pid,
                code: *code,
            },
        }
    }

    /// Pid of the live owned child, if any.
    pub fn live_pid(&self) -> Option<u32> {
        match &self.slot {
            Slot::Live(handle) if !handle.state_rx.borrow().is_exited() => Some(handle.pid),
            _ => None,
        }
    }

    /// Start the proxy. `Ok(pid)` once the child survived the startup window.
    pub async fn spawn(&mut self, config: &ProxyConfig) -> Result<u32, ProxyError> {
        if let HandleState::Alive { pid } = self.refresh() {
            log::debug!("Proxy already owned (PID: {pid}), not spawning again");
            return Ok(pid);
        }

        config.validate()?;
        let version =
            check_version(&config.executable_path, self.timings.version_check_timeout).await?;
        log::debug!("Proxy executable {}: {version}", config.executable_path.display());

        log::info!("Starting proxy on port {}...", config.port);

        let mut cmd = Command::new(&config.executable_path);
        cmd.args(config.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped()) // Capture stdout for forwarding
            .stderr(Stdio::piped()) // Capture stderr for forwarding
            .kill_on_drop(true);

        // PDEATHSIG follows the spawning thread; spawns run on runtime worker threads, which
        // live as long as the runtime itself.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            path: config.executable_path.clone(),
            source,
        })?;

        let Some(pid) = child.id() else {
            return Err(ProxyError::SpawnRace {
                port: config.port,
                code: None,
            });
        };
        log::info!("Proxy spawned (PID: {pid})");

        // Extract stdout/stderr BEFORE spawning monitor (ownership!)
        let stdout_task = child.stdout.take().map(|stdout| {
            let activity = self.activity.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut reader = tokio::io::BufReader::new(stdout);
                let mut buf = Vec::new();
                while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
                    activity.touch();
                    log::info!(target: PROXY_LOG_TARGET, "{line}");
                    if let Some((method, url)) = parse_blocked(&line) {
                        log::info!(target: PROXY_LOG_TARGET, "BLOCKED: {method} {url}");
                        events.emit(EventKind::BlockedRequest { method, url });
                    }
                }
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut reader = tokio::io::BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
                    log::warn!(target: PROXY_LOG_TARGET, "{line}");
                }
            })
        });

        let (state_tx, state_rx) = watch::channel(ProcState::Starting);
        let state_tx = Arc::new(state_tx);
        let child_arc = Arc::new(Mutex::new(Some(child)));
        let monitor_handle = tokio::spawn(monitor_process(
            pid,
            Arc::downgrade(&child_arc),
            state_tx.clone(),
            self.status.clone(),
        ));

        let mut handle = ProcessHandle {
            pid,
            process: child_arc,
            state_tx,
            state_rx,
            stdout_task,
            stderr_task,
            monitor_handle: Some(monitor_handle),
        };

        // Liveness heuristic: alive at the end of the window counts as started. This is not
        // a handshake with the child.
        let mut rx = handle.state_rx.clone();
        let exited = async { rx.wait_for(ProcState::is_exited).await.map(|state| *state) };
        match tokio::time::timeout(self.timings.startup_window, exited).await {
            Err(_) => {
                handle.state_tx.send_if_modified(|state| {
                    if *state == ProcState::Starting {
                        *state = ProcState::Running;
                        true
                    } else {
                        false
                    }
                });
                log::info!("✓ Proxy started successfully (PID: {pid})");
                self.slot = Slot::Live(handle);
                Ok(pid)
            }
            Ok(result) => {
                let code = match result {
                    Ok(ProcState::Exited { code }) => code,
                    _ => None,
                };
                // stderr usually carries the bind error; let the forwarder drain it
                if let Some(task) = handle.stderr_task.take() {
                    let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
                }
                handle.abort_tasks();
                log::warn!(
                    "✗ Proxy failed to start (exit code {code:?}, likely port {} conflict)",
                    config.port
                );
                self.slot = Slot::Empty;
                Err(ProxyError::SpawnRace {
                    port: config.port,
                    code,
                })
            }
        }
    }

    /// Graceful termination, escalating to a forced kill after the grace period.
    ///
    /// The slot is always empty afterwards, whichever path completed the wait.
    pub async fn terminate(&mut self) -> Result<(), ProxyError> {
        let Slot::Live(mut handle) = std::mem::replace(&mut self.slot, Slot::Empty) else {
            return Ok(());
        };

        // Taking the child out stops the monitor from touching it.
        let child = handle.process.lock().await.take();
        let result = match child {
            Some(child) => {
                shutdown_child(handle.pid, child, self.timings.graceful_stop).await
            }
            None => Ok(()),
        };
        handle.abort_tasks();
        result
    }

    /// Synchronous best-effort kill for teardown paths that cannot await.
    pub fn kill_now(&mut self) {
        let Slot::Live(mut handle) = std::mem::replace(&mut self.slot, Slot::Empty) else {
            return;
        };
        match handle.process.try_lock() {
            Ok(mut guard) => {
                if let Some(mut child) = guard.take() {
                    log::warn!("Force-killing owned proxy (PID: {}) during teardown", handle.pid);
                    if let Err(e) = child.start_kill() {
                        log::error!("Failed to kill proxy (PID: {}): {e}", handle.pid);
                    }
                }
            }
            Err(_) => {
                // monitor holds the lock for a single try_wait; signal by pid instead
                #[cfg(unix)]
                {
                    use nix::sys::signal::{self, Signal};
                    use nix::unistd::Pid;
                    if let Ok(raw) = i32::try_from(handle.pid) {
                        let _ = signal::kill(Pid::from_raw(raw), Signal::SIGKILL);
                    }
                }
            }
        }
        handle.abort_tasks();
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.kill_now();
    }
}

/// Run `<executable> --version` with a deadline.
async fn check_version(path: &Path, timeout: Duration) -> Result<String, ProxyError> {
    let unavailable = |reason: String| ProxyError::ExecutableUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let mut cmd = Command::new(path);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => Err(unavailable(format!("version check timed out after {timeout:?}"))),
        Ok(Err(e)) => Err(unavailable(e.to_string())),
        Ok(Ok(output)) if !output.status.success() => {
            Err(unavailable(format!("--version exited with {}", output.status)))
        }
        Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()),
    }
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn shutdown_child(pid: u32, mut child: Child, grace: Duration) -> Result<(), ProxyError> {
    if let Ok(Some(status)) = child.try_wait() {
        log::debug!("Proxy (PID: {pid}) already exited: {status}");
        return Ok(());
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                log::warn!("Failed SIGTERM to proxy: {e}");
            } else {
                log::info!("Sent SIGTERM to proxy (PID: {pid})");
            }
        }
    }

    #[cfg(windows)]
    {
        use windows::Win32::System::Console::{CTRL_C_EVENT, GenerateConsoleCtrlEvent};

        // SAFETY: Windows API - sending console control event to child process
        let graceful_attempt = unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid) };
        if let Err(e) = graceful_attempt {
            log::warn!("Failed to send CTRL_C_EVENT to proxy (PID: {pid}): {e:?}");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            log::info!("Proxy exited gracefully: {status}");
            return Ok(());
        }
        Ok(Err(e)) => {
            log::warn!("Graceful wait error for proxy: {e}");
        }
        Err(_) => {
            log::warn!("Proxy (PID: {pid}) ignored termination for {grace:?}, escalating to SIGKILL");
        }
    }

    child.start_kill()?;
    log::warn!("Sent SIGKILL to proxy (PID: {pid})");

    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => {
            log::info!("Proxy terminated by SIGKILL: {status}");
            Ok(())
        }
        Ok(Err(e)) => Err(ProxyError::Io(e)),
        Err(_) => Err(ProxyError::Io(std::io::Error::other(format!(
            "proxy did not respond to SIGKILL after {KILL_WAIT:?} (PID: {pid})"
        )))),
    }
}

/// Watches the child for exit and invalidates the handle when it happens.
///
/// Exits when:
/// - the process exits (the child is dropped, `Exited` published, the pid cleared from status)
/// - the Arc is dropped or the child taken (termination in progress)
/// - `try_wait` fails
async fn monitor_process(
    pid: u32,
    child_weak: Weak<Mutex<Option<Child>>>,
    state_tx: Arc<watch::Sender<ProcState>>,
    status_tx: Option<Arc<watch::Sender<ProxyStatus>>>,
) {
    let code = loop {
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;

        let Some(child_arc) = child_weak.upgrade() else {
            return;
        };
        let mut child_guard = child_arc.lock().await;
        let Some(child) = child_guard.as_mut() else {
            log::debug!("Proxy monitor exiting: child taken");
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                log::warn!("Proxy (PID: {pid}) exited: {status}");
                child_guard.take();
                break status.code();
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Proxy (PID: {pid}) status check error: {e}");
                child_guard.take();
                break None;
            }
        }
    };

    let _ = state_tx.send(ProcState::Exited { code });
    if let Some(status_tx) = status_tx {
        status_tx.send_if_modified(|status| {
            if status.pid == Some(pid) {
                status.pid = None;
                true
            } else {
                false
            }
        });
    }
}
