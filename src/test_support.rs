//! Shared fixtures for unit tests: a shell stand-in for the proxy and a scripted inspector.

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::{ProxyConfig, Timings};
use crate::error::ProxyError;
use crate::inspect::{Lookup, ParentInfo, ProcessInspector};

const VERSION_BRANCH: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "Mitmproxy: 10.1.0 (stand-in)"
  exit 0
fi
"#;

const SERVE: &str = r#"echo "[BLOCKED] GET https://telemetry.example.com/v1/track"
exec sleep 30
"#;

pub fn fast_timings() -> Timings {
    Timings {
        reconcile_interval: Duration::from_millis(100),
        idle_check_interval: Duration::from_millis(100),
        startup_window: Duration::from_millis(300),
        race_retry_delay: Duration::from_millis(500),
        graceful_stop: Duration::from_secs(1),
        port_release_wait: Duration::from_millis(100),
        version_check_timeout: Duration::from_secs(5),
    }
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Signalable and not a zombie awaiting reaping.
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        // state follows the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| state != "Z"),
        Err(_) => true,
    }
}

pub fn kill_pid(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("kill child");
}

/// Temp dir holding an executable proxy stand-in, a blacklist and an addon file.
pub struct FakeProxy {
    dir: tempfile::TempDir,
    script: PathBuf,
}

impl FakeProxy {
    /// Starts, prints one blocked line, then idles.
    pub fn new() -> Self {
        Self::with_prelude("")
    }

    /// Exits 1 right away, like a proxy that lost the port.
    pub fn failing() -> Self {
        Self::with_prelude("echo \"error: address already in use\" >&2\nexit 1\n")
    }

    /// Ignores SIGTERM so termination has to escalate.
    pub fn ignoring_sigterm() -> Self {
        Self::with_prelude("trap '' TERM\n")
    }

    /// Only the first process to create `lock` keeps running; later ones exit 1.
    pub fn exclusive(lock: &Path) -> Self {
        Self::with_prelude(&format!(
            "mkdir \"{}\" 2>/dev/null || {{ echo \"address already in use\" >&2; exit 1; }}\n",
            lock.display()
        ))
    }

    /// Runs `prelude` after the version branch, then prints the blocked line and idles.
    /// A prelude that exits never reaches the idle part.
    pub fn with_prelude(prelude: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-mitmdump");
        fs::write(&script, format!("{VERSION_BRANCH}{prelude}{SERVE}")).expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        fs::write(dir.path().join("blacklist.json"), r#"{"patterns": []}"#).expect("blacklist");
        fs::write(dir.path().join("mitm_addon.py"), "").expect("addon");
        wait_until_executable(&script);
        Self { dir, script }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self, port: u16) -> ProxyConfig {
        ProxyConfig {
            port,
            executable_path: self.script.clone(),
            addon_script_path: self.dir.path().join("mitm_addon.py"),
            blacklist_path: self.dir.path().join("blacklist.json"),
            response_status: 204,
            response_body: String::new(),
            log_blocked: true,
            idle_timeout_minutes: 0,
        }
    }
}

/// A concurrent fork in another test thread can briefly hold the script's write fd open,
/// which makes exec fail with ETXTBSY. Wait that out.
fn wait_until_executable(script: &Path) {
    for _ in 0..50 {
        match std::process::Command::new(script).arg("--version").output() {
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32) => {
                std::thread::sleep(Duration::from_millis(20));
            }
            _ => return,
        }
    }
}

/// Inspector with scripted answers. `force_kill` releases the held listener, standing in
/// for the orphan's socket.
pub struct FakeInspector {
    owner: Mutex<Lookup<u32>>,
    parent: Mutex<Lookup<ParentInfo>>,
    held: Mutex<Option<TcpListener>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeInspector {
    pub fn new(owner: Lookup<u32>, parent: Lookup<ParentInfo>) -> Self {
        Self {
            owner: Mutex::new(owner),
            parent: Mutex::new(parent),
            held: Mutex::new(None),
            killed: Mutex::new(Vec::new()),
        }
    }

    /// Owner pid 4242 whose parent is the given command.
    pub fn with_parent(command: &str) -> Self {
        Self::new(
            Lookup::Found(4242),
            Lookup::Found(ParentInfo {
                ppid: 4241,
                command: command.to_string(),
            }),
        )
    }

    pub fn hold(&self, listener: TcpListener) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ProcessInspector for FakeInspector {
    fn find_owning_pid(&self, _port: u16) -> Lookup<u32> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn parent_of(&self, _pid: u32) -> Lookup<ParentInfo> {
        self.parent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn force_kill(&self, pid: u32) -> Result<(), ProxyError> {
        self.killed.lock().unwrap_or_else(PoisonError::into_inner).push(pid);
        self.held.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}
