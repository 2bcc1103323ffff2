//! Unix process inspection using lsof and ps

use std::io::ErrorKind;
use std::process::Command;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{Lookup, ParentInfo, ProcessInspector};
use crate::error::ProxyError;

#[derive(Debug, Default, Clone, Copy)]
pub struct LsofInspector;

impl LsofInspector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Run a lookup tool and return its trimmed stdout.
///
/// lsof and ps both exit non-zero when nothing matches, so an empty stdout is `Missing`
/// regardless of status; only a failure to launch the tool is `Unknown`.
fn query(program: &str, args: &[&str]) -> Lookup<String> {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                Lookup::Missing
            } else {
                Lookup::Found(text)
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Lookup::Unknown(format!("{program} is not installed"))
        }
        Err(e) => Lookup::Unknown(format!("failed to execute {program}: {e}")),
    }
}

fn parse_pid(text: &str) -> Lookup<u32> {
    // lsof may list several pids (e.g. forked workers); the first is the listener's owner
    match text.lines().next().map(str::trim).map(str::parse::<u32>) {
        Some(Ok(pid)) => Lookup::Found(pid),
        Some(Err(e)) => Lookup::Unknown(format!("unparseable pid {text:?}: {e}")),
        None => Lookup::Missing,
    }
}

impl ProcessInspector for LsofInspector {
    fn find_owning_pid(&self, port: u16) -> Lookup<u32> {
        let filter = format!("-iTCP:{port}");
        match query("lsof", &["-nP", &filter, "-sTCP:LISTEN", "-t"]) {
            Lookup::Found(text) => parse_pid(&text),
            Lookup::Missing => Lookup::Missing,
            Lookup::Unknown(reason) => Lookup::Unknown(reason),
        }
    }

    fn parent_of(&self, pid: u32) -> Lookup<ParentInfo> {
        let pid_arg = pid.to_string();
        let ppid = match query("ps", &["-o", "ppid=", "-p", &pid_arg]) {
            Lookup::Found(text) => match parse_pid(&text) {
                Lookup::Found(ppid) => ppid,
                Lookup::Missing => return Lookup::Missing,
                Lookup::Unknown(reason) => return Lookup::Unknown(reason),
            },
            Lookup::Missing => return Lookup::Missing,
            Lookup::Unknown(reason) => return Lookup::Unknown(reason),
        };

        let ppid_arg = ppid.to_string();
        match query("ps", &["-o", "comm=", "-p", &ppid_arg]) {
            Lookup::Found(command) => Lookup::Found(ParentInfo { ppid, command }),
            Lookup::Missing => Lookup::Missing,
            Lookup::Unknown(reason) => Lookup::Unknown(reason),
        }
    }

    fn force_kill(&self, pid: u32) -> Result<(), ProxyError> {
        let raw = i32::try_from(pid)
            .map_err(|_| ProxyError::Io(std::io::Error::other(format!("pid {pid} out of range"))))?;
        match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            // already gone
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProxyError::Io(std::io::Error::from(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pid_takes_first_line() {
        assert_eq!(parse_pid("4242\n4243"), Lookup::Found(4242));
        assert_eq!(parse_pid(""), Lookup::Missing);
        assert!(matches!(parse_pid("abc"), Lookup::Unknown(_)));
    }

    #[test]
    fn missing_tool_is_unknown_not_missing() {
        let outcome = query("interceptd-no-such-tool", &[]);
        assert!(matches!(outcome, Lookup::Unknown(_)));
    }

    #[test]
    fn parent_of_current_process_resolves() {
        let inspector = LsofInspector::new();
        match inspector.parent_of(std::process::id()) {
            Lookup::Found(parent) => {
                assert_eq!(parent.ppid, std::os::unix::process::parent_id());
                assert!(!parent.command.is_empty());
            }
            // ps may be absent in minimal build images
            Lookup::Unknown(_) => {}
            Lookup::Missing => panic!("current process must have a parent"),
        }
    }

    #[test]
    fn force_kill_of_exited_pid_is_ok() {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait true");
        // reaped, so the pid is gone (barring immediate reuse)
        assert!(LsofInspector::new().force_kill(pid).is_ok());
    }
}
