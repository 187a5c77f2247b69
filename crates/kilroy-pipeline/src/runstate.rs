//! Run-state snapshot: the on-disk view external tools (and `stop`) use to
//! decide what a run is doing.
//!
//! Three files under the logs root participate:
//! - `final.json` — terminal marker; always wins and suppresses the
//!   node/event fields from `live.json`
//! - `live.json` — last progress event
//! - `run.pid` — decimal PID of the owning run; a live PID with no
//!   `final.json` means Running

use std::path::Path;

use serde_json::Value;

use kilroy_types::{KilroyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Success,
    Fail,
    Canceled,
    /// live.json exists but the owning process is gone.
    Stale,
    Unknown,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Fail => "fail",
            RunState::Canceled => "canceled",
            RunState::Stale => "stale",
            RunState::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Fail | RunState::Canceled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunStateSnapshot {
    pub state: RunState,
    pub run_id: String,
    pub failure_reason: String,
    pub pid: i32,
    pub pid_alive: bool,
    pub current_node_id: String,
    pub last_event: String,
}

/// Load the snapshot from `logs_root`. Missing individual files are fine;
/// a missing logs root is an error.
pub fn load_snapshot(logs_root: &Path) -> Result<RunStateSnapshot> {
    if !logs_root.is_dir() {
        return Err(KilroyError::Other(format!(
            "logs root does not exist: {}",
            logs_root.display()
        )));
    }

    let mut snapshot = RunStateSnapshot {
        state: RunState::Unknown,
        run_id: String::new(),
        failure_reason: String::new(),
        pid: 0,
        pid_alive: false,
        current_node_id: String::new(),
        last_event: String::new(),
    };

    // run.pid: one line, decimal. Malformed content reads as "no pid".
    if let Ok(raw) = std::fs::read_to_string(logs_root.join("run.pid")) {
        if let Ok(pid) = raw.trim().parse::<i32>() {
            if pid > 0 {
                snapshot.pid = pid;
                snapshot.pid_alive = pid_running(pid);
            }
        }
    }

    // final.json wins outright.
    if let Ok(raw) = std::fs::read_to_string(logs_root.join("final.json")) {
        if let Ok(v) = serde_json::from_str::<Value>(&raw) {
            snapshot.state = match v.get("status").and_then(Value::as_str).unwrap_or("") {
                "success" => RunState::Success,
                "fail" => RunState::Fail,
                "canceled" => RunState::Canceled,
                _ => RunState::Fail,
            };
            snapshot.run_id = str_field(&v, "run_id");
            snapshot.failure_reason = str_field(&v, "failure_reason");
            return Ok(snapshot);
        }
    }

    // No terminal marker: live.json supplies the node/event fields.
    if let Ok(raw) = std::fs::read_to_string(logs_root.join("live.json")) {
        if let Ok(v) = serde_json::from_str::<Value>(&raw) {
            snapshot.last_event = str_field(&v, "event");
            snapshot.current_node_id = str_field(&v, "node_id");
            if snapshot.run_id.is_empty() {
                snapshot.run_id = str_field(&v, "run_id");
            }
            snapshot.state = RunState::Stale;
        }
    }

    if snapshot.pid_alive {
        snapshot.state = RunState::Running;
    }

    Ok(snapshot)
}

/// `null` JSON fields must not render as the string "null".
fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// True when the PID refers to a live, non-zombie process. Zombie and exited
/// processes are treated as dead.
pub fn pid_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if pid_zombie(pid) {
        return false;
    }
    // Signal 0 probes existence without delivering anything. EPERM still
    // means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn pid_zombie(pid: i32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(s) => s,
        Err(_) => return false,
    };
    // Field 3 follows the parenthesized comm, which may itself contain
    // parentheses; scan from the last ')'.
    match stat.rfind(')') {
        Some(close) if close + 2 < stat.len() => {
            let state = stat.as_bytes()[close + 2];
            state == b'Z' || state == b'X'
        }
        _ => false,
    }
}

/// Read the command line of a process from /proc as NUL-separated argv.
pub fn read_pid_cmdline(pid: i32) -> Result<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline"))?;
    Ok(raw
        .split(|b| *b == 0)
        .map(|part| String::from_utf8_lossy(part).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
