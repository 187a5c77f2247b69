//! `kilroy attractor stop`: signal a running engine without ever killing an
//! unrelated process.
//!
//! Safety protocol, in order:
//! 1. The run-state snapshot must report Running (terminal states refuse).
//! 2. The PID file must name a live, non-zombie process.
//! 3. The process's command line must be an `attractor run` / `attractor
//!    resume` invocation.
//! 4. The command line must agree on `--logs-root` (canonicalized) or,
//!    failing that, on `--run-id`.
//! 5. SIGTERM, wait up to the grace window with adaptive polling; with
//!    `--force`, escalate to SIGKILL and wait `max(grace, 1s)` more.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use kilroy_pipeline::runstate::{load_snapshot, pid_running, read_pid_cmdline, RunState};

pub struct StopArgs {
    pub logs_root: std::path::PathBuf,
    pub grace: Duration,
    pub force: bool,
}

/// Execute the stop protocol. Returns the process exit code; diagnostics go
/// to `stderr`, `pid=`/`stopped=` lines to `stdout`.
pub fn run_stop(args: &StopArgs, stdout: &mut dyn Write, stderr: &mut dyn Write) -> i32 {
    let snapshot = match load_snapshot(&args.logs_root) {
        Ok(s) => s,
        Err(e) => {
            let _ = writeln!(stderr, "{e}");
            return 1;
        }
    };

    if snapshot.state != RunState::Running {
        let _ = writeln!(
            stderr,
            "run state is {:?} (expected {:?}); refusing to stop",
            snapshot.state.as_str(),
            RunState::Running.as_str()
        );
        return 1;
    }
    if snapshot.pid <= 0 {
        let _ = writeln!(stderr, "run pid is not available (run.pid missing or invalid)");
        return 1;
    }
    if !snapshot.pid_alive {
        let _ = writeln!(stderr, "pid {} is not running", snapshot.pid);
        return 1;
    }
    if let Err(reason) = verify_attractor_run_pid(snapshot.pid, &args.logs_root, &snapshot.run_id) {
        let _ = writeln!(stderr, "{reason}");
        return 1;
    }

    if let Err(e) = send_signal(snapshot.pid, libc::SIGTERM) {
        let _ = writeln!(stderr, "send SIGTERM to pid {}: {e}", snapshot.pid);
        return 1;
    }

    if wait_for_pid_exit(snapshot.pid, args.grace) {
        let _ = writeln!(stdout, "pid={}", snapshot.pid);
        let _ = writeln!(stdout, "stopped=graceful");
        return 0;
    }

    if !args.force {
        let _ = writeln!(
            stderr,
            "pid {} did not exit within {}ms",
            snapshot.pid,
            args.grace.as_millis()
        );
        return 1;
    }

    if let Err(e) = send_signal(snapshot.pid, libc::SIGKILL) {
        let _ = writeln!(stderr, "send SIGKILL to pid {}: {e}", snapshot.pid);
        return 1;
    }
    let force_wait = args.grace.max(Duration::from_secs(1));
    if !wait_for_pid_exit(snapshot.pid, force_wait) {
        let _ = writeln!(stderr, "pid {} did not exit after SIGKILL", snapshot.pid);
        return 1;
    }
    let _ = writeln!(stdout, "pid={}", snapshot.pid);
    let _ = writeln!(stdout, "stopped=forced");
    0
}

fn send_signal(pid: i32, signal: i32) -> Result<(), std::io::Error> {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Already gone is a success for our purposes.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

fn wait_for_pid_exit(pid: i32, grace: Duration) -> bool {
    if !pid_running(pid) {
        return true;
    }
    let deadline = Instant::now() + grace;
    let poll = adaptive_grace_poll(grace);
    while Instant::now() < deadline {
        std::thread::sleep(poll);
        if !pid_running(pid) {
            return true;
        }
    }
    !pid_running(pid)
}

/// Poll interval for the graceful wait: `grace / 5`, clamped to
/// [10ms, 100ms].
pub fn adaptive_grace_poll(grace: Duration) -> Duration {
    let poll = grace / 5;
    poll.clamp(Duration::from_millis(10), Duration::from_millis(100))
}

/// Refuse unless the process identifies itself as an attractor run/resume
/// over the same logs root (canonicalized) or run ID.
pub fn verify_attractor_run_pid(pid: i32, logs_root: &Path, run_id: &str) -> Result<(), String> {
    let args = read_pid_cmdline(pid).map_err(|e| {
        format!("refusing to signal pid {pid}: cannot read process command line: {e}")
    })?;
    if args.is_empty() {
        return Err(format!("refusing to signal pid {pid}: empty process command line"));
    }

    let attractor_idx = args.iter().position(|a| a.trim() == "attractor");
    let Some(attractor_idx) = attractor_idx else {
        return Err(format!(
            "refusing to signal pid {pid}: process is not an attractor run/resume command"
        ));
    };
    let Some(sub) = args.get(attractor_idx + 1).map(|s| s.trim()) else {
        return Err(format!(
            "refusing to signal pid {pid}: process is not an attractor run/resume command"
        ));
    };
    if sub != "run" && sub != "resume" {
        return Err(format!(
            "refusing to signal pid {pid}: process is attractor {sub:?}, not run/resume"
        ));
    }

    if let Some(pid_logs_root) = cmdline_flag_value(&args, "--logs-root") {
        if !same_path(Path::new(&pid_logs_root), logs_root) {
            return Err(format!(
                "refusing to signal pid {pid}: --logs-root mismatch (pid={pid_logs_root:?} requested={:?})",
                logs_root.display().to_string()
            ));
        }
        return Ok(());
    }

    if let Some(pid_run_id) = cmdline_flag_value(&args, "--run-id") {
        if !run_id.trim().is_empty() {
            if pid_run_id.trim() != run_id.trim() {
                return Err(format!(
                    "refusing to signal pid {pid}: --run-id mismatch (pid={pid_run_id:?} snapshot={run_id:?})"
                ));
            }
            return Ok(());
        }
    }

    Err(format!(
        "refusing to signal pid {pid}: process command line has no --logs-root/--run-id"
    ))
}

/// Extract `--flag value` or `--flag=value` from an argv.
pub fn cmdline_flag_value(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{flag}=");
    for (i, arg) in args.iter().enumerate() {
        if arg == flag {
            return args.get(i + 1).map(|v| v.trim().to_string());
        }
        if let Some(value) = arg.strip_prefix(&prefix) {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command, Stdio};

    fn stop_args(logs_root: &Path, grace_ms: u64, force: bool) -> StopArgs {
        StopArgs {
            logs_root: logs_root.to_path_buf(),
            grace: Duration::from_millis(grace_ms),
            force,
        }
    }

    fn run_stop_capture(args: &StopArgs) -> (i32, String, String) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = run_stop(args, &mut stdout, &mut stderr);
        (
            code,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }

    struct ChildGuard(Child);

    impl Drop for ChildGuard {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn spawn_sleeper() -> ChildGuard {
        ChildGuard(
            Command::new("sleep")
                .arg("60")
                .stdout(Stdio::null())
                .spawn()
                .expect("spawn sleep"),
        )
    }

    /// A process whose argv contains `attractor run --logs-root <path>` so
    /// the identity check passes, while the actual program is a shell sleep.
    fn spawn_fake_attractor(logs_root: &Path) -> ChildGuard {
        ChildGuard(
            Command::new("bash")
                .arg("-c")
                .arg("sleep 60")
                .arg("attractor")
                .arg("run")
                .arg("--logs-root")
                .arg(logs_root)
                .stdout(Stdio::null())
                .spawn()
                .expect("spawn bash"),
        )
    }

    fn write_running_state(logs_root: &Path, pid: u32, run_id: &str) {
        std::fs::write(logs_root.join("run.pid"), format!("{pid}\n")).unwrap();
        std::fs::write(
            logs_root.join("live.json"),
            format!(r#"{{"event":"stage_started","node_id":"build","run_id":"{run_id}"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn refuses_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("final.json"),
            r#"{"status":"success","run_id":"r1"}"#,
        )
        .unwrap();
        let (code, _out, err) = run_stop_capture(&stop_args(dir.path(), 100, false));
        assert_eq!(code, 1);
        assert!(err.contains("refusing to stop"), "{err}");
    }

    #[test]
    fn refuses_missing_pid() {
        let dir = tempfile::tempdir().unwrap();
        // Live event but no run.pid: never Running.
        std::fs::write(dir.path().join("live.json"), r#"{"event":"x"}"#).unwrap();
        let (code, _out, err) = run_stop_capture(&stop_args(dir.path(), 100, false));
        assert_eq!(code, 1);
        assert!(err.contains("refusing to stop") || err.contains("not available"), "{err}");
    }

    // Stop safety: a foreign process (plain `sleep 60`) whose command line
    // lacks attractor/run markers must be refused with the contract phrase.
    #[test]
    fn refuses_foreign_process() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn_sleeper();
        write_running_state(dir.path(), child.0.id(), "r1");

        let (code, _out, err) = run_stop_capture(&stop_args(dir.path(), 100, false));
        assert_eq!(code, 1);
        assert!(err.contains("refusing to signal pid"), "{err}");

        // The sleeper is still alive — we never signaled it.
        assert!(pid_running(child.0.id() as i32));
    }

    #[test]
    fn refuses_logs_root_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let child = spawn_fake_attractor(other.path());
        write_running_state(dir.path(), child.0.id(), "r1");

        let (code, _out, err) = run_stop_capture(&stop_args(dir.path(), 100, false));
        assert_eq!(code, 1);
        assert!(err.contains("refusing to signal pid"), "{err}");
        assert!(err.contains("--logs-root mismatch"), "{err}");
    }

    #[test]
    fn graceful_stop_of_matching_process() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn_fake_attractor(dir.path());
        write_running_state(dir.path(), child.0.id(), "r1");

        let (code, out, err) = run_stop_capture(&stop_args(dir.path(), 5000, false));
        assert_eq!(code, 0, "stderr: {err}");
        assert!(out.contains(&format!("pid={}", child.0.id())), "{out}");
        assert!(out.contains("stopped=graceful"), "{out}");
    }

    #[test]
    fn force_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        // The shell traps SIGTERM, so only SIGKILL can end it.
        let child = ChildGuard(
            Command::new("bash")
                .arg("-c")
                .arg("trap '' TERM; sleep 60")
                .arg("attractor")
                .arg("run")
                .arg("--logs-root")
                .arg(dir.path())
                .stdout(Stdio::null())
                .spawn()
                .unwrap(),
        );
        write_running_state(dir.path(), child.0.id(), "r1");
        // Give bash a moment to install the trap.
        std::thread::sleep(Duration::from_millis(200));

        let (code, out, err) = run_stop_capture(&stop_args(dir.path(), 300, true));
        assert_eq!(code, 0, "stderr: {err}");
        assert!(out.contains("stopped=forced"), "{out}");
    }

    // --- unit pieces ---

    #[test]
    fn adaptive_poll_clamps() {
        assert_eq!(adaptive_grace_poll(Duration::from_millis(10)), Duration::from_millis(10));
        assert_eq!(adaptive_grace_poll(Duration::from_millis(250)), Duration::from_millis(50));
        assert_eq!(adaptive_grace_poll(Duration::from_secs(5)), Duration::from_millis(100));
    }

    #[test]
    fn cmdline_flag_value_both_forms() {
        let args: Vec<String> = ["kilroy", "attractor", "run", "--logs-root", "/a/b", "--run-id=r7"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(cmdline_flag_value(&args, "--logs-root").as_deref(), Some("/a/b"));
        assert_eq!(cmdline_flag_value(&args, "--run-id").as_deref(), Some("r7"));
        assert_eq!(cmdline_flag_value(&args, "--grace-ms"), None);
    }

    #[test]
    fn verify_rejects_non_run_subcommand() {
        let dir = tempfile::tempdir().unwrap();
        let child = ChildGuard(
            Command::new("bash")
                .arg("-c")
                .arg("sleep 60")
                .arg("attractor")
                .arg("stop")
                .arg("--logs-root")
                .arg(dir.path())
                .stdout(Stdio::null())
                .spawn()
                .unwrap(),
        );
        let err = verify_attractor_run_pid(child.0.id() as i32, dir.path(), "r1").unwrap_err();
        assert!(err.contains("not run/resume"), "{err}");
    }

    #[test]
    fn verify_accepts_run_id_match_without_logs_root() {
        let child = ChildGuard(
            Command::new("bash")
                .arg("-c")
                .arg("sleep 60")
                .arg("attractor")
                .arg("resume")
                .arg("--run-id")
                .arg("r42")
                .stdout(Stdio::null())
                .spawn()
                .unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_attractor_run_pid(child.0.id() as i32, dir.path(), "r42").is_ok());
        let err = verify_attractor_run_pid(child.0.id() as i32, dir.path(), "other").unwrap_err();
        assert!(err.contains("--run-id mismatch"), "{err}");
    }
}
