//! Process supervisor for the external proxy core.
//!
//! At most one instance runs per supervisor. The live child is owned by a
//! monitor task; the supervisor keeps only the record needed to stop it
//! (`RunningInstance`). Status is published on a watch channel so the UI can
//! poll or await it without sharing the supervisor itself.
//!
//! Exit reporting: a spontaneous exit is published as `Stopped(code)` by the
//! monitor. A requested stop is published as `Stopped(0)` by the supervisor and
//! the monitor only logs the real code. Every run id transitions out of
//! `Running` at most once.

use crate::error::{LaunchError, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Stopped { exit_code: i32 },
    Running { pid: u32, run: u64 },
}

impl Default for ProcessStatus {
    fn default() -> Self {
        ProcessStatus::Stopped { exit_code: 0 }
    }
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessStatus::Running { pid, .. } => Some(*pid),
            ProcessStatus::Stopped { .. } => None,
        }
    }

    /// Exit code worth showing to the user, if any.
    pub fn failure(&self) -> Option<i32> {
        match self {
            ProcessStatus::Stopped { exit_code } if !is_accepted_exit(*exit_code) => Some(*exit_code),
            _ => None,
        }
    }

    /// [`failure`](Self::failure) as an error value.
    pub fn check(&self) -> Result<()> {
        match self.failure() {
            Some(code) => Err(LaunchError::ProcessAbnormalExit(code)),
            None => Ok(()),
        }
    }
}

/// 0 and 1 are how the core exits on a normal or config-error shutdown.
pub fn is_accepted_exit(code: i32) -> bool {
    code == 0 || code == 1
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningInstance {
    run: u64,
    pid: u32,
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

pub struct Supervisor {
    binary_path: PathBuf,
    grace: Duration,
    status: Arc<watch::Sender<ProcessStatus>>,
    current: Option<RunningInstance>,
    /// Monitors of instances that were stopped without waiting.
    draining: Vec<JoinHandle<()>>,
    next_run: u64,
}

impl Supervisor {
    /// `grace` bounds how long a terminated process may take before it is
    /// killed, and how long shutdown waits overall.
    pub fn new(binary_path: impl Into<PathBuf>, grace: Duration) -> Self {
        let (tx, _rx) = watch::channel(ProcessStatus::default());
        Supervisor {
            binary_path: binary_path.into(),
            grace,
            status: Arc::new(tx),
            current: None,
            draining: Vec::new(),
            next_run: 0,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    /// Spawn `<binary> -c <config_path>`, replacing any running instance.
    pub async fn start(&mut self, config_path: &Path) -> Result<ProcessStatus> {
        if self.current.is_some() {
            self.force_stop().await;
        }
        self.join_draining(self.grace * 2).await;

        let binary = absolute(&self.binary_path);
        let config = absolute(config_path);
        let mut cmd = Command::new(&binary);
        cmd.arg("-c")
            .arg(&config)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|source| LaunchError::ProcessSpawnError {
            path: binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        self.next_run += 1;
        let run = self.next_run;
        self.status.send_replace(ProcessStatus::Running { pid, run });

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, run, stop_rx, Arc::clone(&self.status), self.grace));
        self.current = Some(RunningInstance { run, pid, stop_tx, monitor });

        info!(pid, run, binary = %binary.display(), config = %config.display(), "Process started");
        Ok(self.status())
    }

    /// Ask the current instance to terminate and report `Stopped(0)` at once.
    ///
    /// The reported code is 0 even when the instance already exited on its
    /// own with another code. The monitor's run guard keeps it from
    /// overwriting this afterwards.
    pub fn stop(&mut self) {
        let Some(inst) = self.current.take() else {
            return;
        };
        let _ = inst.stop_tx.send(());
        self.status.send_replace(ProcessStatus::Stopped { exit_code: 0 });
        info!(pid = inst.pid, "Process stopped");
        self.draining.push(inst.monitor);
    }

    /// Terminate the running instance and wait until it has exited.
    pub async fn force_stop(&mut self) {
        let Some(inst) = self.current.take() else {
            return;
        };
        let _ = inst.stop_tx.send(());
        if let Err(e) = inst.monitor.await {
            warn!(pid = inst.pid, "Process monitor failed: {}", e);
        }
        self.status.send_replace(ProcessStatus::Stopped { exit_code: 0 });
        info!(pid = inst.pid, "Process terminated");
    }

    /// Stop everything and wait, bounded by the grace interval.
    ///
    /// Processes still alive after the deadline are left to the OS.
    pub async fn shutdown(&mut self) {
        let limit = self.grace * 2;
        if self.current.is_some() {
            info!("Stopping process");
            if tokio::time::timeout(limit, self.force_stop()).await.is_err() {
                warn!("Process did not exit within {:?}; abandoning it", limit);
            }
        }
        self.join_draining(limit).await;
    }

    async fn join_draining(&mut self, limit: Duration) {
        if self.draining.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.draining);
        let all = async {
            for handle in pending {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(limit, all).await.is_err() {
            warn!("Stopped processes still running after {:?}", limit);
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

async fn monitor(
    mut child: Child,
    run: u64,
    mut stop_rx: oneshot::Receiver<()>,
    status: Arc<watch::Sender<ProcessStatus>>,
    grace: Duration,
) {
    let pid = child.id().unwrap_or_default();
    // A dropped sender (supervisor gone) counts as a stop request.
    let (exit, requested) = tokio::select! {
        res = child.wait() => (res, false),
        _ = &mut stop_rx => (terminate(&mut child, grace).await, true),
    };

    let code = match exit {
        Ok(st) => exit_code(st),
        Err(e) => {
            warn!(pid, "Failed to wait for process: {}", e);
            -1
        }
    };

    if requested {
        debug!(pid, code, "Process exited after stop request");
        return;
    }

    let published = status.send_if_modified(|s| match s {
        ProcessStatus::Running { run: r, .. } if *r == run => {
            *s = ProcessStatus::Stopped { exit_code: code };
            true
        }
        _ => false,
    });
    if published {
        if is_accepted_exit(code) {
            info!(pid, code, "Process exited");
        } else {
            warn!(pid, code, "Process exited abnormally");
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` has passed.
#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        let sent = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if sent {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(res) => return res,
                Err(_) => warn!(pid, "Process ignored SIGTERM for {:?}; killing", grace),
            }
        }
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}

/// Exit code as the launcher reports it; death by signal `n` is `128 + n`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Retry on ETXTBSY: another test thread may still hold the fresh script
    /// open across its own fork.
    async fn start(sup: &mut Supervisor, config: &Path) -> Result<ProcessStatus> {
        let mut attempts = 0;
        loop {
            match sup.start(config).await {
                Err(LaunchError::ProcessSpawnError { source, .. })
                    if source.raw_os_error() == Some(26) && attempts < 20 =>
                {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => return other,
            }
        }
    }

    async fn wait_stopped(sup: &Supervisor) -> ProcessStatus {
        let mut rx = sup.subscribe();
        let st = tokio::time::timeout(WAIT, rx.wait_for(|s| !s.is_running()))
            .await
            .expect("process did not stop in time")
            .unwrap();
        *st
    }

    fn alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_failure_convention() {
        assert_eq!(ProcessStatus::Stopped { exit_code: 0 }.failure(), None);
        assert_eq!(ProcessStatus::Stopped { exit_code: 1 }.failure(), None);
        assert_eq!(ProcessStatus::Stopped { exit_code: 2 }.failure(), Some(2));
        assert_eq!(ProcessStatus::Stopped { exit_code: -1 }.failure(), Some(-1));
        assert_eq!(ProcessStatus::Running { pid: 1, run: 1 }.failure(), None);
        assert!(matches!(
            ProcessStatus::Stopped { exit_code: 23 }.check(),
            Err(LaunchError::ProcessAbnormalExit(23))
        ));
    }

    #[tokio::test]
    async fn test_spontaneous_exit_reports_real_code() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exit 3");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        let st = start(&mut sup, &dir.path().join("config.json")).await.unwrap();
        assert!(st.is_running());

        let st = wait_stopped(&sup).await;
        assert_eq!(st, ProcessStatus::Stopped { exit_code: 3 });
        assert_eq!(st.failure(), Some(3));
    }

    #[tokio::test]
    async fn test_exit_code_one_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exit 1");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        start(&mut sup, Path::new("config.json")).await.unwrap();
        let st = wait_stopped(&sup).await;
        assert_eq!(st, ProcessStatus::Stopped { exit_code: 1 });
        assert_eq!(st.failure(), None);
    }

    #[tokio::test]
    async fn test_killed_by_signal_reports_128_plus_signal() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exec sleep 30");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        let pid = start(&mut sup, Path::new("config.json")).await.unwrap().pid().unwrap();
        std::process::Command::new("kill").args(["-TERM", &pid.to_string()]).status().unwrap();

        assert_eq!(wait_stopped(&sup).await, ProcessStatus::Stopped { exit_code: 143 });
    }

    #[tokio::test]
    async fn test_passes_config_argument() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let bin = write_script(
            dir.path(),
            "v2ray",
            &format!("printf '%s\\n' \"$@\" > '{}'", args_file.display()),
        );
        let config = dir.path().join("config.json");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        start(&mut sup, &config).await.unwrap();
        assert_eq!(wait_stopped(&sup).await, ProcessStatus::Stopped { exit_code: 0 });

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(args, format!("-c\n{}\n", config.display()));
    }

    #[tokio::test]
    async fn test_stop_reports_zero_even_if_process_exits_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "trap 'exit 7' TERM\nwhile :; do sleep 0.05; done");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        let pid = start(&mut sup, Path::new("config.json")).await.unwrap().pid().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        sup.stop();
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });

        // The process really exits with 7; the reported code stays 0.
        let deadline = Instant::now() + WAIT;
        while alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
    }

    #[tokio::test]
    async fn test_stop_after_spontaneous_exit_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exit 5");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        start(&mut sup, Path::new("config.json")).await.unwrap();
        assert_eq!(wait_stopped(&sup).await, ProcessStatus::Stopped { exit_code: 5 });
        sup.stop();
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });

        // Only the first stop after a start resets the code.
        sup.stop();
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let mut sup = Supervisor::new("/nonexistent/v2ray", Duration::from_secs(1));
        sup.stop();
        sup.force_stop().await;
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
    }

    #[tokio::test]
    async fn test_exit_races_stop_single_transition() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exit 9");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        for _ in 0..10 {
            start(&mut sup, Path::new("config.json")).await.unwrap();
            sup.stop();
            assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(
                sup.status(),
                ProcessStatus::Stopped { exit_code: 0 },
                "a late exit report overwrote the stop"
            );
        }
    }

    #[tokio::test]
    async fn test_restart_terminates_previous_instance() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exec sleep 30");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        let first = start(&mut sup, Path::new("a.json")).await.unwrap();
        let old_pid = first.pid().unwrap();
        assert!(alive(old_pid));

        let second = start(&mut sup, Path::new("b.json")).await.unwrap();
        let new_pid = second.pid().unwrap();
        assert!(!alive(old_pid), "previous instance still alive");
        assert_ne!(old_pid, new_pid);
        match (first, second) {
            (ProcessStatus::Running { run: a, .. }, ProcessStatus::Running { run: b, .. }) => {
                assert!(b > a)
            }
            other => panic!("unexpected statuses {:?}", other),
        }
        assert_eq!(sup.status(), second);

        sup.shutdown().await;
        assert!(!alive(new_pid));
    }

    #[tokio::test]
    async fn test_force_stop_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "exec sleep 30");
        let mut sup = Supervisor::new(&bin, Duration::from_secs(2));

        let pid = start(&mut sup, Path::new("config.json")).await.unwrap().pid().unwrap();
        sup.force_stop().await;
        assert!(!alive(pid));
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
    }

    #[tokio::test]
    async fn test_shutdown_kills_process_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), "v2ray", "trap '' TERM\nwhile :; do sleep 0.05; done");
        let mut sup = Supervisor::new(&bin, Duration::from_millis(300));

        let pid = start(&mut sup, Path::new("config.json")).await.unwrap().pid().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let began = Instant::now();
        sup.shutdown().await;
        assert!(began.elapsed() < Duration::from_secs(3));
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path().join("missing"), Duration::from_secs(1));

        let err = sup.start(Path::new("config.json")).await.unwrap_err();
        assert!(matches!(err, LaunchError::ProcessSpawnError { .. }));
        assert_eq!(sup.status(), ProcessStatus::Stopped { exit_code: 0 });
        assert!(sup.current.is_none());
    }
}
