//! Worker termination: child-process handles and exit analysis.

use std::io;
use std::process::Child;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::debug;

use crate::worker::WorkerStatus;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// A thread-mode worker panicked.
    Panicked(String),
    Unknown,
}

impl TerminationReason {
    /// The worker outcome this termination maps to. Anything other than a
    /// recognised exit code counts as [`WorkerStatus::Error`].
    pub fn worker_status(&self) -> WorkerStatus {
        match self {
            Self::Exited(code) => WorkerStatus::from_exit_code(*code).unwrap_or(WorkerStatus::Error),
            _ => WorkerStatus::Error,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Panicked(msg) => format!("panicked: {}", msg),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` from a terminated child.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

/// A spawned worker process, reaped with `waitpid`.
pub struct ChildProc {
    pid: Pid,
    reason: Option<TerminationReason>,
}

impl ChildProc {
    pub fn from_child(child: Child) -> Self {
        // `Child` does not wait or kill on drop; the pid is reaped here.
        Self {
            pid: Pid::from_raw(child.id() as i32),
            reason: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the process exits. Once observed, the reason is cached and
    /// later calls return it without waiting again.
    pub fn wait(&mut self) -> io::Result<TerminationReason> {
        if let Some(reason) = &self.reason {
            return Ok(reason.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::Continued(_)) => continue,
                Ok(status) => {
                    let reason = analyze_wait_status(status);
                    debug!(pid = %self.pid, %reason, "Worker reaped");
                    self.reason = Some(reason.clone());
                    return Ok(reason);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    /// Non-blocking check. `None` while the process is still running.
    pub fn try_wait(&mut self) -> io::Result<Option<TerminationReason>> {
        if let Some(reason) = &self.reason {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                self.reason = Some(reason.clone());
                Ok(Some(reason))
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl Drop for ChildProc {
    /// A handle dropped before its process was observed belongs to an aborted
    /// run; the worker is terminated so it does not outlive the coordinator.
    fn drop(&mut self) {
        if self.reason.is_some() {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(10));
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}
