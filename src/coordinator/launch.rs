//! Starting workers and observing their termination.
//!
//! [`ProcessLauncher`] re-executes the current binary in worker mode, one OS
//! process per work item. [`ThreadLauncher`] runs each worker on a thread
//! against a [`MemoryRegistry`], which keeps the protocol identical while
//! staying inside one process.

use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use super::termination::{ChildProc, TerminationReason};
use crate::config::DelayRange;
use crate::sync::{MemoryRegistry, PrimitiveNames, RunId};
use crate::work::WorkUnit;
use crate::worker::{self, Assignment, WorkerOptions, WorkerStatus};

/// Environment variable carrying the run id into worker processes.
pub const RUN_ID_ENV: &str = "SLOTGATE_RUN_ID";

/// A started worker whose termination can be awaited.
pub trait WorkerHandle: Send {
    fn assignment(&self) -> &Assignment;

    /// Block until the worker has terminated. Calling again after termination
    /// was observed returns the same reason immediately.
    fn wait(&mut self) -> io::Result<TerminationReason>;
}

/// Starts one worker per assignment.
pub trait Launcher {
    type Handle: WorkerHandle;

    fn launch(&mut self, assignment: &Assignment) -> io::Result<Self::Handle>;
}

/// Launches workers as child processes of the current executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
    run_id: RunId,
    delay: DelayRange,
    backoff: Duration,
}

impl ProcessLauncher {
    /// Launcher that re-executes the running binary.
    pub fn current_exe(run_id: RunId, delay: DelayRange) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, run_id, delay))
    }

    pub fn new(exe: PathBuf, run_id: RunId, delay: DelayRange) -> Self {
        Self {
            exe,
            run_id,
            delay,
            backoff: WorkerOptions::default().backoff,
        }
    }

    /// Longest block on the slot counter between closing-flag checks.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn command(&self, assignment: &Assignment) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("worker")
            .arg("--run-id")
            .arg(self.run_id.as_str())
            .arg("--index")
            .arg(assignment.index.to_string())
            .arg("--item")
            .arg(&assignment.item)
            .arg("--min-delay-ms")
            .arg(self.delay.min().as_millis().to_string())
            .arg("--max-delay-ms")
            .arg(self.delay.max().as_millis().to_string())
            .arg("--backoff-ms")
            .arg(self.backoff.as_millis().to_string());

        cmd.env(RUN_ID_ENV, self.run_id.as_str());

        // The coordinator owns stdin for the close trigger.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        // Own process group: a terminal Ctrl+C reaches only the coordinator.
        cmd.process_group(0);
        cmd
    }
}

impl Launcher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&mut self, assignment: &Assignment) -> io::Result<ProcessHandle> {
        let child = self.command(assignment).spawn()?;
        let proc = ChildProc::from_child(child);
        debug!(index = assignment.index, pid = %proc.pid(), "Worker process spawned");
        Ok(ProcessHandle {
            assignment: assignment.clone(),
            proc,
        })
    }
}

pub struct ProcessHandle {
    assignment: Assignment,
    proc: ChildProc,
}

impl WorkerHandle for ProcessHandle {
    fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    fn wait(&mut self) -> io::Result<TerminationReason> {
        self.proc.wait()
    }
}

/// Launches workers as threads sharing one [`MemoryRegistry`].
pub struct ThreadLauncher<W> {
    registry: MemoryRegistry,
    names: PrimitiveNames,
    work: Arc<dyn WorkUnit>,
    out: W,
    options: WorkerOptions,
}

impl<W> ThreadLauncher<W>
where
    W: Write + Clone + Send + 'static,
{
    pub fn new(
        registry: MemoryRegistry,
        names: PrimitiveNames,
        work: Arc<dyn WorkUnit>,
        out: W,
        options: WorkerOptions,
    ) -> Self {
        Self {
            registry,
            names,
            work,
            out,
            options,
        }
    }
}

impl<W> Launcher for ThreadLauncher<W>
where
    W: Write + Clone + Send + 'static,
{
    type Handle = ThreadHandle;

    fn launch(&mut self, assignment: &Assignment) -> io::Result<ThreadHandle> {
        let registry = self.registry.clone();
        let names = self.names.clone();
        let work = Arc::clone(&self.work);
        let out = self.out.clone();
        let options = self.options;
        let owned = assignment.clone();

        let join = thread::Builder::new()
            .name(format!("worker-{}", assignment.index))
            .spawn(move || {
                match worker::run_worker(registry, names, &owned, work.as_ref(), out, &options) {
                    Ok(status) => status,
                    Err(e) => {
                        error!(index = owned.index, error = %e, "Worker failed");
                        WorkerStatus::Error
                    }
                }
            })?;

        Ok(ThreadHandle {
            assignment: assignment.clone(),
            join: Some(join),
            reason: None,
        })
    }
}

pub struct ThreadHandle {
    assignment: Assignment,
    join: Option<JoinHandle<WorkerStatus>>,
    reason: Option<TerminationReason>,
}

impl WorkerHandle for ThreadHandle {
    fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    fn wait(&mut self) -> io::Result<TerminationReason> {
        if let Some(join) = self.join.take() {
            let reason = match join.join() {
                Ok(status) => TerminationReason::Exited(status.exit_code()),
                Err(payload) => TerminationReason::Panicked(panic_message(payload.as_ref())),
            };
            self.reason = Some(reason);
        }
        Ok(self.reason.clone().unwrap_or(TerminationReason::Unknown))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
