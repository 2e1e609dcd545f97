//! The coordinator side of the pool protocol.
//!
//! A [`Coordinator`] owns a run from primitive creation to teardown:
//!
//! ```text
//! Init -> Spawning -> Running -> ClosingRequested -> Broadcasting
//!      -> AwaitingWorkers -> Cleanup -> Terminated
//! ```
//!
//! Failures in `Init` go straight to `Cleanup`. A run in which no worker
//! could be launched still broadcasts and cleans up before failing.

mod launch;
mod termination;
mod trigger;

use std::io::Write;
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RunConfig;
use crate::console::Console;
use crate::error::{Result, SlotgateError};
use crate::sync::{Backend, PrimitiveSet, RunId};
use crate::wait::wait_all_chunked;
use crate::work::item_name;
use crate::worker::{Assignment, WorkerStatus};

pub use launch::{
    Launcher, ProcessHandle, ProcessLauncher, RUN_ID_ENV, ThreadHandle, ThreadLauncher,
    WorkerHandle,
};
pub use termination::{ChildProc, TerminationReason, analyze_wait_status};
pub use trigger::{CloseReason, CloseTrigger, Immediate, OperatorTrigger};

/// Where a coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Spawning,
    Running,
    ClosingRequested,
    Broadcasting,
    AwaitingWorkers,
    Cleanup,
    Terminated,
}

/// How one launched worker ended.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub index: usize,
    pub item: String,
    pub status: WorkerStatus,
    pub termination: String,
}

/// Result of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub capacity: u32,
    pub total: usize,
    pub launched: usize,
    pub launch_failures: usize,
    pub close_reason: CloseReason,
    pub workers: Vec<WorkerRecord>,
    /// Free slots observed after every worker terminated.
    pub slots_at_teardown: Option<usize>,
}

impl RunSummary {
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    /// Every slot taken was given back.
    pub fn slots_conserved(&self) -> bool {
        self.slots_at_teardown == Some(self.capacity as usize)
    }
}

/// A launched worker and, once observed, how it terminated.
struct Tracked<H> {
    handle: H,
    reason: Option<TerminationReason>,
}

/// Drives one run.
pub struct Coordinator<B: Backend, L: Launcher> {
    config: RunConfig,
    backend: B,
    launcher: L,
    phase: Phase,
}

impl<B: Backend, L: Launcher> Coordinator<B, L> {
    pub fn new(config: RunConfig, backend: B, launcher: L) -> Self {
        Self {
            config,
            backend,
            launcher,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "Phase transition");
        self.phase = phase;
    }

    /// Run to completion, blocking on `trigger` once every worker is launched.
    ///
    /// Console lines go to `out` under the output lock; the returned summary
    /// covers every launched worker.
    #[instrument(level = "info", skip_all, fields(run = %self.config.run_id))]
    pub fn run<T, W>(&mut self, mut trigger: T, out: W) -> Result<RunSummary>
    where
        T: CloseTrigger,
        W: Write,
    {
        let capacity = self.config.params.capacity();
        let total = self.config.params.total();
        let mut console = Console::for_coordinator(out);

        self.enter(Phase::Init);
        let mut set = match PrimitiveSet::create_all(self.backend.clone(), self.config.names(), capacity) {
            Ok(set) => set,
            Err(e) => {
                // create_all already released what it made.
                self.enter(Phase::Cleanup);
                self.enter(Phase::Terminated);
                return Err(e);
            }
        };
        info!(capacity, total, "Primitives created");

        self.enter(Phase::Spawning);
        say(
            &set,
            &mut console,
            format_args!("launching {} workers, at most {} at a time", total, capacity),
        );
        let (mut tracked, launch_failures) = self.spawn_all(&set, &mut console, total);

        if tracked.is_empty() {
            self.enter(Phase::Broadcasting);
            if let Err(e) = set.raise_closing() {
                warn!(error = %e, "Failed to raise closing flag");
            }
            self.enter(Phase::Cleanup);
            set.release_all();
            self.enter(Phase::Terminated);
            return Err(SlotgateError::NoWorkersStarted { requested: total });
        }

        say(
            &set,
            &mut console,
            format_args!("{} of {} workers launched", tracked.len(), total),
        );

        self.enter(Phase::Running);
        if let Some(prompt) = trigger.prompt() {
            say(&set, &mut console, format_args!("{}", prompt));
        }
        let close_reason = trigger.wait();

        self.enter(Phase::ClosingRequested);
        info!(%close_reason, "Closing requested");
        say(
            &set,
            &mut console,
            format_args!("closing ({}): waiting workers will be cancelled", close_reason),
        );

        self.enter(Phase::Broadcasting);
        if let Err(e) = set.raise_closing() {
            // Workers still finish on their own; the bulk wait below stays valid.
            error!(error = %e, "Failed to raise closing flag");
        }

        self.enter(Phase::AwaitingWorkers);
        let waited = wait_all_chunked(&mut tracked, self.config.wait_ceiling, |slice| {
            for entry in slice.iter_mut() {
                let reason = entry.handle.wait()?;
                entry.reason = Some(reason);
            }
            Ok(())
        });
        if let Err(e) = waited {
            self.enter(Phase::Cleanup);
            set.release_all();
            self.enter(Phase::Terminated);
            return Err(e);
        }

        self.enter(Phase::Cleanup);
        let workers: Vec<WorkerRecord> = tracked.into_iter().map(record).collect();
        let slots_at_teardown = match set.available_slots() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Could not read slot counter at teardown");
                None
            }
        };

        let summary = RunSummary {
            run_id: self.config.run_id.clone(),
            capacity,
            total,
            launched: workers.len(),
            launch_failures,
            close_reason,
            workers,
            slots_at_teardown,
        };
        if !summary.slots_conserved() {
            warn!(
                expected = capacity,
                observed = ?slots_at_teardown,
                "Slot count at teardown differs from capacity"
            );
        }

        say(
            &set,
            &mut console,
            format_args!(
                "{} succeeded, {} failed, {} cancelled, {} errors",
                summary.count(WorkerStatus::Success),
                summary.count(WorkerStatus::Failure),
                summary.count(WorkerStatus::Cancelled),
                summary.count(WorkerStatus::Error),
            ),
        );
        say(&set, &mut console, format_args!("shutdown complete"));
        set.release_all();

        self.enter(Phase::Terminated);
        info!(launched = summary.launched, "Run finished");
        Ok(summary)
    }

    /// Launch one worker per item. Failed launches are reported and skipped.
    fn spawn_all<W: Write>(
        &mut self,
        set: &PrimitiveSet<B>,
        console: &mut Console<W>,
        total: usize,
    ) -> (Vec<Tracked<L::Handle>>, usize) {
        let mut tracked = Vec::with_capacity(total);
        let mut failures = 0;

        for index in 0..total {
            let assignment = Assignment::new(index, item_name(index));
            match self.launcher.launch(&assignment) {
                Ok(handle) => tracked.push(Tracked {
                    handle,
                    reason: None,
                }),
                Err(source) => {
                    failures += 1;
                    let err = SlotgateError::Launch {
                        index,
                        item: assignment.item.clone(),
                        source,
                    };
                    error!(error = %err, "Launch failed");
                    say(set, console, format_args!("{}: {}", err, err_source(&err)));
                }
            }
            if !self.config.launch_stagger.is_zero() && index + 1 < total {
                thread::sleep(self.config.launch_stagger);
            }
        }
        (tracked, failures)
    }
}

fn record<H: WorkerHandle>(entry: Tracked<H>) -> WorkerRecord {
    let reason = entry.reason.unwrap_or(TerminationReason::Unknown);
    let assignment = entry.handle.assignment();
    WorkerRecord {
        index: assignment.index,
        item: assignment.item.clone(),
        status: reason.worker_status(),
        termination: reason.description(),
    }
}

fn err_source(err: &SlotgateError) -> String {
    std::error::Error::source(err)
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Coordinator console lines are best effort.
fn say<B: Backend, W: Write>(
    set: &PrimitiveSet<B>,
    console: &mut Console<W>,
    args: std::fmt::Arguments<'_>,
) {
    if let Err(e) = console.line(set, args) {
        warn!(error = %e, "Failed to write console line");
    }
}
