//! The worker side of the pool protocol.
//!
//! A worker opens the run's primitives by name, races a slot against the
//! closing flag, and either cancels or runs its work unit inside the slot.
//! It reports the outcome under the output lock and exits with a
//! [`WorkerStatus`].

mod race;

use std::io::Write;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::console::Console;
use crate::error::Result;
use crate::sync::{Backend, PrimitiveNames, PrimitiveSet};
use crate::work::WorkUnit;

pub use race::{Admission, acquire_or_cancel};

/// How a worker finished. The discriminant is the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Work ran and reported success.
    Success = 0,
    /// Work ran and reported failure.
    Failure = 1,
    /// The closing flag won the race; no work was done.
    Cancelled = 2,
    /// Primitives could not be opened or a wait failed.
    Error = 3,
}

impl WorkerStatus {
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            2 => Some(Self::Cancelled),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// True if the worker held a slot and ran its work unit.
    pub fn did_work(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Which work item a worker was launched for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub index: usize,
    pub item: String,
}

impl Assignment {
    pub fn new(index: usize, item: impl Into<String>) -> Self {
        Self {
            index,
            item: item.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Longest single block on the counter before the flag is checked again.
    pub backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run one worker to completion.
///
/// Returns `Err` when the primitives cannot be opened or the race fails; the
/// caller maps that to [`WorkerStatus::Error`]. Everything opened here is
/// released before returning, on every path.
#[instrument(level = "debug", skip_all, fields(index = assignment.index, item = %assignment.item))]
pub fn run_worker<B, W>(
    backend: B,
    names: PrimitiveNames,
    assignment: &Assignment,
    work: &dyn WorkUnit,
    out: W,
    options: &WorkerOptions,
) -> Result<WorkerStatus>
where
    B: Backend,
    W: Write,
{
    let set = PrimitiveSet::open_all(backend, names)?;
    let mut console = Console::for_worker(assignment.index, out);
    let item = assignment.item.as_str();

    let slot = match acquire_or_cancel(&set, options.backoff)? {
        Admission::Cancelled => {
            debug!("Cancelled before admission");
            report(
                &set,
                &mut console,
                format_args!("'{}' interrupted: closing in progress", item),
            );
            return Ok(WorkerStatus::Cancelled);
        }
        Admission::Admitted(slot) => slot,
    };

    info!("Admitted");
    report(
        &set,
        &mut console,
        format_args!("slot acquired, starting '{}'", item),
    );

    let outcome = work.perform(item);
    let status = if outcome.succeeded {
        report(
            &set,
            &mut console,
            format_args!("'{}' processed successfully: {}", item, outcome.detail),
        );
        WorkerStatus::Success
    } else {
        report(
            &set,
            &mut console,
            format_args!("'{}' processed with errors: {}", item, outcome.detail),
        );
        WorkerStatus::Failure
    };

    if let Err(e) = slot.release() {
        warn!(error = %e, "Slot release failed");
        report(
            &set,
            &mut console,
            format_args!("warning: failed to release slot: {}", e),
        );
    }

    debug!(%status, "Worker finished");
    Ok(status)
}

/// A console line that cannot be written never changes the worker's outcome.
fn report<B: Backend, W: Write>(
    set: &PrimitiveSet<B>,
    console: &mut Console<W>,
    args: std::fmt::Arguments<'_>,
) {
    if let Err(e) = console.line(set, args) {
        warn!(error = %e, "Failed to write console line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::SharedBuffer;
    use crate::error::SlotgateError;
    use crate::sync::memory::{MemoryCounter, MemoryFlag, MemoryLock};
    use crate::sync::{Counter, MemoryRegistry, PrimitiveKind, RunId};
    use crate::work::WorkReport;
    use std::io;

    fn fixture(capacity: u32) -> (MemoryRegistry, PrimitiveSet<MemoryRegistry>) {
        let registry = MemoryRegistry::new();
        let names = PrimitiveNames::for_run(&RunId::generate());
        let set = PrimitiveSet::create_all(registry.clone(), names, capacity).unwrap();
        (registry, set)
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_exit_codes() {
        for status in [
            WorkerStatus::Success,
            WorkerStatus::Failure,
            WorkerStatus::Cancelled,
            WorkerStatus::Error,
        ] {
            assert_eq!(WorkerStatus::from_exit_code(status.exit_code()), Some(status));
        }
        assert_eq!(WorkerStatus::Cancelled.exit_code(), 2);
        assert_eq!(WorkerStatus::from_exit_code(101), None);
        assert!(!WorkerStatus::Cancelled.did_work());
    }

    #[test]
    fn test_success_reports_and_releases() {
        let (registry, set) = fixture(1);
        let buffer = SharedBuffer::new();
        let work = |_: &str| WorkReport::success("brackets are balanced");

        let status = run_worker(
            registry,
            set.names().clone(),
            &Assignment::new(0, "photo_0.jpg"),
            &work,
            buffer.clone(),
            &options(),
        )
        .unwrap();

        assert_eq!(status, WorkerStatus::Success);
        assert_eq!(set.available_slots().unwrap(), 1);
        let lines = buffer.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("slot acquired, starting 'photo_0.jpg'"));
        assert!(lines[1].ends_with("'photo_0.jpg' processed successfully: brackets are balanced"));
    }

    #[test]
    fn test_failed_work_still_releases_slot() {
        let (registry, set) = fixture(1);
        let buffer = SharedBuffer::new();
        let work = |_: &str| WorkReport::failure("brackets NOT balanced");

        let status = run_worker(
            registry,
            set.names().clone(),
            &Assignment::new(1, "document_1.pdf"),
            &work,
            buffer.clone(),
            &options(),
        )
        .unwrap();

        assert_eq!(status, WorkerStatus::Failure);
        assert_eq!(set.available_slots().unwrap(), 1);
        assert!(buffer.contents().contains("processed with errors: brackets NOT balanced"));
    }

    #[test]
    fn test_raised_flag_cancels_without_work() {
        let (registry, set) = fixture(1);
        set.raise_closing().unwrap();
        let buffer = SharedBuffer::new();
        let work = |_: &str| -> WorkReport { panic!("work must not run") };

        let status = run_worker(
            registry,
            set.names().clone(),
            &Assignment::new(2, "archive_2.zip"),
            &work,
            buffer.clone(),
            &options(),
        )
        .unwrap();

        assert_eq!(status, WorkerStatus::Cancelled);
        assert_eq!(set.available_slots().unwrap(), 1);
        assert_eq!(buffer.lines().len(), 1);
        assert!(buffer.contents().contains("'archive_2.zip' interrupted: closing in progress"));
    }

    #[test]
    fn test_missing_primitives_is_an_error() {
        let registry = MemoryRegistry::new();
        let buffer = SharedBuffer::new();
        let work = |_: &str| WorkReport::success("unused");

        let err = run_worker(
            registry,
            PrimitiveNames::for_run(&RunId::generate()),
            &Assignment::new(0, "photo_0.jpg"),
            &work,
            buffer.clone(),
            &options(),
        )
        .unwrap_err();

        assert!(matches!(err, SlotgateError::PrimitiveNotFound { .. }));
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_release_failure_is_a_warning_only() {
        let (registry, set) = fixture(1);
        let names = set.names().clone();
        let buffer = SharedBuffer::new();
        let counter = registry.clone();
        let slots = names.slots.clone();
        // Hands the slot back early, so the worker's own release overflows.
        let work = move |_: &str| {
            counter.open_counter(&slots).unwrap().release().unwrap();
            WorkReport::failure("brackets NOT balanced")
        };

        let status = run_worker(
            registry,
            names,
            &Assignment::new(5, "text_5.txt"),
            &work,
            buffer.clone(),
            &options(),
        )
        .unwrap();

        assert_eq!(status, WorkerStatus::Failure);
        assert_eq!(set.available_slots().unwrap(), 1);
        let lines = buffer.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("'text_5.txt' processed with errors: brackets NOT balanced"));
        assert!(lines[2].contains("warning: failed to release slot"));
    }

    /// Registry whose slot counter fails every timed wait.
    #[derive(Clone)]
    struct FailingWaits(MemoryRegistry);

    struct FailingCounter(MemoryCounter);

    impl Counter for FailingCounter {
        fn try_acquire(&self) -> io::Result<bool> {
            self.0.try_acquire()
        }

        fn acquire_timeout(&self, _timeout: Duration) -> io::Result<bool> {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }

        fn release(&self) -> io::Result<()> {
            self.0.release()
        }

        fn available(&self) -> io::Result<usize> {
            self.0.available()
        }
    }

    impl Backend for FailingWaits {
        type Counter = FailingCounter;
        type Lock = MemoryLock;
        type Flag = MemoryFlag;

        fn create_counter(&self, name: &str, capacity: u32) -> io::Result<FailingCounter> {
            self.0.create_counter(name, capacity).map(FailingCounter)
        }

        fn open_counter(&self, name: &str) -> io::Result<FailingCounter> {
            self.0.open_counter(name).map(FailingCounter)
        }

        fn create_lock(&self, name: &str) -> io::Result<MemoryLock> {
            self.0.create_lock(name)
        }

        fn open_lock(&self, name: &str) -> io::Result<MemoryLock> {
            self.0.open_lock(name)
        }

        fn create_flag(&self, name: &str) -> io::Result<MemoryFlag> {
            self.0.create_flag(name)
        }

        fn open_flag(&self, name: &str) -> io::Result<MemoryFlag> {
            self.0.open_flag(name)
        }

        fn unlink(&self, kind: PrimitiveKind, name: &str) -> io::Result<()> {
            self.0.unlink(kind, name)
        }
    }

    #[test]
    fn test_failed_slot_wait_is_an_error() {
        let (registry, set) = fixture(1);
        let buffer = SharedBuffer::new();
        let work = |_: &str| -> WorkReport { panic!("work must not run") };

        let err = run_worker(
            FailingWaits(registry),
            set.names().clone(),
            &Assignment::new(3, "setup_3.exe"),
            &work,
            buffer.clone(),
            &options(),
        )
        .unwrap_err();

        assert!(matches!(err, SlotgateError::WaitFailure { .. }));
        assert_eq!(err.os_error_code(), Some(libc::EINVAL));
        assert_eq!(set.available_slots().unwrap(), 1);
        assert!(buffer.contents().is_empty());
    }
}
