//! Named synchronization primitives shared between the coordinator and its workers.
//!
//! A run uses three objects, each addressable by name from unrelated processes:
//!
//! - a bounded **slot counter** limiting how many workers do work at once,
//! - an **output lock** serializing console lines,
//! - a manual-reset **closing flag** broadcasting shutdown.
//!
//! # Backends
//!
//! - [`PosixBackend`]: named semaphores plus a shared-memory flag. Used by real
//!   worker processes.
//! - [`MemoryRegistry`]: an in-process registry keyed by the same names. Used for
//!   thread-mode runs and tests.
//!
//! Both bind by name only; no backend ever hands a raw handle from one
//! participant to another.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;

pub mod memory;
mod names;
pub mod posix;
mod set;

pub use memory::MemoryRegistry;
pub use names::{PrimitiveNames, RunId};
pub use posix::PosixBackend;
pub use set::{OutputGuard, PrimitiveSet, SlotGuard};

/// Which of the three primitives an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Counter,
    Lock,
    Flag,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "slot counter"),
            Self::Lock => write!(f, "output lock"),
            Self::Flag => write!(f, "closing flag"),
        }
    }
}

/// A bounded counting resource.
pub trait Counter: Send + Sync {
    /// Take a slot if one is free right now.
    fn try_acquire(&self) -> io::Result<bool>;

    /// Block for at most `timeout` waiting for a slot.
    fn acquire_timeout(&self, timeout: Duration) -> io::Result<bool>;

    /// Give a slot back.
    fn release(&self) -> io::Result<()>;

    /// Slots currently free.
    fn available(&self) -> io::Result<usize>;
}

/// A mutual-exclusion lock without reentrancy.
pub trait Lock: Send + Sync {
    fn lock(&self) -> io::Result<()>;
    fn unlock(&self) -> io::Result<()>;
}

/// A manual-reset flag. Once raised it stays raised.
pub trait Flag: Send + Sync {
    /// Raise the flag. Raising an already raised flag is a no-op.
    fn raise(&self) -> io::Result<()>;
    fn is_raised(&self) -> io::Result<bool>;
}

/// A namespace in which primitives are created and opened by name.
///
/// `create_*` must fail with [`io::ErrorKind::AlreadyExists`] on a name clash;
/// `open_*` must fail with [`io::ErrorKind::NotFound`] for an unknown name.
pub trait Backend: Clone + Send + Sync + 'static {
    type Counter: Counter;
    type Lock: Lock;
    type Flag: Flag;

    fn create_counter(&self, name: &str, capacity: u32) -> io::Result<Self::Counter>;
    fn open_counter(&self, name: &str) -> io::Result<Self::Counter>;

    fn create_lock(&self, name: &str) -> io::Result<Self::Lock>;
    fn open_lock(&self, name: &str) -> io::Result<Self::Lock>;

    fn create_flag(&self, name: &str) -> io::Result<Self::Flag>;
    fn open_flag(&self, name: &str) -> io::Result<Self::Flag>;

    /// Remove `name` from the namespace. Handles already open stay usable.
    fn unlink(&self, kind: PrimitiveKind, name: &str) -> io::Result<()>;
}
