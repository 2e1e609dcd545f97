//! slotgate: a bounded pool of worker processes coordinated through named
//! OS primitives.
//!
//! A coordinator creates three named primitives (a slot counter, an output
//! lock and a closing flag), launches one worker per work item and waits for
//! an operator to ask it to close. Workers race for a slot against the
//! closing flag; those that lose to the flag exit without doing any work.
//!
//! The same protocol runs over [`sync::PosixBackend`] between real processes
//! and over [`sync::MemoryRegistry`] between threads.

pub mod cli;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod sync;
pub mod wait;
pub mod work;
pub mod worker;

pub use error::{Result, SlotgateError};
