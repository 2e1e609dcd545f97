//! Slot acquisition raced against the closing flag.

use std::time::Duration;

use tracing::{trace, warn};

use crate::error::Result;
use crate::sync::{Backend, PrimitiveSet, SlotGuard};

/// Outcome of [`acquire_or_cancel`].
pub enum Admission<'a, B: Backend> {
    /// The closing flag was raised first. No slot is held.
    Cancelled,
    /// A slot was taken and the flag was still clear afterwards.
    Admitted(SlotGuard<'a, B::Counter>),
}

impl<B: Backend> Admission<'_, B> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Wait until either the closing flag is raised or a slot is free.
///
/// The flag is checked before every bounded block on the counter, so a
/// raised flag always wins over a free slot. A slot taken while the flag was
/// raised concurrently is handed back and the call reports cancellation.
pub fn acquire_or_cancel<B: Backend>(
    set: &PrimitiveSet<B>,
    backoff: Duration,
) -> Result<Admission<'_, B>> {
    loop {
        if set.is_closing()? {
            return Ok(Admission::Cancelled);
        }

        let Some(slot) = set.acquire_slot_timeout(backoff)? else {
            trace!("No slot yet");
            continue;
        };

        if set.is_closing()? {
            if let Err(e) = slot.release() {
                warn!(error = %e, "Failed to hand back slot taken during closing");
            }
            return Ok(Admission::Cancelled);
        }
        return Ok(Admission::Admitted(slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MemoryRegistry, PrimitiveNames, RunId};
    use std::thread;
    use std::time::Instant;

    const BACKOFF: Duration = Duration::from_millis(5);

    fn pair(capacity: u32) -> (PrimitiveSet<MemoryRegistry>, PrimitiveSet<MemoryRegistry>) {
        let registry = MemoryRegistry::new();
        let names = PrimitiveNames::for_run(&RunId::generate());
        let owner = PrimitiveSet::create_all(registry.clone(), names.clone(), capacity).unwrap();
        let worker = PrimitiveSet::open_all(registry, names).unwrap();
        (owner, worker)
    }

    #[test]
    fn test_free_slot_admits() {
        let (owner, worker) = pair(2);
        let admission = acquire_or_cancel(&worker, BACKOFF).unwrap();
        assert!(!admission.is_cancelled());
        assert_eq!(owner.available_slots().unwrap(), 1);
        drop(admission);
        assert_eq!(owner.available_slots().unwrap(), 2);
    }

    #[test]
    fn test_flag_wins_over_free_slot() {
        let (owner, worker) = pair(1);
        owner.raise_closing().unwrap();
        assert!(acquire_or_cancel(&worker, BACKOFF).unwrap().is_cancelled());
        assert_eq!(owner.available_slots().unwrap(), 1);
    }

    #[test]
    fn test_blocked_worker_sees_flag() {
        let (owner, worker) = pair(1);
        let _held = owner.try_acquire_slot().unwrap().unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let start = Instant::now();
                let cancelled = acquire_or_cancel(&worker, BACKOFF).unwrap().is_cancelled();
                (cancelled, start.elapsed())
            });
            thread::sleep(Duration::from_millis(30));
            owner.raise_closing().unwrap();

            let (cancelled, elapsed) = waiter.join().unwrap();
            assert!(cancelled);
            assert!(elapsed < Duration::from_secs(2));
        });
    }

    #[test]
    fn test_slot_and_flag_together_cancels_and_returns_slot() {
        let (owner, worker) = pair(1);
        let held = owner.try_acquire_slot().unwrap().unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| acquire_or_cancel(&worker, BACKOFF).unwrap().is_cancelled());
            thread::sleep(Duration::from_millis(20));
            owner.raise_closing().unwrap();
            held.release().unwrap();

            assert!(waiter.join().unwrap());
        });
        assert_eq!(owner.available_slots().unwrap(), 1);
    }
}
