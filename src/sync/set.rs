//! The per-process view of a run's three primitives.

use std::io;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{Backend, Counter, Flag, Lock, PrimitiveKind, PrimitiveNames};
use crate::error::{Result, SlotgateError};

/// This process's references to the slot counter, output lock and closing flag.
///
/// The coordinator builds one with [`create_all`](Self::create_all) and owns the
/// names: releasing it also unlinks them. Workers use [`open_all`](Self::open_all)
/// and only drop their own references.
pub struct PrimitiveSet<B: Backend> {
    backend: B,
    names: PrimitiveNames,
    slots: Option<B::Counter>,
    output: Option<B::Lock>,
    closing: Option<B::Flag>,
    owner: bool,
}

impl<B: Backend> PrimitiveSet<B> {
    fn empty(backend: B, names: PrimitiveNames, owner: bool) -> Self {
        Self {
            backend,
            names,
            slots: None,
            output: None,
            closing: None,
            owner,
        }
    }

    /// Create all three primitives: the counter full at `capacity`, the lock
    /// unlocked and the flag cleared.
    ///
    /// On failure everything created so far is released and unlinked before the
    /// error is returned. Names that were already taken are left untouched.
    #[instrument(level = "debug", skip(backend, names), fields(slots = %names.slots))]
    pub fn create_all(backend: B, names: PrimitiveNames, capacity: u32) -> Result<Self> {
        // Dropping `set` on an early return releases whatever it holds.
        let mut set = Self::empty(backend, names, true);

        let slots = set.backend.create_counter(&set.names.slots, capacity);
        set.slots = Some(creation(PrimitiveKind::Counter, &set.names.slots, slots)?);

        let output = set.backend.create_lock(&set.names.output);
        set.output = Some(creation(PrimitiveKind::Lock, &set.names.output, output)?);

        let closing = set.backend.create_flag(&set.names.closing);
        set.closing = Some(creation(PrimitiveKind::Flag, &set.names.closing, closing)?);

        debug!(capacity, "Primitive set created");
        Ok(set)
    }

    /// Bind to a set some other process created.
    #[instrument(level = "debug", skip(backend, names), fields(slots = %names.slots))]
    pub fn open_all(backend: B, names: PrimitiveNames) -> Result<Self> {
        let mut set = Self::empty(backend, names, false);

        let slots = set.backend.open_counter(&set.names.slots);
        set.slots = Some(opening(PrimitiveKind::Counter, &set.names.slots, slots)?);

        let output = set.backend.open_lock(&set.names.output);
        set.output = Some(opening(PrimitiveKind::Lock, &set.names.output, output)?);

        let closing = set.backend.open_flag(&set.names.closing);
        set.closing = Some(opening(PrimitiveKind::Flag, &set.names.closing, closing)?);

        Ok(set)
    }

    pub fn names(&self) -> &PrimitiveNames {
        &self.names
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_released(&self) -> bool {
        self.slots.is_none() && self.output.is_none() && self.closing.is_none()
    }

    /// Drop this process's references, unlinking the names if this set created
    /// them. Idempotent; failures are logged, never returned.
    pub fn release_all(&mut self) {
        if self.slots.take().is_some() && self.owner {
            self.unlink_quietly(PrimitiveKind::Counter, &self.names.slots);
        }
        if self.output.take().is_some() && self.owner {
            self.unlink_quietly(PrimitiveKind::Lock, &self.names.output);
        }
        if self.closing.take().is_some() && self.owner {
            self.unlink_quietly(PrimitiveKind::Flag, &self.names.closing);
        }
    }

    fn unlink_quietly(&self, kind: PrimitiveKind, name: &str) {
        match self.backend.unlink(kind, name) {
            Ok(()) => debug!(%kind, name, "Unlinked"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(%kind, name, error = %e, "Failed to unlink primitive"),
        }
    }

    fn counter(&self) -> Result<&B::Counter> {
        self.slots
            .as_ref()
            .ok_or(SlotgateError::Released(PrimitiveKind::Counter))
    }

    fn flag(&self) -> Result<&B::Flag> {
        self.closing
            .as_ref()
            .ok_or(SlotgateError::Released(PrimitiveKind::Flag))
    }

    fn describe(&self, kind: PrimitiveKind) -> String {
        let name = match kind {
            PrimitiveKind::Counter => &self.names.slots,
            PrimitiveKind::Lock => &self.names.output,
            PrimitiveKind::Flag => &self.names.closing,
        };
        format!("{} '{}'", kind, name)
    }

    /// Take the output lock until the guard is dropped.
    pub fn output(&self) -> Result<OutputGuard<'_, B::Lock>> {
        let lock = self
            .output
            .as_ref()
            .ok_or(SlotgateError::Released(PrimitiveKind::Lock))?;
        lock.lock()
            .map_err(|e| SlotgateError::wait_failed(self.describe(PrimitiveKind::Lock), e))?;
        Ok(OutputGuard { lock })
    }

    /// Raise the closing flag. Raising it again is a no-op.
    pub fn raise_closing(&self) -> Result<()> {
        self.flag()?.raise().map_err(|source| SlotgateError::Signal {
            what: self.describe(PrimitiveKind::Flag),
            source,
        })
    }

    pub fn is_closing(&self) -> Result<bool> {
        self.flag()?
            .is_raised()
            .map_err(|e| SlotgateError::wait_failed(self.describe(PrimitiveKind::Flag), e))
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire_slot(&self) -> Result<Option<SlotGuard<'_, B::Counter>>> {
        let counter = self.counter()?;
        let acquired = counter
            .try_acquire()
            .map_err(|e| SlotgateError::wait_failed(self.describe(PrimitiveKind::Counter), e))?;
        Ok(acquired.then(|| SlotGuard::new(counter)))
    }

    /// Wait at most `timeout` for a slot.
    pub fn acquire_slot_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<SlotGuard<'_, B::Counter>>> {
        let counter = self.counter()?;
        let acquired = counter
            .acquire_timeout(timeout)
            .map_err(|e| SlotgateError::wait_failed(self.describe(PrimitiveKind::Counter), e))?;
        Ok(acquired.then(|| SlotGuard::new(counter)))
    }

    /// Slots currently free.
    pub fn available_slots(&self) -> Result<usize> {
        self.counter()?
            .available()
            .map_err(|e| SlotgateError::wait_failed(self.describe(PrimitiveKind::Counter), e))
    }
}

impl<B: Backend> Drop for PrimitiveSet<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn creation<T>(kind: PrimitiveKind, name: &str, result: io::Result<T>) -> Result<T> {
    result.map_err(|source| SlotgateError::PrimitiveCreation {
        kind,
        name: name.to_string(),
        source,
    })
}

fn opening<T>(kind: PrimitiveKind, name: &str, result: io::Result<T>) -> Result<T> {
    result.map_err(|source| SlotgateError::open_failed(kind, name, source))
}

/// Holds the output lock; unlocks on drop.
pub struct OutputGuard<'a, L: Lock> {
    lock: &'a L,
}

impl<L: Lock> Drop for OutputGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!(error = %e, "Failed to unlock output lock");
        }
    }
}

/// One acquired slot. Released exactly once, explicitly or on drop.
pub struct SlotGuard<'a, C: Counter> {
    counter: &'a C,
    released: bool,
}

impl<'a, C: Counter> SlotGuard<'a, C> {
    fn new(counter: &'a C) -> Self {
        Self {
            counter,
            released: false,
        }
    }

    /// Return the slot, reporting failure to the caller.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.counter.release().map_err(|source| SlotgateError::Release {
            what: PrimitiveKind::Counter.to_string(),
            source,
        })
    }
}

impl<C: Counter> Drop for SlotGuard<'_, C> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.counter.release()
        {
            warn!(error = %e, "Failed to release slot");
        }
    }
}
