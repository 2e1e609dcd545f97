//! In-process registry of named primitives.
//!
//! Mirrors the OS namespace semantics closely enough that thread-mode workers
//! go through exactly the same create/open/unlink protocol as real processes:
//! objects are looked up by name, unlinking removes the name but leaves live
//! handles working, and a counter refuses to grow past its capacity.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Backend, Counter, Flag, Lock, PrimitiveKind};

fn poisoned<T>(_: PoisonError<T>) -> io::Error {
    io::Error::other("registry mutex poisoned")
}

#[derive(Clone)]
enum Entry {
    Counter(Arc<CounterState>),
    Lock(Arc<LockState>),
    Flag(Arc<AtomicBool>),
}

impl Entry {
    fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Counter(_) => PrimitiveKind::Counter,
            Self::Lock(_) => PrimitiveKind::Lock,
            Self::Flag(_) => PrimitiveKind::Flag,
        }
    }
}

/// A shared namespace of named primitives. Clones share the same namespace.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    objects: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names currently registered.
    pub fn len(&self) -> usize {
        self.objects.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects
            .lock()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    fn objects(&self) -> io::Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.objects.lock().map_err(poisoned)
    }

    fn insert(&self, name: &str, entry: Entry) -> io::Result<()> {
        let mut objects = self.objects()?;
        if objects.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("'{}' already exists", name),
            ));
        }
        objects.insert(name.to_string(), entry);
        Ok(())
    }

    fn lookup(&self, name: &str) -> io::Result<Entry> {
        self.objects()?.get(name).cloned().ok_or_else(|| not_found(name))
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("'{}' does not exist", name))
}

fn kind_mismatch(name: &str, found: PrimitiveKind, wanted: PrimitiveKind) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("'{}' is a {}, not a {}", name, found, wanted),
    )
}

struct CounterState {
    count: Mutex<usize>,
    capacity: usize,
    freed: Condvar,
}

/// Handle to a named counter in a [`MemoryRegistry`].
pub struct MemoryCounter(Arc<CounterState>);

impl Counter for MemoryCounter {
    fn try_acquire(&self) -> io::Result<bool> {
        let mut count = self.0.count.lock().map_err(poisoned)?;
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    fn acquire_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let count = self.0.count.lock().map_err(poisoned)?;
        let (mut count, _) = self
            .0
            .freed
            .wait_timeout_while(count, timeout, |count| *count == 0)
            .map_err(poisoned)?;
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    fn release(&self) -> io::Result<()> {
        let mut count = self.0.count.lock().map_err(poisoned)?;
        if *count >= self.0.capacity {
            return Err(io::Error::other(format!(
                "release would exceed capacity {}",
                self.0.capacity
            )));
        }
        *count += 1;
        self.0.freed.notify_one();
        Ok(())
    }

    fn available(&self) -> io::Result<usize> {
        Ok(*self.0.count.lock().map_err(poisoned)?)
    }
}

struct LockState {
    held: Mutex<bool>,
    unlocked: Condvar,
}

/// Handle to a named lock in a [`MemoryRegistry`].
pub struct MemoryLock(Arc<LockState>);

impl Lock for MemoryLock {
    fn lock(&self) -> io::Result<()> {
        let held = self.0.held.lock().map_err(poisoned)?;
        let mut held = self
            .0
            .unlocked
            .wait_while(held, |held| *held)
            .map_err(poisoned)?;
        *held = true;
        Ok(())
    }

    fn unlock(&self) -> io::Result<()> {
        let mut held = self.0.held.lock().map_err(poisoned)?;
        if !*held {
            return Err(io::Error::other("unlock of a lock that is not held"));
        }
        *held = false;
        self.0.unlocked.notify_one();
        Ok(())
    }
}

/// Handle to a named flag in a [`MemoryRegistry`].
pub struct MemoryFlag(Arc<AtomicBool>);

impl Flag for MemoryFlag {
    fn raise(&self) -> io::Result<()> {
        self.0.store(true, Ordering::Release);
        Ok(())
    }

    fn is_raised(&self) -> io::Result<bool> {
        Ok(self.0.load(Ordering::Acquire))
    }
}

impl Backend for MemoryRegistry {
    type Counter = MemoryCounter;
    type Lock = MemoryLock;
    type Flag = MemoryFlag;

    fn create_counter(&self, name: &str, capacity: u32) -> io::Result<MemoryCounter> {
        let state = Arc::new(CounterState {
            count: Mutex::new(capacity as usize),
            capacity: capacity as usize,
            freed: Condvar::new(),
        });
        self.insert(name, Entry::Counter(state.clone()))?;
        Ok(MemoryCounter(state))
    }

    fn open_counter(&self, name: &str) -> io::Result<MemoryCounter> {
        match self.lookup(name)? {
            Entry::Counter(state) => Ok(MemoryCounter(state)),
            other => Err(kind_mismatch(name, other.kind(), PrimitiveKind::Counter)),
        }
    }

    fn create_lock(&self, name: &str) -> io::Result<MemoryLock> {
        let state = Arc::new(LockState {
            held: Mutex::new(false),
            unlocked: Condvar::new(),
        });
        self.insert(name, Entry::Lock(state.clone()))?;
        Ok(MemoryLock(state))
    }

    fn open_lock(&self, name: &str) -> io::Result<MemoryLock> {
        match self.lookup(name)? {
            Entry::Lock(state) => Ok(MemoryLock(state)),
            other => Err(kind_mismatch(name, other.kind(), PrimitiveKind::Lock)),
        }
    }

    fn create_flag(&self, name: &str) -> io::Result<MemoryFlag> {
        let state = Arc::new(AtomicBool::new(false));
        self.insert(name, Entry::Flag(state.clone()))?;
        Ok(MemoryFlag(state))
    }

    fn open_flag(&self, name: &str) -> io::Result<MemoryFlag> {
        match self.lookup(name)? {
            Entry::Flag(state) => Ok(MemoryFlag(state)),
            other => Err(kind_mismatch(name, other.kind(), PrimitiveKind::Flag)),
        }
    }

    fn unlink(&self, kind: PrimitiveKind, name: &str) -> io::Result<()> {
        let mut objects = self.objects()?;
        match objects.get(name).map(Entry::kind) {
            Some(found) if found == kind => {
                objects.remove(name);
                Ok(())
            }
            Some(found) => Err(kind_mismatch(name, found, kind)),
            None => Err(not_found(name)),
        }
    }
}
