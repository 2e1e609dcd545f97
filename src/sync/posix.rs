//! POSIX-backed named primitives for real worker processes.
//!
//! - Slot counter: a named semaphore (`sem_open`) initialised to the capacity.
//! - Output lock: a named semaphore initialised to one.
//! - Closing flag: a one-word shared memory object (`shm_open` + `mmap`)
//!   holding an atomic. POSIX has no manual-reset event, and a flag that is
//!   only ever polled needs nothing more than an atomic in shared memory.
//!
//! Names must start with `/` and contain no other slash; [`super::PrimitiveNames`]
//! produces names of that shape.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::warn;

use super::{Backend, Counter, Flag, Lock, PrimitiveKind};

/// Permission bits for every object we create: owner read/write only.
const OBJECT_MODE: libc::c_uint = 0o600;

/// Size of the flag's shared memory object.
const FLAG_LEN: NonZeroUsize = NonZeroUsize::new(size_of::<AtomicU32>()).unwrap();

/// Backend over the host's POSIX IPC namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixBackend;

/// A handle to a named POSIX semaphore. Closed on drop.
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
}

// Safety: POSIX semaphore operations are thread-safe, and the handle is only
// closed once, in Drop.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a new semaphore, failing if the name is taken.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let c_name = CString::new(name)?;
        // Safety: c_name is a valid NUL-terminated string; the variadic mode and
        // value arguments are passed as c_uint as sem_open(3) expects.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                OBJECT_MODE,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(sem)
    }

    /// Open an existing semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = CString::new(name)?;
        // Safety: c_name is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        Self::from_raw(sem)
    }

    fn from_raw(sem: *mut libc::sem_t) -> io::Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(sem)
            .map(|sem| Self { sem })
            .ok_or_else(|| io::Error::other("sem_open returned null"))
    }

    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = CString::new(name)?;
        // Safety: c_name is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until the count can be decremented.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            // Safety: self.sem is an open semaphore for the lifetime of self.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Decrement without blocking. `Ok(false)` if the count is zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            // Safety: self.sem is an open semaphore for the lifetime of self.
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Block for at most `timeout`. `Ok(false)` on timeout.
    #[cfg(target_os = "linux")]
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        use nix::time::{ClockId, clock_gettime};
        use nix::sys::time::TimeSpec;

        let deadline = clock_gettime(ClockId::CLOCK_REALTIME)? + TimeSpec::from(timeout);
        loop {
            // Safety: self.sem is open and deadline outlives the call.
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), deadline.as_ref()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Block for at most `timeout`. `Ok(false)` on timeout.
    ///
    /// Platforms without `sem_timedwait` poll `sem_trywait`.
    #[cfg(not(target_os = "linux"))]
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        const POLL: Duration = Duration::from_millis(2);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL.min(deadline - now));
        }
    }

    pub fn post(&self) -> io::Result<()> {
        // Safety: self.sem is an open semaphore for the lifetime of self.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn value(&self) -> io::Result<usize> {
        let mut value: libc::c_int = 0;
        // Safety: self.sem is open and value is a valid out-pointer.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Linux may report waiters as a negative count.
        Ok(value.max(0) as usize)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // Safety: the handle was returned by sem_open and is closed exactly once.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// Slot counter over a named semaphore.
pub struct PosixCounter(NamedSemaphore);

impl Counter for PosixCounter {
    fn try_acquire(&self) -> io::Result<bool> {
        self.0.try_wait()
    }

    fn acquire_timeout(&self, timeout: Duration) -> io::Result<bool> {
        self.0.timed_wait(timeout)
    }

    fn release(&self) -> io::Result<()> {
        self.0.post()
    }

    fn available(&self) -> io::Result<usize> {
        self.0.value()
    }
}

/// Output lock over a binary named semaphore.
pub struct PosixLock(NamedSemaphore);

impl Lock for PosixLock {
    fn lock(&self) -> io::Result<()> {
        self.0.wait()
    }

    fn unlock(&self) -> io::Result<()> {
        self.0.post()
    }
}

/// Closing flag in a shared memory object.
pub struct SharedFlag {
    cell: NonNull<AtomicU32>,
}

// Safety: the mapping is only accessed through an AtomicU32 and is unmapped
// once, in Drop.
unsafe impl Send for SharedFlag {}
unsafe impl Sync for SharedFlag {}

impl SharedFlag {
    /// Create the object, zero-filled (cleared). Fails if the name is taken.
    pub fn create(name: &str) -> io::Result<Self> {
        Self::create_with(name, |file| {
            file.set_len(FLAG_LEN.get() as u64)?;
            Self::map(file)
        })
    }

    /// Create the name, then run `init` on the new object. The name is
    /// unlinked again if `init` fails.
    fn create_with(name: &str, init: impl FnOnce(&File) -> io::Result<Self>) -> io::Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);
        init(&file).inspect_err(|_| {
            if let Err(e) = shm_unlink(name) {
                warn!(name, error = %e, "Failed to unlink half-created flag");
            }
        })
    }

    /// Open an existing object.
    pub fn open(name: &str) -> io::Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);
        // A creator that has not sized the object yet is not ready to be opened.
        if file.metadata()?.len() < FLAG_LEN.get() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("'{}' is not initialised yet", name),
            ));
        }
        Self::map(&file)
    }

    fn map(file: &File) -> io::Result<Self> {
        // Safety: a fresh shared mapping of an object at least FLAG_LEN long;
        // the kernel returns page-aligned memory, so the cast is aligned.
        let addr = unsafe {
            mmap(
                None,
                FLAG_LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(Self { cell: addr.cast() })
    }

    pub fn unlink(name: &str) -> io::Result<()> {
        shm_unlink(name)?;
        Ok(())
    }

    fn cell(&self) -> &AtomicU32 {
        // Safety: the mapping stays valid until Drop.
        unsafe { self.cell.as_ref() }
    }
}

impl Flag for SharedFlag {
    fn raise(&self) -> io::Result<()> {
        self.cell().store(1, Ordering::Release);
        Ok(())
    }

    fn is_raised(&self) -> io::Result<bool> {
        Ok(self.cell().load(Ordering::Acquire) != 0)
    }
}

impl Drop for SharedFlag {
    fn drop(&mut self) {
        // Safety: the mapping was created by mmap with FLAG_LEN and is unmapped once.
        let _ = unsafe { munmap(self.cell.cast(), FLAG_LEN.get()) };
    }
}

impl Backend for PosixBackend {
    type Counter = PosixCounter;
    type Lock = PosixLock;
    type Flag = SharedFlag;

    fn create_counter(&self, name: &str, capacity: u32) -> io::Result<PosixCounter> {
        NamedSemaphore::create(name, capacity).map(PosixCounter)
    }

    fn open_counter(&self, name: &str) -> io::Result<PosixCounter> {
        NamedSemaphore::open(name).map(PosixCounter)
    }

    fn create_lock(&self, name: &str) -> io::Result<PosixLock> {
        NamedSemaphore::create(name, 1).map(PosixLock)
    }

    fn open_lock(&self, name: &str) -> io::Result<PosixLock> {
        NamedSemaphore::open(name).map(PosixLock)
    }

    fn create_flag(&self, name: &str) -> io::Result<SharedFlag> {
        SharedFlag::create(name)
    }

    fn open_flag(&self, name: &str) -> io::Result<SharedFlag> {
        SharedFlag::open(name)
    }

    fn unlink(&self, kind: PrimitiveKind, name: &str) -> io::Result<()> {
        match kind {
            PrimitiveKind::Counter | PrimitiveKind::Lock => NamedSemaphore::unlink(name),
            PrimitiveKind::Flag => SharedFlag::unlink(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::RunId;

    fn unique(suffix: &str) -> String {
        format!("/slotgate-test-{}-{}", RunId::generate(), suffix)
    }

    #[test]
    fn test_semaphore_counts_and_unlinks() {
        let name = unique("sem");
        let sem = NamedSemaphore::create(&name, 2).unwrap();
        let other = NamedSemaphore::open(&name).unwrap();

        assert!(sem.try_wait().unwrap());
        assert!(other.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
        assert!(!sem.timed_wait(Duration::from_millis(20)).unwrap());

        other.post().unwrap();
        assert!(sem.timed_wait(Duration::from_millis(20)).unwrap());

        NamedSemaphore::unlink(&name).unwrap();
        let err = NamedSemaphore::open(&name).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_semaphore_create_is_exclusive() {
        let name = unique("excl");
        let _sem = NamedSemaphore::create(&name, 1).unwrap();
        let err = NamedSemaphore::create(&name, 1).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_semaphore_value() {
        let name = unique("value");
        let sem = NamedSemaphore::create(&name, 3).unwrap();
        assert_eq!(sem.value().unwrap(), 3);
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 2);
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn test_shared_flag_visible_through_second_mapping() {
        let name = unique("flag");
        let flag = SharedFlag::create(&name).unwrap();
        let other = SharedFlag::open(&name).unwrap();

        assert!(!other.is_raised().unwrap());
        flag.raise().unwrap();
        flag.raise().unwrap();
        assert!(other.is_raised().unwrap());

        SharedFlag::unlink(&name).unwrap();
        // Existing mappings survive the unlink.
        assert!(other.is_raised().unwrap());
        let err = SharedFlag::open(&name).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_failed_flag_setup_leaves_no_name_behind() {
        let name = unique("halfmade");
        let err = SharedFlag::create_with(&name, |_| Err(io::Error::from_raw_os_error(libc::EFBIG)))
            .err()
            .unwrap();
        assert_eq!(err.raw_os_error(), Some(libc::EFBIG));

        let err = SharedFlag::open(&name).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        // The same name can be created again.
        let flag = SharedFlag::create(&name).unwrap();
        assert!(!flag.is_raised().unwrap());
        SharedFlag::unlink(&name).unwrap();
    }
}
