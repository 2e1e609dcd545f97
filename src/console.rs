//! Console lines serialized across processes by the output lock.
//!
//! Each line is written while holding the run's output lock, so lines from
//! different workers and the coordinator never interleave mid-line. Tracing
//! diagnostics go to stderr separately and are not covered by the lock.

use std::fmt;
use std::io::{self, Write};

use crate::error::Result;
use crate::sync::{Backend, PrimitiveSet};

/// Writes prefixed lines under a [`PrimitiveSet`]'s output lock.
pub struct Console<W: Write> {
    prefix: String,
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(prefix: impl Into<String>, out: W) -> Self {
        Self {
            prefix: prefix.into(),
            out,
        }
    }

    /// Console for a worker: `[pid 4242 | worker 3] `.
    pub fn for_worker(index: usize, out: W) -> Self {
        Self::new(
            format!("[pid {} | worker {}] ", std::process::id(), index),
            out,
        )
    }

    /// Console for the coordinator: `[coordinator] `.
    pub fn for_coordinator(out: W) -> Self {
        Self::new("[coordinator] ", out)
    }

    /// Write one line while holding the output lock.
    pub fn line<B: Backend>(
        &mut self,
        set: &PrimitiveSet<B>,
        args: fmt::Arguments<'_>,
    ) -> Result<()> {
        let _guard = set.output()?;
        self.out.write_all(self.prefix.as_bytes())?;
        self.out.write_fmt(args)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    /// Write one line without the lock, for when no primitive set exists.
    pub fn line_unlocked(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.out.write_all(self.prefix.as_bytes())?;
        self.out.write_fmt(args)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// A cloneable handle to the process's stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl Write for StdoutSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::stdout().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// A cloneable in-memory sink. Every `write` call appends atomically, but a
/// line built from several calls may interleave with other writers unless the
/// caller serializes them.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        self.bytes
            .lock()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| io::Error::other("buffer mutex poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MemoryRegistry, PrimitiveNames, RunId};

    #[test]
    fn test_line_is_prefixed_and_terminated() {
        let registry = MemoryRegistry::new();
        let set = PrimitiveSet::create_all(
            registry,
            PrimitiveNames::for_run(&RunId::generate()),
            1,
        )
        .unwrap();
        let buffer = SharedBuffer::new();
        let mut console = Console::new("[t] ", buffer.clone());

        console.line(&set, format_args!("hello {}", 42)).unwrap();
        console.line_unlocked(format_args!("bye")).unwrap();

        assert_eq!(buffer.lines(), vec!["[t] hello 42", "[t] bye"]);
    }

    #[test]
    fn test_line_fails_after_release() {
        let registry = MemoryRegistry::new();
        let mut set = PrimitiveSet::create_all(
            registry,
            PrimitiveNames::for_run(&RunId::generate()),
            1,
        )
        .unwrap();
        set.release_all();

        let mut console = Console::for_coordinator(SharedBuffer::new());
        assert!(console.line(&set, format_args!("x")).is_err());
    }
}
