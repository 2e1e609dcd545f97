//! Chunked bulk-wait.
//!
//! Waits for every signal in a collection when a single wait call can only
//! observe a bounded number of them. The collection is split into consecutive
//! slices of at most `ceiling` and each slice gets one conjunctive wait, in
//! order. Completion of all signals is all that is promised, not that they
//! were observed at the same instant.

use std::io;

use tracing::trace;

use crate::error::{Result, SlotgateError};

/// Default ceiling on handles per wait call (the classic `MAXIMUM_WAIT_OBJECTS`).
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Wait for all `signals`, `ceiling` at a time.
///
/// `wait_slice` must block until every signal in the slice it is given has
/// fired. The first failing slice aborts the whole wait with its OS error;
/// slices already completed are never waited on again. A `ceiling` of zero is
/// treated as one.
pub fn wait_all_chunked<T, F>(signals: &mut [T], ceiling: usize, mut wait_slice: F) -> Result<()>
where
    F: FnMut(&mut [T]) -> io::Result<()>,
{
    let ceiling = ceiling.max(1);
    let total = signals.len();
    let mut offset = 0;

    for slice in signals.chunks_mut(ceiling) {
        let count = slice.len();
        trace!(offset, count, total, "Waiting on slice");
        wait_slice(slice).map_err(|e| {
            SlotgateError::wait_failed(
                format!("termination handles {}..{} of {}", offset, offset + count, total),
                e,
            )
        })?;
        offset += count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    struct Signal {
        fired: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    fn spawn_signals(count: usize) -> Vec<Signal> {
        (0..count)
            .map(|i| {
                let fired = Arc::new(AtomicBool::new(false));
                let flag = fired.clone();
                let thread = thread::spawn(move || {
                    // Later signals fire first so slice order can't hide a missed wait.
                    thread::sleep(Duration::from_millis(((count - i) % 7) as u64 * 3));
                    flag.store(true, Ordering::SeqCst);
                });
                Signal {
                    fired,
                    thread: Some(thread),
                }
            })
            .collect()
    }

    fn join_slice(slice: &mut [Signal]) -> io::Result<()> {
        for signal in slice {
            if let Some(thread) = signal.thread.take() {
                thread
                    .join()
                    .map_err(|_| io::Error::other("signal thread panicked"))?;
            }
        }
        Ok(())
    }

    fn check(total: usize, ceiling: usize) -> Vec<usize> {
        let mut signals = spawn_signals(total);
        let mut sizes = Vec::new();
        wait_all_chunked(&mut signals, ceiling, |slice| {
            sizes.push(slice.len());
            join_slice(slice)
        })
        .unwrap();
        assert!(signals.iter().all(|s| s.fired.load(Ordering::SeqCst)));
        sizes
    }

    #[test]
    fn test_fewer_signals_than_ceiling() {
        assert_eq!(check(5, 8), vec![5]);
    }

    #[test]
    fn test_exactly_ceiling() {
        assert_eq!(check(8, 8), vec![8]);
    }

    #[test]
    fn test_two_ceilings_plus_three() {
        assert_eq!(check(2 * 8 + 3, 8), vec![8, 8, 3]);
    }

    #[test]
    fn test_empty_collection_never_calls_wait() {
        let mut signals: Vec<Signal> = Vec::new();
        wait_all_chunked(&mut signals, 4, |_| panic!("no slice expected")).unwrap();
    }

    #[test]
    fn test_zero_ceiling_is_one() {
        assert_eq!(check(3, 0), vec![1, 1, 1]);
    }

    #[test]
    fn test_failure_aborts_and_keeps_code() {
        let mut items = vec![0u8; 10];
        let mut calls = 0;
        let err = wait_all_chunked(&mut items, 4, |_| {
            calls += 1;
            if calls == 2 {
                Err(io::Error::from_raw_os_error(libc::ECHILD))
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        assert_eq!(calls, 2);
        assert_eq!(err.os_error_code(), Some(libc::ECHILD));
        assert!(err.to_string().contains("4..8 of 10"));
    }
}
