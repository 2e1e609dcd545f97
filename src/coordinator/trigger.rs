//! What tells a running coordinator to start closing.

use std::io::{self, BufRead};
use std::sync::mpsc;
use std::thread;

use serde::Serialize;
use tracing::debug;

/// Why closing began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The operator pressed Enter.
    Operator,
    /// Ctrl+C.
    Interrupted,
    /// Stdin reached end of file.
    InputClosed,
    /// Closing was requested up front.
    Immediate,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Operator => "operator request",
            Self::Interrupted => "interrupt",
            Self::InputClosed => "end of input",
            Self::Immediate => "immediate close",
        };
        write!(f, "{}", s)
    }
}

/// A single blocking wait for the close request.
pub trait CloseTrigger {
    /// Line shown to the operator before waiting, if any.
    fn prompt(&self) -> Option<&str> {
        None
    }

    fn wait(&mut self) -> CloseReason;
}

impl<F> CloseTrigger for F
where
    F: FnMut() -> CloseReason,
{
    fn wait(&mut self) -> CloseReason {
        self()
    }
}

/// Fires as soon as it is waited on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl CloseTrigger for Immediate {
    fn wait(&mut self) -> CloseReason {
        CloseReason::Immediate
    }
}

/// Enter or end of file on stdin, or Ctrl+C, whichever comes first.
pub struct OperatorTrigger {
    rx: mpsc::Receiver<CloseReason>,
}

impl OperatorTrigger {
    /// Install the Ctrl+C handler and start watching stdin.
    ///
    /// Only one handler can exist per process, so this can succeed once.
    pub fn install() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();

        let interrupt_tx = tx.clone();
        ctrlc::set_handler(move || {
            let _ = interrupt_tx.send(CloseReason::Interrupted);
        })
        .map_err(io::Error::other)?;

        thread::Builder::new()
            .name("close-trigger".to_string())
            .spawn(move || {
                let mut line = String::new();
                let reason = match io::stdin().lock().read_line(&mut line) {
                    Ok(0) | Err(_) => CloseReason::InputClosed,
                    Ok(_) => CloseReason::Operator,
                };
                debug!(%reason, "Stdin close trigger fired");
                let _ = tx.send(reason);
            })?;

        Ok(Self { rx })
    }
}

impl CloseTrigger for OperatorTrigger {
    fn prompt(&self) -> Option<&str> {
        Some("press Enter (or Ctrl+C) to stop processing")
    }

    fn wait(&mut self) -> CloseReason {
        // The interrupt handler keeps a sender alive, so this only errors if
        // both producers are gone.
        self.rx.recv().unwrap_or(CloseReason::InputClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_trigger() {
        let mut calls = 0;
        let mut trigger = || {
            calls += 1;
            CloseReason::Operator
        };
        assert_eq!(trigger.prompt(), None);
        assert_eq!(CloseTrigger::wait(&mut trigger), CloseReason::Operator);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_immediate() {
        assert_eq!(Immediate.wait(), CloseReason::Immediate);
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CloseReason::InputClosed).unwrap(),
            "\"input_closed\""
        );
    }
}
