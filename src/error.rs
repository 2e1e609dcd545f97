//! Error types for slotgate.

use std::io;

use thiserror::Error;

use crate::sync::PrimitiveKind;

/// Main error type for slotgate.
#[derive(Error, Debug)]
pub enum SlotgateError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Failed to create {kind} '{name}'")]
    PrimitiveCreation {
        kind: PrimitiveKind,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{kind} '{name}' not found (coordinator not running or already shut down)")]
    PrimitiveNotFound {
        kind: PrimitiveKind,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open {kind} '{name}'")]
    PrimitiveOpen {
        kind: PrimitiveKind,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} was already released by this process")]
    Released(PrimitiveKind),

    #[error("Failed to launch worker {index} ('{item}')")]
    Launch {
        index: usize,
        item: String,
        #[source]
        source: io::Error,
    },

    #[error("No workers started: all {requested} launches failed")]
    NoWorkersStarted { requested: usize },

    #[error("Wait failed on {what}")]
    WaitFailure {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to raise {what}")]
    Signal {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to release {what}")]
    Release {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SlotgateError {
    /// Raw OS error code behind a wait, release or primitive failure, if any.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Self::PrimitiveCreation { source, .. }
            | Self::PrimitiveNotFound { source, .. }
            | Self::PrimitiveOpen { source, .. }
            | Self::Launch { source, .. }
            | Self::WaitFailure { source, .. }
            | Self::Signal { source, .. }
            | Self::Release { source, .. }
            | Self::Io(source) => source.raw_os_error(),
            Self::InvalidParameters(_) | Self::Released(_) | Self::NoWorkersStarted { .. } => None,
        }
    }

    /// Map an error from opening a primitive, separating "not there" from other failures.
    pub(crate) fn open_failed(kind: PrimitiveKind, name: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::PrimitiveNotFound {
                kind,
                name: name.to_string(),
                source,
            }
        } else {
            Self::PrimitiveOpen {
                kind,
                name: name.to_string(),
                source,
            }
        }
    }

    pub(crate) fn wait_failed(what: impl Into<String>, source: io::Error) -> Self {
        Self::WaitFailure {
            what: what.into(),
            source,
        }
    }
}

/// Result type alias for slotgate operations.
pub type Result<T> = std::result::Result<T, SlotgateError>;
