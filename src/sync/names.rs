//! Run identifiers and the primitive names derived from them.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::error::SlotgateError;

/// Prefix shared by every primitive name.
const NAME_PREFIX: &str = "slotgate";

/// Longest accepted run id. Keeps derived names well under `NAME_MAX`.
const MAX_RUN_ID_LEN: usize = 64;

/// Identifies one coordinator run. Primitive names are namespaced by it so
/// independent runs on one host never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random run id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = SlotgateError;

    /// Accepts ASCII alphanumerics, `-` and `_`, since the id ends up inside
    /// POSIX object names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_RUN_ID_LEN {
            return Err(SlotgateError::InvalidParameters(format!(
                "run id must be 1-{} characters, got {}",
                MAX_RUN_ID_LEN,
                s.len()
            )));
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(SlotgateError::InvalidParameters(format!(
                "run id '{}' contains invalid character '{}'",
                s, bad
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three well-known names for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveNames {
    pub slots: String,
    pub output: String,
    pub closing: String,
}

impl PrimitiveNames {
    pub fn for_run(run_id: &RunId) -> Self {
        Self {
            slots: format!("/{}-{}-slots", NAME_PREFIX, run_id),
            output: format!("/{}-{}-output", NAME_PREFIX, run_id),
            closing: format!("/{}-{}-closing", NAME_PREFIX, run_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct_and_valid() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().parse::<RunId>().is_ok());
    }

    #[test]
    fn test_parse_rejects_slashes_and_empty() {
        assert!("".parse::<RunId>().is_err());
        assert!("a/b".parse::<RunId>().is_err());
        assert!("has space".parse::<RunId>().is_err());
        assert!("x".repeat(65).parse::<RunId>().is_err());
        assert!("run_01-a".parse::<RunId>().is_ok());
    }

    #[test]
    fn test_names_are_namespaced_by_run() {
        let run: RunId = "abc".parse().unwrap();
        let names = PrimitiveNames::for_run(&run);
        assert_eq!(names.slots, "/slotgate-abc-slots");
        assert_eq!(names.output, "/slotgate-abc-output");
        assert_eq!(names.closing, "/slotgate-abc-closing");

        let other = PrimitiveNames::for_run(&"abd".parse().unwrap());
        assert_ne!(names.slots, other.slots);
    }
}
