//! Run configuration: pool parameters and protocol tunables.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::error::{Result, SlotgateError};
use crate::sync::{PrimitiveNames, RunId};
use crate::wait::MAX_WAIT_OBJECTS;

/// Pool capacity (N) and number of work items (M).
///
/// Invariant: `capacity > 0` and `total > capacity`, so admission control is
/// always exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolParams {
    capacity: u32,
    total: usize,
}

impl PoolParams {
    pub fn new(capacity: u32, total: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SlotgateError::InvalidParameters(
                "capacity (N) must be positive".to_string(),
            ));
        }
        if total <= capacity as usize {
            return Err(SlotgateError::InvalidParameters(format!(
                "total (M = {}) must be greater than capacity (N = {})",
                total, capacity
            )));
        }
        Ok(Self { capacity, total })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Inclusive range a work unit's processing time is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    min: Duration,
    max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        if min > max {
            return Err(SlotgateError::InvalidParameters(format!(
                "minimum delay {:?} exceeds maximum {:?}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Result<Self> {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    /// A range that never sleeps.
    pub fn zero() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let ms = rng.random_range(self.min.as_millis() as u64..=self.max.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

impl Default for DelayRange {
    /// One to three seconds, matching the simulated download time.
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(3000),
        }
    }
}

/// Everything one coordinator run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub params: PoolParams,
    pub run_id: RunId,
    /// Work-unit processing time.
    pub delay: DelayRange,
    /// Most termination handles observed by one wait call.
    pub wait_ceiling: usize,
    /// How long a queued worker parks on the counter before rechecking the flag.
    pub acquire_backoff: Duration,
    /// Pause between consecutive launches.
    pub launch_stagger: Duration,
}

impl RunConfig {
    pub fn new(params: PoolParams) -> Self {
        Self {
            params,
            run_id: RunId::generate(),
            delay: DelayRange::default(),
            wait_ceiling: MAX_WAIT_OBJECTS,
            acquire_backoff: Duration::from_millis(50),
            launch_stagger: Duration::from_millis(10),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_delay(mut self, delay: DelayRange) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_wait_ceiling(mut self, ceiling: usize) -> Self {
        self.wait_ceiling = ceiling.max(1);
        self
    }

    pub fn with_acquire_backoff(mut self, backoff: Duration) -> Self {
        self.acquire_backoff = backoff;
        self
    }

    pub fn with_launch_stagger(mut self, stagger: Duration) -> Self {
        self.launch_stagger = stagger;
        self
    }

    pub fn names(&self) -> PrimitiveNames {
        PrimitiveNames::for_run(&self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_params_validation() {
        assert!(PoolParams::new(2, 5).is_ok());
        assert!(PoolParams::new(1, 2).is_ok());

        let err = PoolParams::new(0, 5).unwrap_err();
        assert!(matches!(err, SlotgateError::InvalidParameters(_)));

        let err = PoolParams::new(5, 3).unwrap_err();
        assert!(err.to_string().contains("must be greater than capacity"));

        assert!(PoolParams::new(3, 3).is_err());
    }

    #[test]
    fn test_delay_range() {
        assert!(DelayRange::from_millis(20, 10).is_err());

        let fixed = DelayRange::from_millis(7, 7).unwrap();
        assert_eq!(fixed.sample(&mut rand::rng()), Duration::from_millis(7));

        let range = DelayRange::from_millis(10, 20).unwrap();
        let mut rng = rand::rng();
        for _ in 0..100 {
            let d = range.sample(&mut rng);
            assert!(d >= range.min() && d <= range.max());
        }
    }

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::new(PoolParams::new(2, 5).unwrap());
        assert_eq!(config.wait_ceiling, MAX_WAIT_OBJECTS);
        assert_eq!(config.delay, DelayRange::default());
        assert!(config.names().slots.contains(config.run_id.as_str()));

        let config = config.with_wait_ceiling(0);
        assert_eq!(config.wait_ceiling, 1);
    }
}
