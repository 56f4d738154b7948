use std::{path::PathBuf, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    shape::{ConstantShape, LoadShape, ShapeKind, SpikeRange, StepTable, SteppedShape},
};

/// Uniform pause between two tasks of the same virtual user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitTime {
    pub min: Duration,
    pub max: Duration,
}

impl WaitTime {
    pub fn between(min: Duration, max: Duration) -> Result<Self> {
        if min > max {
            return Err(Error::InvalidConfig(format!(
                "wait time minimum {min:?} exceeds maximum {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn fixed(wait: Duration) -> Self {
        Self {
            min: wait,
            max: wait,
        }
    }

    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        let nanos = rng.random_range(self.min.as_nanos()..=self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for WaitTime {
    /// One to three seconds.
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(3),
        }
    }
}

/// How a virtual user retries token acquisition.
///
/// Backoff is deterministic: `base * 2^(failures - 1)`, capped at
/// `max_backoff`. After `max_consecutive_failures` failures in a row the user
/// gives up and the scheduler replaces it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct AuthRetryPolicy {
    #[builder(default = 5)]
    pub max_consecutive_failures: u32,
    #[builder(default = Duration::from_millis(500))]
    pub base_backoff: Duration,
    #[builder(default = Duration::from_secs(8))]
    pub max_backoff: Duration,
}

impl AuthRetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }
}

impl Default for AuthRetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Immutable run parameters, handed to the scheduler at construction.
///
/// Which shape parameters apply depends on [`RunConfig::shape`]:
///
/// | parameter       | constant          | stepped                   | spiked |
/// |-----------------|-------------------|---------------------------|--------|
/// | `users`         | population (1)    | ceiling (2000)            | -      |
/// | `spawn_rate`    | users/s (1)       | users/s (10)              | -      |
/// | `run_time`      | required          | run length (5m)           | -      |
/// | `step_base`     | -                 | first population (100)    | -      |
/// | `step_interval` | -                 | doubling period (1m)      | -      |
/// | `spike_ranges`  | -                 | -                         | table (built-in spikes) |
///
/// Setting a parameter the chosen profile does not use is a configuration
/// error.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RunConfig {
    /// Base URL of the target service.
    #[builder(setter(into))]
    pub host: String,
    #[builder(default)]
    pub shape: ShapeKind,
    #[builder(default, setter(strip_option))]
    pub users: Option<usize>,
    /// Users started per second.
    #[builder(default, setter(strip_option))]
    pub spawn_rate: Option<usize>,
    #[builder(default, setter(strip_option))]
    pub run_time: Option<Duration>,
    #[builder(default, setter(strip_option))]
    pub step_base: Option<usize>,
    #[builder(default, setter(strip_option))]
    pub step_interval: Option<Duration>,
    #[builder(default, setter(strip_option))]
    pub spike_ranges: Option<Vec<SpikeRange>>,
    /// Hard stop regardless of what the shape says.
    #[builder(default, setter(strip_option))]
    pub max_run_time: Option<Duration>,
    #[builder(default)]
    pub wait_time: WaitTime,
    #[builder(default)]
    pub auth_retry: AuthRetryPolicy,
    /// Scheduler control loop period.
    #[builder(default = Duration::from_secs(1))]
    pub tick: Duration,
    /// How often live metrics are reported.
    #[builder(default = Duration::from_secs(5))]
    pub report_interval: Duration,
    /// Headless runs log plain lines; interactive runs redraw a dashboard.
    #[builder(default = true)]
    pub headless: bool,
    #[builder(default, setter(strip_option))]
    pub report_file: Option<PathBuf>,
    /// Seed for every random choice (task picks, wait times).
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(Error::InvalidConfig("tick must be positive".into()));
        }
        if self.report_interval.is_zero() {
            return Err(Error::InvalidConfig("report interval must be positive".into()));
        }
        if self.wait_time.min > self.wait_time.max {
            return Err(Error::InvalidConfig(
                "wait time minimum exceeds maximum".into(),
            ));
        }
        if self.max_run_time.is_some_and(|max| max.is_zero()) {
            return Err(Error::InvalidConfig("max run time must be positive".into()));
        }
        if self.auth_retry.max_consecutive_failures == 0 {
            return Err(Error::InvalidConfig(
                "auth retry budget must allow at least one attempt".into(),
            ));
        }
        self.reject_unused_shape_params()
    }

    fn reject_unused_shape_params(&self) -> Result<()> {
        let params = [
            ("users", self.users.is_some()),
            ("spawn rate", self.spawn_rate.is_some()),
            ("run time", self.run_time.is_some()),
            ("step base", self.step_base.is_some()),
            ("step interval", self.step_interval.is_some()),
            ("spike ranges", self.spike_ranges.is_some()),
        ];
        let used: &[&str] = match self.shape {
            ShapeKind::Constant => &["users", "spawn rate", "run time"],
            ShapeKind::Stepped => &["users", "spawn rate", "run time", "step base", "step interval"],
            ShapeKind::Spiked => &["spike ranges"],
        };
        let unused: Vec<&str> = params
            .iter()
            .filter(|(name, set)| *set && !used.contains(name))
            .map(|(name, _)| *name)
            .collect();
        if unused.is_empty() {
            return Ok(());
        }
        Err(Error::InvalidConfig(format!(
            "the {} profile does not use: {}",
            self.shape,
            unused.join(", ")
        )))
    }

    /// Build the load shape this configuration selects.
    pub fn load_shape(&self) -> Result<Box<dyn LoadShape>> {
        self.reject_unused_shape_params()?;
        match self.shape {
            ShapeKind::Constant => {
                let duration = self.run_time.ok_or_else(|| {
                    Error::InvalidConfig("the constant profile needs a run time".into())
                })?;
                Ok(Box::new(ConstantShape::new(
                    self.users.unwrap_or(1),
                    self.spawn_rate.unwrap_or(1),
                    duration,
                )?))
            }
            ShapeKind::Stepped => {
                let preset = SteppedShape::doubling();
                Ok(Box::new(SteppedShape::new(
                    self.step_base.unwrap_or(preset.base()),
                    self.step_interval.unwrap_or(preset.interval()),
                    self.users.unwrap_or(preset.ceiling()),
                    self.spawn_rate.unwrap_or(preset.spawn_rate()),
                    self.run_time.unwrap_or(preset.duration()),
                )?))
            }
            ShapeKind::Spiked => match &self.spike_ranges {
                Some(ranges) => Ok(Box::new(StepTable::from_ranges(ranges.clone())?)),
                None => Ok(Box::new(StepTable::spikes())),
            },
        }
    }
}
