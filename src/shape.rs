//! Load shapes: time-indexed population profiles
//!
//! A [`LoadShape`] is a pure function of elapsed run time. Every tick the
//! scheduler asks the shape how many virtual users should be alive and how fast
//! it may get there; the shape answers with a [`ShapeDecision`] or tells the
//! run to [`ShapeTick::Stop`].
//!
//! Three profiles are built in:
//!
//! - [`ConstantShape`]: a fixed population for a fixed duration.
//! - [`SteppedShape`]: the population doubles every `interval` until it hits a
//!   ceiling. From the fifth step on it holds the ceiling.
//! - [`StepTable`]: an explicit table of steps, usually built from half-open
//!   `[start, end)` ranges with [`StepTable::from_ranges`] to describe spikes.
//!
//! ```text
//! stepped: target(t) = min(ceiling, base * 2^floor(t / interval))
//! table:   target(t) = steps[last i where steps[i].start <= t].target_users
//! ```
//!
//! Spike tables can also be read from JSON with [`read_spike_ranges`]; offsets
//! in those files are seconds.
//!
//! Shapes validate themselves on construction. A shape that made it past `new`
//! can be evaluated from any thread, any number of times, and always gives the
//! same answer for the same `elapsed`.
use std::{fmt, path::Path, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Population target for the current tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDecision {
    pub target_users: usize,
    /// Users per second the scheduler may start while catching up.
    pub spawn_rate: usize,
}

impl ShapeDecision {
    pub fn new(target_users: usize, spawn_rate: usize) -> Self {
        Self {
            target_users,
            spawn_rate,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeTick {
    Run(ShapeDecision),
    /// No further spawning; drain the existing users.
    Stop,
}

impl ShapeTick {
    pub fn decision(self) -> Option<ShapeDecision> {
        match self {
            ShapeTick::Run(d) => Some(d),
            ShapeTick::Stop => None,
        }
    }
}

/// A time-indexed concurrency profile.
///
/// Implementations must be deterministic and free of side effects: the
/// scheduler may call `evaluate` at arbitrary times and expects the same
/// answer for the same input.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use suru::shape::{LoadShape, ShapeDecision, ShapeTick};
///
/// struct Sawtooth;
///
/// impl LoadShape for Sawtooth {
///     fn evaluate(&self, elapsed: Duration) -> ShapeTick {
///         if elapsed > Duration::from_secs(60) {
///             return ShapeTick::Stop;
///         }
///         let users = (elapsed.as_secs() % 10) as usize * 10;
///         ShapeTick::Run(ShapeDecision::new(users, 10))
///     }
/// }
/// ```
pub trait LoadShape: Send + Sync {
    fn evaluate(&self, elapsed: Duration) -> ShapeTick;
}

impl<S: LoadShape + ?Sized> LoadShape for Box<S> {
    fn evaluate(&self, elapsed: Duration) -> ShapeTick {
        (**self).evaluate(elapsed)
    }
}

impl<S: LoadShape + ?Sized> LoadShape for Arc<S> {
    fn evaluate(&self, elapsed: Duration) -> ShapeTick {
        (**self).evaluate(elapsed)
    }
}

fn require_spawn_rate(spawn_rate: usize) -> Result<()> {
    if spawn_rate == 0 {
        return Err(Error::InvalidShape("spawn rate must be positive".into()));
    }
    Ok(())
}

/// Fixed population held for `duration`.
#[derive(Clone, Copy, Debug)]
pub struct ConstantShape {
    users: usize,
    spawn_rate: usize,
    duration: Duration,
}

impl ConstantShape {
    pub fn new(users: usize, spawn_rate: usize, duration: Duration) -> Result<Self> {
        require_spawn_rate(spawn_rate)?;
        if duration.is_zero() {
            return Err(Error::InvalidShape("run duration must be positive".into()));
        }
        Ok(Self {
            users,
            spawn_rate,
            duration,
        })
    }
}

impl LoadShape for ConstantShape {
    fn evaluate(&self, elapsed: Duration) -> ShapeTick {
        if elapsed > self.duration {
            return ShapeTick::Stop;
        }
        ShapeTick::Run(ShapeDecision::new(self.users, self.spawn_rate))
    }
}

/// Population that doubles every `interval` up to `ceiling`.
///
/// Steps from `peak_step` on (the fifth step, index 4, unless changed with
/// [`SteppedShape::with_peak_step`]) are pinned to `ceiling`, so a full run
/// spends its last interval at peak load even when doubling alone would fall
/// short of it. Runs shorter than that follow the doubling from `base`.
#[derive(Clone, Copy, Debug)]
pub struct SteppedShape {
    base: usize,
    interval: Duration,
    ceiling: usize,
    spawn_rate: usize,
    duration: Duration,
    peak_step: u32,
}

impl SteppedShape {
    pub fn new(
        base: usize,
        interval: Duration,
        ceiling: usize,
        spawn_rate: usize,
        duration: Duration,
    ) -> Result<Self> {
        require_spawn_rate(spawn_rate)?;
        if interval.is_zero() {
            return Err(Error::InvalidShape("step interval must be positive".into()));
        }
        if base == 0 {
            return Err(Error::InvalidShape("base population must be positive".into()));
        }
        if duration.is_zero() {
            return Err(Error::InvalidShape("run duration must be positive".into()));
        }
        if ceiling < base {
            return Err(Error::InvalidShape(format!(
                "ceiling ({ceiling}) is below the base population ({base})"
            )));
        }
        Ok(Self {
            base,
            interval,
            ceiling,
            spawn_rate,
            duration,
            peak_step: Self::PEAK_STEP,
        })
    }

    pub const PEAK_STEP: u32 = 4;

    /// 100 users doubling every minute for five minutes, capped at 2000,
    /// spawning 10 users per second.
    pub fn doubling() -> Self {
        Self {
            base: 100,
            interval: Duration::from_secs(60),
            ceiling: 2000,
            spawn_rate: 10,
            duration: Duration::from_secs(300),
            peak_step: Self::PEAK_STEP,
        }
    }

    /// Same as [`SteppedShape::doubling`] over a different run length.
    pub fn doubling_for(duration: Duration) -> Result<Self> {
        let preset = Self::doubling();
        Self::new(
            preset.base,
            preset.interval,
            preset.ceiling,
            preset.spawn_rate,
            duration,
        )
    }

    /// Pin steps from `step` on to the ceiling. `u32::MAX` leaves pure doubling.
    pub fn with_peak_step(mut self, step: u32) -> Self {
        self.peak_step = step;
        self
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn spawn_rate(&self) -> usize {
        self.spawn_rate
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn step_at(&self, elapsed: Duration) -> u128 {
        elapsed.as_nanos() / self.interval.as_nanos()
    }
}

impl LoadShape for SteppedShape {
    fn evaluate(&self, elapsed: Duration) -> ShapeTick {
        if elapsed > self.duration {
            return ShapeTick::Stop;
        }
        let step = self.step_at(elapsed);
        let target = if step >= u128::from(self.peak_step) {
            self.ceiling
        } else {
            u32::try_from(step)
                .ok()
                .and_then(|s| 1usize.checked_shl(s))
                .and_then(|factor| self.base.checked_mul(factor))
                .map_or(self.ceiling, |t| t.min(self.ceiling))
        };
        ShapeTick::Run(ShapeDecision::new(target, self.spawn_rate))
    }
}

/// One row of a [`StepTable`]: from `start` on, hold `target_users`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeStep {
    #[serde(with = "secs")]
    pub start: Duration,
    pub target_users: usize,
    pub spawn_rate: usize,
}

impl ShapeStep {
    pub fn new(start: Duration, target_users: usize, spawn_rate: usize) -> Self {
        Self {
            start,
            target_users,
            spawn_rate,
        }
    }
}

/// A half-open `[start, end)` range of a spike profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpikeRange {
    #[serde(with = "secs")]
    pub start: Duration,
    #[serde(with = "secs")]
    pub end: Duration,
    pub target_users: usize,
    pub spawn_rate: usize,
}

impl SpikeRange {
    pub fn new(start: Duration, end: Duration, target_users: usize, spawn_rate: usize) -> Self {
        Self {
            start,
            end,
            target_users,
            spawn_rate,
        }
    }
}

/// Read spike ranges from a JSON array such as
/// `[{"start": 0, "end": 30, "target_users": 100, "spawn_rate": 10}]`.
///
/// The ranges are only parsed here; [`StepTable::from_ranges`] validates them.
pub fn read_spike_ranges(path: impl AsRef<Path>) -> Result<Vec<SpikeRange>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Offsets as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Explicit step sequence ending at `end`.
///
/// The active step is the last one whose `start <= elapsed`, so a gap between
/// two spike ranges keeps the most recently started range's values instead of
/// dropping to zero.
#[derive(Clone, Debug)]
pub struct StepTable {
    steps: Vec<ShapeStep>,
    end: Duration,
}

impl StepTable {
    pub fn new(steps: Vec<ShapeStep>, end: Duration) -> Result<Self> {
        let Some(first) = steps.first() else {
            return Err(Error::InvalidShape("step table is empty".into()));
        };
        if !first.start.is_zero() {
            return Err(Error::InvalidShape(format!(
                "first step must start at 0s, got {:?}",
                first.start
            )));
        }
        for pair in steps.windows(2) {
            if pair[1].start <= pair[0].start {
                return Err(Error::InvalidShape(format!(
                    "step offsets must be strictly increasing ({:?} after {:?})",
                    pair[1].start, pair[0].start
                )));
            }
        }
        for step in &steps {
            require_spawn_rate(step.spawn_rate)?;
        }
        // first() succeeded so last() cannot fail
        let last_start = steps.last().map_or(Duration::ZERO, |s| s.start);
        if end <= last_start {
            return Err(Error::InvalidShape(format!(
                "table end {end:?} must come after the last step at {last_start:?}"
            )));
        }
        Ok(Self { steps, end })
    }

    /// Build a table from non-overlapping half-open ranges, in order.
    pub fn from_ranges(ranges: Vec<SpikeRange>) -> Result<Self> {
        let mut steps = Vec::with_capacity(ranges.len());
        let mut end = Duration::ZERO;
        for (i, range) in ranges.iter().enumerate() {
            if range.end <= range.start {
                return Err(Error::InvalidShape(format!(
                    "range {i} is empty: [{:?}, {:?})",
                    range.start, range.end
                )));
            }
            if range.start < end {
                return Err(Error::InvalidShape(format!(
                    "range {i} starts at {:?}, before the previous range ends at {end:?}",
                    range.start
                )));
            }
            steps.push(ShapeStep::new(
                range.start,
                range.target_users,
                range.spawn_rate,
            ));
            end = range.end;
        }
        Self::new(steps, end)
    }

    /// 100 users with two spikes (1000, then 2000) over two and a half minutes.
    pub fn spikes() -> Self {
        let secs = Duration::from_secs;
        Self {
            steps: vec![
                ShapeStep::new(secs(0), 100, 10),
                ShapeStep::new(secs(30), 1000, 50),
                ShapeStep::new(secs(60), 100, 10),
                ShapeStep::new(secs(90), 2000, 100),
                ShapeStep::new(secs(120), 100, 10),
            ],
            end: secs(150),
        }
    }

    pub fn steps(&self) -> &[ShapeStep] {
        &self.steps
    }

    pub fn end(&self) -> Duration {
        self.end
    }
}

impl LoadShape for StepTable {
    fn evaluate(&self, elapsed: Duration) -> ShapeTick {
        if elapsed >= self.end {
            return ShapeTick::Stop;
        }
        let idx = self.steps.partition_point(|s| s.start <= elapsed);
        // the first step starts at 0, so idx >= 1
        match self.steps.get(idx.saturating_sub(1)) {
            Some(step) => ShapeTick::Run(ShapeDecision::new(step.target_users, step.spawn_rate)),
            None => ShapeTick::Stop,
        }
    }
}

/// Built-in profiles, selectable by name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    #[default]
    Constant,
    Stepped,
    Spiked,
}

impl FromStr for ShapeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(ShapeKind::Constant),
            "stepped" | "step" => Ok(ShapeKind::Stepped),
            "spiked" | "spike" => Ok(ShapeKind::Spiked),
            other => Err(Error::UnknownShape(other.to_string())),
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShapeKind::Constant => "constant",
            ShapeKind::Stepped => "stepped",
            ShapeKind::Spiked => "spiked",
        };
        f.write_str(name)
    }
}
