//! Weighted task definitions and selection
//!
//! Tasks are registered explicitly at startup into a [`TaskRegistry`]. Building
//! the registry produces a [`TaskSelector`], which owns a cumulative-weight
//! table computed once. Selection is a single uniform draw plus a binary
//! search:
//!
//! ```text
//! weights     A:5  B:2  C:1
//! cumulative      5    7    8
//! draw in [0, 8): 0..5 -> A, 5..7 -> B, 7 -> C
//! ```
//!
//! Over many draws each task's frequency converges to `weight / total`.
use std::{fmt, num::NonZeroU32, sync::Arc};

use async_trait::async_trait;
use rand::Rng;

use crate::{
    auth::Token,
    error::{Error, Result},
    metric::RequestResult,
};

/// One unit of work a virtual user performs against the target service.
///
/// Tasks classify their own responses into a [`RequestResult`]; they never
/// return errors. Implementations are shared by every virtual user, so keep
/// heavy resources (HTTP clients, connection pools) inside the task and clone
/// handles rather than creating them per call.
///
/// # Example
/// ```rust
/// use std::time::Instant;
/// use suru::{async_trait, RequestResult, Task, Token};
///
/// struct Ping;
///
/// #[async_trait]
/// impl Task for Ping {
///     async fn execute(&self, _token: &Token) -> RequestResult {
///         let start = Instant::now();
///         // talk to the service here
///         RequestResult::success(200, start.elapsed())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, token: &Token) -> RequestResult;
}

/// A named, weighted task.
#[derive(Clone)]
pub struct TaskDefinition {
    name: Arc<str>,
    weight: NonZeroU32,
    task: Arc<dyn Task>,
}

impl TaskDefinition {
    /// Fails with [`Error::InvalidTaskWeight`] when `weight` is zero.
    pub fn new(name: impl Into<Arc<str>>, weight: u32, task: impl Task + 'static) -> Result<Self> {
        Self::from_arc(name, weight, Arc::new(task))
    }

    pub fn from_arc(name: impl Into<Arc<str>>, weight: u32, task: Arc<dyn Task>) -> Result<Self> {
        let name = name.into();
        let weight = NonZeroU32::new(weight).ok_or_else(|| Error::InvalidTaskWeight {
            name: name.to_string(),
        })?;
        Ok(Self { name, weight, task })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight.get()
    }

    pub async fn execute(&self, token: &Token) -> RequestResult {
        self.task.execute(token).await
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Tasks collected at startup.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Freeze the registry into a selector.
    pub fn build(self) -> Result<TaskSelector> {
        if self.tasks.is_empty() {
            return Err(Error::NoTasks);
        }
        let mut running = 0u64;
        let cumulative = self
            .tasks
            .iter()
            .map(|t| {
                running += u64::from(t.weight());
                running
            })
            .collect();
        Ok(TaskSelector {
            tasks: self.tasks,
            cumulative,
            total: running,
        })
    }
}

/// Weighted random selection over a frozen set of tasks.
#[derive(Debug, Clone)]
pub struct TaskSelector {
    tasks: Vec<TaskDefinition>,
    cumulative: Vec<u64>,
    total: u64,
}

impl TaskSelector {
    /// Pick a task using the thread-local RNG.
    pub fn select(&self) -> &TaskDefinition {
        self.select_with(&mut rand::rng())
    }

    /// Pick a task using `rng`. Deterministic for a seeded RNG.
    pub fn select_with<R: Rng>(&self, rng: &mut R) -> &TaskDefinition {
        let draw = rng.random_range(0..self.total);
        let idx = self.cumulative.partition_point(|&c| c <= draw);
        &self.tasks[idx]
    }

    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::{collections::HashMap, time::Duration};

    struct Fixed;

    #[async_trait]
    impl Task for Fixed {
        async fn execute(&self, _: &Token) -> RequestResult {
            RequestResult::success(200, Duration::ZERO)
        }
    }

    fn selector(weights: &[(&str, u32)]) -> TaskSelector {
        weights
            .iter()
            .fold(TaskRegistry::new(), |registry, (name, weight)| {
                registry.register(TaskDefinition::new(*name, *weight, Fixed).unwrap())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn frequencies_converge_to_weights() {
        let selector = selector(&[("A", 5), ("B", 2), ("C", 1)]);
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 80_000;
        let mut seen: HashMap<String, u32> = HashMap::new();
        for _ in 0..draws {
            *seen
                .entry(selector.select_with(&mut rng).name().to_string())
                .or_default() += 1;
        }

        for (name, expected) in [("A", 0.625), ("B", 0.25), ("C", 0.125)] {
            let observed = f64::from(seen[name]) / f64::from(draws);
            assert!(
                (observed - expected).abs() < 0.02,
                "{name}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn seeded_selection_is_deterministic() {
        let selector = selector(&[("A", 3), ("B", 1)]);
        let picks = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..50)
                .map(|_| selector.select_with(&mut rng).name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(42), picks(42));
    }

    #[test]
    fn cumulative_table_boundaries() {
        let selector = selector(&[("A", 5), ("B", 2), ("C", 1)]);
        assert_eq!(selector.total_weight(), 8);
        assert_eq!(selector.cumulative, vec![5, 7, 8]);
        let at = |draw: u64| {
            let idx = selector.cumulative.partition_point(|&c| c <= draw);
            selector.tasks[idx].name().to_string()
        };
        assert_eq!(at(0), "A");
        assert_eq!(at(4), "A");
        assert_eq!(at(5), "B");
        assert_eq!(at(6), "B");
        assert_eq!(at(7), "C");
    }

    #[test]
    fn single_task_is_always_selected() {
        let selector = selector(&[("only", 1)]);
        for _ in 0..100 {
            assert_eq!(&**selector.select().name(), "only");
        }
    }

    #[test]
    fn zero_weight_is_rejected() {
        let err = TaskDefinition::new("broken", 0, Fixed).unwrap_err();
        assert!(matches!(err, Error::InvalidTaskWeight { name } if name == "broken"));
    }

    #[test]
    fn empty_registry_cannot_build() {
        assert!(matches!(TaskRegistry::new().build(), Err(Error::NoTasks)));
    }

    #[tokio::test]
    async fn definitions_delegate_to_their_task() {
        let def = TaskDefinition::new("list", 2, Fixed).unwrap();
        let result = def.execute(&Token::new("t")).await;
        assert_eq!(result.status, Some(200));
        assert_eq!(def.weight(), 2);
    }
}
