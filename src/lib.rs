//! Suru: shaped virtual-user load generation.
//!
//! Suru drives a time-varying population of simulated clients ("virtual users")
//! against a service and measures how it copes. Each user authenticates on its
//! own, picks weighted tasks at random, waits a little between them, and reports
//! every outcome to a shared metrics sink. A load shape decides, tick by tick, how
//! many users should be alive.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`LoadShape`]: a pure function of elapsed time returning the target
//!   population and spawn rate. Constant, stepped and spiked profiles are built in.
//! - [`Scheduler`]: reconciles the live population with the shape on a fixed tick,
//!   spawning at most `spawn_rate` users per second and retiring excess users
//!   without blocking.
//! - [`VirtualUser`]: one simulated client. Owns an [`AuthSession`], runs the
//!   select → execute → classify → wait loop, and recovers from expired tokens.
//! - [`Task`]: one operation against the target. Tasks classify their response
//!   into a [`RequestResult`]; they never fail with an error.
//! - [`Aggregate`]: mergeable raw statistics; [`MetricsSink`] shards them so users
//!   do not contend on a single lock.
//! - [`Reporter`]: consumes a [`RunSummary`] and sends it somewhere (console, JSON
//!   file).
//! - [`Scenario`]: glues all of the above together and runs it.
//!
//! # Where to start
//!
//! Build a [`TaskRegistry`] (or use [`http::default_tasks`]), pick a
//! [`TokenProvider`] such as [`HttpTokenProvider`], describe the run with
//! [`RunConfig`], and call [`Scenario::run`].

/// Metric aggregation and the shared sink
pub mod aggregate;
/// Per-user token sessions
pub mod auth;
/// Run configuration
pub mod config;
pub mod error;
/// HTTP tasks and token provider
pub mod http;
/// Single request outcomes
pub mod metric;
/// Summaries and reporters
pub mod report;
/// Glues shape, tasks, auth and reporting together
pub mod scenario;
/// Population control loop
pub mod scheduler;
/// Load shapes
pub mod shape;
/// Weighted tasks
pub mod task;
/// Virtual users
pub mod user;

pub use aggregate::{Aggregate, MetricsSink, RunStats};
pub use async_trait::async_trait;
pub use auth::{AuthError, AuthSession, Credentials, Grant, Token, TokenProvider};
pub use config::{AuthRetryPolicy, RunConfig, WaitTime};
pub use error::{Error, Result};
pub use http::{HttpTask, HttpTokenProvider};
pub use metric::{Outcome, RequestResult, Verdict};
pub use report::{ConsoleReporter, JsonFileReporter, Reporter, RunSummary};
pub use scenario::Scenario;
pub use scheduler::{RunOutcome, Scheduler, StopHandle, TickRecord};
pub use shape::{
    ConstantShape, LoadShape, ShapeDecision, ShapeKind, ShapeStep, ShapeTick, SpikeRange,
    StepTable, SteppedShape,
};
pub use task::{Task, TaskDefinition, TaskRegistry, TaskSelector};
pub use user::{UserExit, UserId, UserState, UserTemplate, VirtualUser};
