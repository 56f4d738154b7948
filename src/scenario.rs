use std::{future::Future, sync::Arc};

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::MetricsSink,
    auth::{Credentials, TokenProvider},
    config::RunConfig,
    error::Result,
    report::{periodic_reporter, ConsoleReporter, JsonFileReporter, Reporter, RunSummary},
    scheduler::{RunOutcome, Scheduler},
    shape::LoadShape,
    task::TaskRegistry,
    user::UserTemplate,
};

/// Everything a run needs: what to call, who calls it, and how many of them.
///
/// The load shape comes from [`RunConfig::shape`] unless an explicit `shape`
/// is given.
///
/// # Example
/// ```rust,no_run
/// use std::{sync::Arc, time::Duration};
/// use suru::{http, Credentials, HttpTokenProvider, RunConfig, Scenario};
///
/// # async fn run() -> suru::Result<()> {
/// let client = reqwest::Client::new();
/// let outcome = Scenario::builder()
///     .name("timesheets")
///     .config(
///         RunConfig::builder()
///             .host("http://localhost:8081")
///             .users(10)
///             .spawn_rate(5)
///             .run_time(Duration::from_secs(30))
///             .build(),
///     )
///     .tasks(http::default_tasks(&client, "http://localhost:8081", "provider1")?)
///     .provider(Arc::new(HttpTokenProvider::new(
///         client.clone(),
///         "http://localhost:8080/realms/cmips/protocol/openid-connect/token",
///     )))
///     .credentials(Credentials::new("provider1", "password123", "cmips-frontend-new"))
///     .build()
///     .run()
///     .await?;
/// println!("{} requests", outcome.stats.requests.requests);
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub config: RunConfig,
    pub tasks: TaskRegistry,
    pub provider: Arc<dyn TokenProvider>,
    pub credentials: Credentials,
    #[builder(default, setter(strip_option))]
    pub shape: Option<Box<dyn LoadShape>>,
}

impl Scenario {
    pub async fn run(self) -> Result<RunOutcome> {
        self.run_until(std::future::pending()).await
    }

    /// Run until the shape finishes or `stop` resolves, whichever comes
    /// first. Stopping drains the users like a normal end of run.
    pub async fn run_until(self, stop: impl Future<Output = ()>) -> Result<RunOutcome> {
        let config = self.config;
        config.validate()?;
        let shape = match self.shape {
            Some(shape) => shape,
            None => config.load_shape()?,
        };
        let tasks = Arc::new(self.tasks.build()?);
        tracing::info!(
            "Scenario '{}': {} shape, {} tasks against {}",
            self.name,
            config.shape,
            tasks.tasks().len(),
            config.host
        );

        let template = UserTemplate {
            credentials: self.credentials,
            provider: self.provider,
            tasks,
            sink: MetricsSink::new(),
            wait_time: config.wait_time,
            auth_retry: config.auth_retry,
            seed: config.seed,
        };
        let sink = template.sink.clone();
        let mut scheduler = Scheduler::new(shape, template, config.tick);
        if let Some(max) = config.max_run_time {
            scheduler = scheduler.with_max_run_time(max);
        }
        let stop_handle = scheduler.stop_handle();

        tracing::info!("Spawning periodic reporter...");
        let reporting = CancellationToken::new();
        let reporter = tokio::spawn(periodic_reporter(
            sink,
            scheduler.subscribe(),
            config.report_interval,
            config.headless,
            reporting.clone(),
        ));

        tracing::info!("Running scenario: {}!", self.name);
        let run = scheduler.run();
        tokio::pin!(run);
        let finished = tokio::select! {
            outcome = &mut run => Some(outcome),
            _ = stop => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                tracing::info!("Stop signal received, draining users...");
                stop_handle.stop();
                run.await
            }
        };

        reporting.cancel();
        if let Err(e) = reporter.await {
            tracing::error!("Periodic reporter panicked with error: {e}");
        }

        tracing::info!("Processing results...");
        let summary = RunSummary::from(&outcome);
        ConsoleReporter::new(config.headless).report(&summary).await?;
        if let Some(path) = &config.report_file {
            JsonFileReporter::new(path.clone()).report(&summary).await?;
        }

        tracing::info!("Done running scenario: {}!", self.name);
        Ok(outcome)
    }
}
