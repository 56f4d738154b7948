use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use suru::{http, Credentials, HttpTokenProvider, Scenario};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "info,suru=debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.run_config()?;
    tracing::info!("Suru starting against {}", config.host);
    tracing::info!("Shape: {}", config.shape);
    if let Some(run_time) = config.run_time {
        tracing::info!("Run time: {}", humantime::format_duration(run_time));
    }

    let client = reqwest::Client::builder()
        .timeout(cli.request_timeout)
        .build()?;
    let tasks = http::default_tasks(&client, &config.host, &cli.username)?;
    let provider = Arc::new(HttpTokenProvider::new(client, cli.token_url.clone()));

    let outcome = Scenario::builder()
        .name("timesheets")
        .config(config)
        .tasks(tasks)
        .provider(provider)
        .credentials(Credentials::new(
            cli.username.clone(),
            cli.password.clone(),
            cli.client_id.clone(),
        ))
        .build()
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl-C received, stopping..."),
                Err(e) => {
                    tracing::error!("Unable to listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    let failures = outcome.stats.requests.failures();
    if failures > 0 {
        tracing::warn!(
            "{failures} of {} requests failed",
            outcome.stats.requests.requests
        );
    }
    Ok(())
}
