use std::{path::PathBuf, time::Duration};

use clap::Parser;
use suru::{shape::read_spike_ranges, RunConfig, ShapeKind, WaitTime};

/// Shaped virtual-user load generator
#[derive(Parser, Debug)]
#[command(name = "suru")]
#[command(about = "Drive a shaped population of authenticated virtual users against a service")]
#[command(version)]
pub struct Cli {
    /// Base URL of the target service
    #[arg(long, default_value = "http://localhost:8081", env = "SURU_HOST")]
    pub host: String,

    /// Population of the constant profile, ceiling of the stepped one
    #[arg(short, long)]
    pub users: Option<usize>,

    /// Users started per second (constant and stepped profiles)
    #[arg(short = 'r', long)]
    pub spawn_rate: Option<usize>,

    /// Run length, e.g. 30s, 5m (required for the constant profile)
    #[arg(short = 't', long, value_parser = humantime::parse_duration)]
    pub run_time: Option<Duration>,

    /// First population of the stepped profile
    #[arg(long)]
    pub step_base: Option<usize>,

    /// Doubling period of the stepped profile, e.g. 1m
    #[arg(long, value_parser = humantime::parse_duration)]
    pub step_interval: Option<Duration>,

    /// JSON spike table for the spiked profile
    #[arg(long)]
    pub shape_file: Option<PathBuf>,

    /// Hard stop regardless of the profile
    #[arg(long, value_parser = humantime::parse_duration)]
    pub max_run_time: Option<Duration>,

    /// Load profile: constant, stepped, spiked
    #[arg(long, default_value = "constant")]
    pub shape: ShapeKind,

    /// Log plain lines instead of redrawing a live dashboard
    #[arg(long)]
    pub headless: bool,

    /// Write the final summary as JSON
    #[arg(long)]
    pub report_file: Option<PathBuf>,

    /// Password-grant token endpoint
    #[arg(
        long,
        default_value = "http://localhost:8080/realms/cmips/protocol/openid-connect/token",
        env = "SURU_TOKEN_URL"
    )]
    pub token_url: String,

    #[arg(long, default_value = "provider1", env = "SURU_USERNAME")]
    pub username: String,

    #[arg(
        long,
        default_value = "password123",
        env = "SURU_PASSWORD",
        hide_env_values = true,
        hide_default_value = true
    )]
    pub password: String,

    #[arg(long, default_value = "cmips-frontend-new", env = "SURU_CLIENT_ID")]
    pub client_id: String,

    /// Shortest pause between two tasks of one user
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub wait_min: Duration,

    /// Longest pause between two tasks of one user
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub wait_max: Duration,

    /// Scheduler tick
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub tick: Duration,

    /// Live metrics reporting interval
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub report_interval: Duration,

    /// Per-request timeout
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// Seed for task selection and wait times
    #[arg(long)]
    pub seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn run_config(&self) -> suru::Result<RunConfig> {
        let mut config = RunConfig::builder()
            .host(self.host.clone())
            .shape(self.shape)
            .wait_time(WaitTime::between(self.wait_min, self.wait_max)?)
            .tick(self.tick)
            .report_interval(self.report_interval)
            .headless(self.headless)
            .build();
        config.users = self.users;
        config.spawn_rate = self.spawn_rate;
        config.run_time = self.run_time;
        config.step_base = self.step_base;
        config.step_interval = self.step_interval;
        config.spike_ranges = self
            .shape_file
            .as_ref()
            .map(read_spike_ranges)
            .transpose()?;
        config.max_run_time = self.max_run_time;
        config.report_file = self.report_file.clone();
        config.seed = self.seed;
        config.validate()?;
        Ok(config)
    }
}
