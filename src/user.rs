//! Virtual users, one simulated client each
//!
//! A [`VirtualUser`] owns its [`AuthSession`] and runs a strictly sequential
//! loop until the scheduler retires it:
//!
//! ```text
//! Unauthenticated -> Authenticating -> Ready -> Executing -> Ready -> ... -> Retired
//!                          ^                        |
//!                          +------ AuthExpired -----+
//! ```
//!
//! Every iteration makes sure the session holds a token, picks a weighted task,
//! runs it, classifies the result into the metrics sink, and sleeps for a
//! random wait time. Cancellation is observed while waiting, backing off or
//! acquiring a token; a task call in flight always completes and is recorded.
//! The current [`UserState`] is published on a `watch` channel, see
//! [`VirtualUser::subscribe`].
//!
//! # Authentication
//! - Token acquisition failures back off exponentially (see
//!   [`AuthRetryPolicy`]). After `max_consecutive_failures` the user gives up
//!   and exits with [`UserExit::Abandoned`]; the scheduler spawns a
//!   replacement on a later tick.
//! - A task answering `AuthExpired` invalidates the session and triggers one
//!   immediate re-acquisition. If that works the request counts as recovered,
//!   otherwise it is recorded as an auth failure and the next iteration goes
//!   through the normal backoff.
use std::{fmt, sync::Arc};

use rand::{rngs::StdRng, SeedableRng};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::MetricsSink,
    auth::{AuthError, AuthSession, Credentials, Token, TokenProvider},
    config::{AuthRetryPolicy, WaitTime},
    metric::{Outcome, RequestResult, Sample, Verdict},
    task::TaskSelector,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vu-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserState {
    Unauthenticated,
    Authenticating,
    Ready,
    Executing,
    Retired,
}

/// Why a user loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserExit {
    /// Cancelled by the scheduler or by the end of the run.
    Retired,
    /// Gave up after too many consecutive authentication failures.
    Abandoned,
}

enum Interrupt {
    Cancelled,
    Abandoned,
}

/// Everything users have in common; the scheduler stamps users out of it.
#[derive(Clone)]
pub struct UserTemplate {
    pub credentials: Credentials,
    pub provider: Arc<dyn TokenProvider>,
    pub tasks: Arc<TaskSelector>,
    pub sink: MetricsSink,
    pub wait_time: WaitTime,
    pub auth_retry: AuthRetryPolicy,
    pub seed: Option<u64>,
}

impl UserTemplate {
    pub fn instantiate(&self, id: UserId) -> VirtualUser {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id.0)),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        VirtualUser {
            id,
            session: AuthSession::new(self.credentials.clone(), Arc::clone(&self.provider)),
            tasks: Arc::clone(&self.tasks),
            sink: self.sink.clone(),
            wait_time: self.wait_time,
            auth_retry: self.auth_retry,
            rng,
            state: watch::channel(UserState::Unauthenticated).0,
            auth_failures: 0,
            iterations: 0,
        }
    }
}

pub struct VirtualUser {
    id: UserId,
    session: AuthSession,
    tasks: Arc<TaskSelector>,
    sink: MetricsSink,
    wait_time: WaitTime,
    auth_retry: AuthRetryPolicy,
    rng: StdRng,
    state: watch::Sender<UserState>,
    auth_failures: u32,
    iterations: u64,
}

impl VirtualUser {
    pub fn id(&self) -> UserId {
        self.id
    }

    /// Follow this user's state while it runs.
    pub fn subscribe(&self) -> watch::Receiver<UserState> {
        self.state.subscribe()
    }

    /// Run until `cancel` fires or authentication is abandoned.
    pub async fn run(mut self, cancel: CancellationToken) -> UserExit {
        tracing::debug!("{} started.", self.id);
        let exit = match self.run_loop(&cancel).await {
            Interrupt::Cancelled => UserExit::Retired,
            Interrupt::Abandoned => UserExit::Abandoned,
        };
        self.transition(UserState::Retired);
        tracing::debug!(
            "{} retired after {} iterations ({exit:?}).",
            self.id,
            self.iterations
        );
        exit
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Interrupt {
        loop {
            if cancel.is_cancelled() {
                return Interrupt::Cancelled;
            }
            let token = match self.authenticate(cancel).await {
                Ok(token) => token,
                Err(interrupt) => return interrupt,
            };
            self.transition(UserState::Ready);

            let tasks = Arc::clone(&self.tasks);
            let task = tasks.select_with(&mut self.rng);
            self.transition(UserState::Executing);
            let result = task.execute(&token).await;
            self.iterations += 1;
            self.settle(task.name(), &result, cancel).await;

            let pause = self.wait_time.sample(&mut self.rng);
            tokio::select! {
                _ = cancel.cancelled() => return Interrupt::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Get a usable token, backing off between failed attempts.
    async fn authenticate(&mut self, cancel: &CancellationToken) -> Result<Token, Interrupt> {
        if let Some(token) = self.session.current() {
            return Ok(token);
        }
        self.transition(UserState::Authenticating);

        loop {
            if self.auth_failures > 0 {
                if self.auth_retry.exhausted(self.auth_failures) {
                    tracing::error!(
                        "{}: giving up after {} consecutive authentication failures.",
                        self.id,
                        self.auth_failures
                    );
                    return Err(Interrupt::Abandoned);
                }
                let backoff = self.auth_retry.backoff(self.auth_failures);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let acquired = tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                acquired = self.acquire_token() => acquired,
            };
            match acquired {
                Ok(token) => {
                    self.auth_failures = 0;
                    return Ok(token);
                }
                Err(e) => {
                    self.auth_failures += 1;
                    tracing::warn!(
                        "{}: authentication failed (attempt {}/{}): {e}",
                        self.id,
                        self.auth_failures,
                        self.auth_retry.max_consecutive_failures
                    );
                }
            }
        }
    }

    /// `ensure_token`, recording a sample whenever the provider was called.
    async fn acquire_token(&self) -> Result<Token, AuthError> {
        let before = self.session.acquisitions();
        let start = Instant::now();
        let result = self.session.ensure_token().await;
        if self.session.acquisitions() != before {
            self.sink.record(
                self.id.0,
                &Sample::Token {
                    latency: start.elapsed(),
                    acquired: result.is_ok(),
                },
            );
        }
        result
    }

    /// Record `result`. A cancelled re-acquisition leaves the request
    /// unrecovered.
    async fn settle(
        &mut self,
        task: &Arc<str>,
        result: &RequestResult,
        cancel: &CancellationToken,
    ) {
        let verdict = match result.outcome {
            Outcome::AuthExpired => {
                tracing::warn!("{}: token rejected by '{task}', re-authenticating.", self.id);
                self.session.invalidate();
                self.transition(UserState::Authenticating);
                let reacquired = tokio::select! {
                    _ = cancel.cancelled() => None,
                    reacquired = self.acquire_token() => Some(reacquired),
                };
                match reacquired {
                    Some(Ok(_)) => {
                        self.auth_failures = 0;
                        Verdict::AuthRecovered
                    }
                    Some(Err(e)) => {
                        self.auth_failures += 1;
                        tracing::warn!("{}: immediate re-authentication failed: {e}", self.id);
                        Verdict::AuthExpired
                    }
                    None => Verdict::AuthExpired,
                }
            }
            Outcome::TransportFailure => {
                tracing::debug!(
                    "{}: '{task}' failed with status {:?}.",
                    self.id,
                    result.status
                );
                Verdict::TransportFailure
            }
            outcome => outcome.into(),
        };
        self.sink
            .record(self.id.0, &Sample::request(Arc::clone(task), result, verdict));
        self.transition(if self.session.has_token() {
            UserState::Ready
        } else {
            UserState::Unauthenticated
        });
    }

    fn transition(&self, next: UserState) {
        let id = self.id;
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::trace!("{id}: {state:?} -> {next:?}");
            *state = next;
            true
        });
    }
}
