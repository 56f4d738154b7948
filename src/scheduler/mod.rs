//! The population scheduler.
//!
//! The [`Scheduler`] runs a control loop at a fixed tick, asks the
//! [`LoadShape`] how many users should be alive, and reconciles the live set
//! against that target. Spawning is bounded by the shape's spawn rate (see
//! [`plan`]); retiring is immediate and never blocks on the retired users.
//!
//! # High-level flow
//! 1. Reap users whose loops have ended (abandoned after repeated auth
//!    failures, panicked, or retired earlier and now finished).
//! 2. Evaluate the shape. On `Stop`, or when the optional maximum run time has
//!    passed, stop ticking.
//! 3. Spawn or retire according to [`plan::plan_tick`].
//! 4. Record a [`TickRecord`] in the timeline and publish it to watchers.
//! 5. Sleep until the next tick, unless an operator stop arrives first.
//!
//! On the way out every remaining user is cancelled and awaited. Cancellation
//! does not interrupt a task call in flight, so draining takes at most as long
//! as the slowest outstanding call. Pending token requests are abandoned.
pub mod plan;

use std::{collections::BTreeMap, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{MetricsSink, RunStats},
    shape::{LoadShape, ShapeTick},
    user::{UserExit, UserId, UserTemplate},
};
use plan::plan_tick;

/// What happened on one scheduler tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRecord {
    pub elapsed: Duration,
    pub target: usize,
    /// Live users after this tick's spawns and retirements.
    ///
    /// Retired users leave this count at once, but one may still be finishing
    /// its last task call. Until those calls return, up to `live + retiring`
    /// requests can be in flight.
    pub live: usize,
    pub spawned: usize,
    pub retired: usize,
    /// Users cancelled on this or an earlier tick whose loop has not ended yet.
    pub retiring: usize,
}

/// Stops a running scheduler from another task.
#[derive(Clone, Debug)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Everything a finished run hands back.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub stats: RunStats,
    pub timeline: Vec<TickRecord>,
    pub elapsed: Duration,
    pub peak_users: usize,
    pub spawned_users: u64,
    pub abandoned_users: u64,
    pub panicked_users: u64,
}

struct LiveUser {
    cancel: CancellationToken,
    handle: JoinHandle<UserExit>,
}

/// Mutable state of one run, owned by the scheduler loop.
struct RunState {
    started: Instant,
    /// Cancelling this retires every user at once.
    users_token: CancellationToken,
    live: BTreeMap<UserId, LiveUser>,
    retiring: Vec<LiveUser>,
    next_id: u64,
    carry: f64,
    timeline: Vec<TickRecord>,
    peak: usize,
    abandoned: u64,
    panicked: u64,
}

impl RunState {
    fn new(users_token: CancellationToken) -> Self {
        Self {
            started: Instant::now(),
            users_token,
            live: BTreeMap::new(),
            retiring: Vec::new(),
            next_id: 0,
            carry: 0.0,
            timeline: Vec::new(),
            peak: 0,
            abandoned: 0,
            panicked: 0,
        }
    }

    fn spawn(&mut self, template: &UserTemplate) {
        let id = UserId(self.next_id);
        self.next_id += 1;
        let cancel = self.users_token.child_token();
        let user = template.instantiate(id);
        let handle = tokio::spawn(user.run(cancel.clone()));
        self.live.insert(id, LiveUser { cancel, handle });
    }

    /// Retire the `n` most recently spawned users.
    fn retire(&mut self, n: usize) {
        for _ in 0..n {
            let Some((id, user)) = self.live.pop_last() else {
                break;
            };
            tracing::debug!("Retiring {id}.");
            user.cancel.cancel();
            self.retiring.push(user);
        }
    }

    /// Drop every user whose loop has already ended.
    async fn reap(&mut self) {
        let finished: Vec<UserId> = self
            .live
            .iter()
            .filter(|(_, user)| user.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(user) = self.live.remove(&id) {
                let result = user.handle.await;
                self.settle(Some(id), result);
            }
        }

        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|user| user.handle.is_finished());
        self.retiring = pending;
        for user in done {
            let result = user.handle.await;
            self.settle(None, result);
        }
    }

    fn settle(&mut self, id: Option<UserId>, result: Result<UserExit, JoinError>) {
        match result {
            Ok(UserExit::Retired) => {}
            Ok(UserExit::Abandoned) => {
                self.abandoned += 1;
                if let Some(id) = id {
                    tracing::warn!("{id} abandoned the run; it will be replaced.");
                }
            }
            Err(e) => {
                self.panicked += 1;
                tracing::error!("User task panicked with error: {e}");
            }
        }
    }

    /// Cancel everyone and wait for every loop to end.
    async fn drain(&mut self) {
        self.users_token.cancel();
        let handles: Vec<_> = std::mem::take(&mut self.live)
            .into_values()
            .chain(std::mem::take(&mut self.retiring))
            .map(|user| user.handle)
            .collect();
        tracing::info!("Waiting for {} users to finish...", handles.len());
        for result in join_all(handles).await {
            self.settle(None, result);
        }
    }
}

/// Drives a population of virtual users along a [`LoadShape`].
pub struct Scheduler {
    shape: Box<dyn LoadShape>,
    template: UserTemplate,
    tick: Duration,
    max_run_time: Option<Duration>,
    stop: CancellationToken,
    ticks: watch::Sender<TickRecord>,
}

impl Scheduler {
    pub fn new(shape: Box<dyn LoadShape>, template: UserTemplate, tick: Duration) -> Self {
        let (ticks, _) = watch::channel(TickRecord::default());
        Self {
            shape,
            template,
            tick,
            max_run_time: None,
            stop: CancellationToken::new(),
            ticks,
        }
    }

    /// Hard deadline on top of whatever the shape says.
    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = Some(max_run_time);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Latest tick, updated every time the scheduler reconciles.
    pub fn subscribe(&self) -> watch::Receiver<TickRecord> {
        self.ticks.subscribe()
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.template.sink
    }

    pub async fn run(self) -> RunOutcome {
        let mut state = RunState::new(self.stop.child_token());
        let mut next_tick = state.started;

        loop {
            state.reap().await;
            let elapsed = state.started.elapsed();

            if self.max_run_time.is_some_and(|max| elapsed >= max) {
                tracing::info!("Maximum run time reached after {elapsed:?}.");
                break;
            }
            let decision = match self.shape.evaluate(elapsed) {
                ShapeTick::Run(decision) => decision,
                ShapeTick::Stop => {
                    tracing::info!("Load shape finished after {elapsed:?}.");
                    break;
                }
            };

            let plan = plan_tick(
                state.live.len(),
                decision.target_users,
                decision.spawn_rate,
                self.tick,
                state.carry,
            );
            state.carry = plan.carry;
            if plan.spawn > 0 {
                tracing::debug!("Spawning {} users...", plan.spawn);
            }
            for _ in 0..plan.spawn {
                state.spawn(&self.template);
            }
            state.retire(plan.retire);

            let record = TickRecord {
                elapsed,
                target: decision.target_users,
                live: state.live.len(),
                spawned: plan.spawn,
                retired: plan.retire,
                retiring: state.retiring.len(),
            };
            state.peak = state.peak.max(record.live);
            state.timeline.push(record);
            self.ticks.send_replace(record);

            next_tick += self.tick;
            tokio::select! {
                _ = self.stop.cancelled() => {
                    tracing::info!("Stop requested, shutting down...");
                    break;
                }
                _ = tokio::time::sleep_until(next_tick) => {}
            }
        }

        state.drain().await;
        let elapsed = state.started.elapsed();
        tracing::info!(
            "All users finished; {} spawned, peak {}.",
            state.next_id,
            state.peak
        );

        RunOutcome {
            stats: self.template.sink.snapshot(),
            timeline: state.timeline,
            elapsed,
            peak_users: state.peak,
            spawned_users: state.next_id,
            abandoned_users: state.abandoned,
            panicked_users: state.panicked,
        }
    }
}
