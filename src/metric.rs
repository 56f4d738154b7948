use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// Classification of a single task execution.
///
/// Every request a virtual user makes ends up in exactly one of these buckets.
/// This is the only channel through which tasks report how a call went: tasks
/// never return errors, they return an [`Outcome`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// The call did what it was supposed to do.
    Success,
    /// The service rejected the payload on business grounds (validation,
    /// duplicates). This is expected behavior and counts as a success.
    BusinessRejection,
    /// The service no longer accepts the session's token.
    AuthExpired,
    /// Network errors, server errors and any status the task did not expect.
    TransportFailure,
}

/// What a task returns after talking to the target service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResult {
    pub outcome: Outcome,
    /// HTTP-style status code, absent when the request never got a response.
    pub status: Option<u16>,
    pub latency: Duration,
}

impl RequestResult {
    pub fn new(outcome: Outcome, status: Option<u16>, latency: Duration) -> Self {
        Self {
            outcome,
            status,
            latency,
        }
    }

    pub fn success(status: u16, latency: Duration) -> Self {
        Self::new(Outcome::Success, Some(status), latency)
    }

    pub fn business_rejection(status: u16, latency: Duration) -> Self {
        Self::new(Outcome::BusinessRejection, Some(status), latency)
    }

    pub fn auth_expired(status: u16, latency: Duration) -> Self {
        Self::new(Outcome::AuthExpired, Some(status), latency)
    }

    pub fn transport_failure(status: Option<u16>, latency: Duration) -> Self {
        Self::new(Outcome::TransportFailure, status, latency)
    }
}

/// How a request was finally accounted for, after the virtual user reacted to
/// its [`Outcome`].
///
/// `AuthExpired` outcomes are split in two: if the immediate re-authentication
/// worked the request is [`Verdict::AuthRecovered`], otherwise it is an
/// [`Verdict::AuthExpired`] failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    BusinessRejection,
    AuthRecovered,
    AuthExpired,
    TransportFailure,
}

impl Verdict {
    pub fn is_failure(self) -> bool {
        matches!(self, Verdict::AuthExpired | Verdict::TransportFailure)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Verdict::Success | Verdict::BusinessRejection)
    }
}

impl From<Outcome> for Verdict {
    /// Direct mapping for outcomes that need no follow-up. An `AuthExpired`
    /// outcome maps to the failure verdict; callers that recovered should use
    /// [`Verdict::AuthRecovered`] instead.
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Verdict::Success,
            Outcome::BusinessRejection => Verdict::BusinessRejection,
            Outcome::AuthExpired => Verdict::AuthExpired,
            Outcome::TransportFailure => Verdict::TransportFailure,
        }
    }
}

/// A single observation fed into the metrics sink.
///
/// Samples are the smallest unit the aggregation layer sees: one per task
/// execution and one per token acquisition attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    Request {
        task: Arc<str>,
        status: Option<u16>,
        latency: Duration,
        verdict: Verdict,
    },
    Token {
        latency: Duration,
        acquired: bool,
    },
}

impl Sample {
    pub fn request(task: Arc<str>, result: &RequestResult, verdict: Verdict) -> Self {
        Sample::Request {
            task,
            status: result.status,
            latency: result.latency,
            verdict,
        }
    }

    pub fn latency(&self) -> Duration {
        match self {
            Sample::Request { latency, .. } | Sample::Token { latency, .. } => *latency,
        }
    }
}
