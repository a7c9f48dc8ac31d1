//! Probe module for synthetic availability checks.
//!
//! One HTTP check per target per cycle; every check yields exactly one
//! [`ProbeSample`], whether it succeeded or not.

mod http;

pub use http::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::Target;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("no worker slot free within the {0:?} cycle deadline")]
    Skipped(Duration),
}

/// Failure classification recorded on a failed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code")]
pub enum ProbeErrorKind {
    Timeout,
    Connection,
    HttpStatus(u16),
    Request,
}

impl From<&ProbeError> for ProbeErrorKind {
    fn from(err: &ProbeError) -> Self {
        match err {
            ProbeError::Timeout(_) | ProbeError::Skipped(_) => ProbeErrorKind::Timeout,
            ProbeError::Connection(_) => ProbeErrorKind::Connection,
            ProbeError::Status(code) => ProbeErrorKind::HttpStatus(*code),
            ProbeError::Request(_) => ProbeErrorKind::Request,
        }
    }
}

/// The outcome of one check against one URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSample {
    pub url_name: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Milliseconds to the last body byte; only set on success.
    pub latency_ms: Option<f64>,
    pub error_kind: Option<ProbeErrorKind>,
}

impl ProbeSample {
    pub fn succeeded(target: &Target, timestamp: DateTime<Utc>, latency_ms: f64) -> Self {
        Self {
            url_name: target.name.clone(),
            url: target.url.clone(),
            timestamp,
            success: true,
            latency_ms: Some(latency_ms),
            error_kind: None,
        }
    }

    pub fn failed(target: &Target, timestamp: DateTime<Utc>, kind: ProbeErrorKind) -> Self {
        Self {
            url_name: target.name.clone(),
            url: target.url.clone(),
            timestamp,
            success: false,
            latency_ms: None,
            error_kind: Some(kind),
        }
    }
}

/// One cycle's samples plus how long the whole cycle took.
#[derive(Debug, Clone)]
pub struct ProbeCycle {
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub samples: Vec<ProbeSample>,
}

/// Runs probe cycles against a fixed target list.
#[derive(Clone)]
pub struct Prober {
    client: reqwest::Client,
    timeout: Duration,
    bucket: Arc<Semaphore>,
    jitter: bool,
    /// Longest a probe waits for a worker slot before it is given up.
    cycle_deadline: Option<Duration>,
}

impl Prober {
    pub fn new(timeout: Duration, max_concurrent: usize) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("canarywatch/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            bucket: Arc::new(Semaphore::new(max_concurrent.max(1))),
            jitter: true,
            cycle_deadline: None,
        })
    }

    /// Disable the start jitter (used by tests for deterministic timing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Fail probes still waiting for a worker slot after `deadline`, normally
    /// the probe interval, so an overrunning cycle never queues into the next.
    pub fn with_cycle_deadline(mut self, deadline: Duration) -> Self {
        self.cycle_deadline = Some(deadline);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a single target. Never fails: errors become a failed sample.
    pub async fn probe(&self, target: &Target) -> ProbeSample {
        // Wait for a worker slot before stamping the sample
        let acquire = self.bucket.clone().acquire_owned();
        let permit = match self.cycle_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    let e = ProbeError::Skipped(deadline);
                    tracing::warn!("Probe skipped for {} ({}): {}", target.name, target.url, e);
                    return ProbeSample::failed(target, Utc::now(), ProbeErrorKind::from(&e));
                }
            },
            None => acquire.await,
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => {
                return ProbeSample::failed(target, Utc::now(), ProbeErrorKind::Request);
            }
        };

        if self.jitter {
            // Add jitter to avoid bursts against shared hosts
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let timestamp = Utc::now();
        let result = match tokio::time::timeout(
            self.timeout,
            run_http_probe(&self.client, &target.url, self.timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        };

        // Enforce timeout check
        let result = result.and_then(|latency_ms| {
            if latency_ms >= self.timeout.as_secs_f64() * 1000.0 {
                Err(ProbeError::Timeout(self.timeout))
            } else {
                Ok(latency_ms)
            }
        });

        match result {
            Ok(latency_ms) => ProbeSample::succeeded(target, timestamp, latency_ms),
            Err(e) => {
                tracing::warn!("Probe failed for {} ({}): {}", target.name, target.url, e);
                ProbeSample::failed(target, timestamp, ProbeErrorKind::from(&e))
            }
        }
    }

    /// Run one cycle: probe every target concurrently, one sample each, in target order.
    pub async fn run_cycle(&self, targets: &[Target]) -> ProbeCycle {
        let started_at = Utc::now();
        let start = Instant::now();

        let handles: Vec<_> = targets
            .iter()
            .cloned()
            .map(|target| {
                let prober = self.clone();
                tokio::spawn(async move { prober.probe(&target).await })
            })
            .collect();

        let mut samples = Vec::with_capacity(targets.len());
        for (target, handle) in targets.iter().zip(handles) {
            match handle.await {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    tracing::error!("Probe task for {} aborted: {}", target.name, e);
                    samples.push(ProbeSample::failed(target, Utc::now(), ProbeErrorKind::Request));
                }
            }
        }

        let elapsed = start.elapsed();
        tracing::debug!(
            "Probe cycle finished: {} targets in {:?}",
            targets.len(),
            elapsed
        );

        ProbeCycle {
            started_at,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            samples,
        }
    }
}
