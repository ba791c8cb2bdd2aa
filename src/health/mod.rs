/// Reachability checks for members awaiting admission
pub mod mongodb;

use crate::replset::Mongod;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

/// Health status of a member
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a reachable member
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait::async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform a single health check on a member
    async fn check_health(&self, mongod: &Mongod) -> HealthStatus;

    /// Get the timeout for a single check
    fn check_timeout(&self) -> Duration;
}

/// Probes a member with bounded retries before it is admitted
pub struct ReachabilityProbe {
    checker: Box<dyn HealthChecker>,
    max_tries: u32,
    retry_interval: Duration,
}

impl ReachabilityProbe {
    pub fn new(checker: Box<dyn HealthChecker>, max_tries: u32, retry_interval: Duration) -> Self {
        Self {
            checker,
            max_tries: max_tries.max(1),
            retry_interval,
        }
    }

    /// Perform one health check with timeout
    pub async fn check_once(&self, mongod: &Mongod) -> HealthStatus {
        match timeout(self.checker.check_timeout(), self.checker.check_health(mongod)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// Check until healthy or out of tries; returns the last status seen
    pub async fn probe(&self, mongod: &Mongod) -> HealthStatus {
        let mut status = HealthStatus::Unknown;

        for attempt in 1..=self.max_tries {
            status = self.check_once(mongod).await;
            match &status {
                HealthStatus::Healthy => {
                    tracing::debug!(member = %mongod.name(), attempt, "Member is reachable");
                    return status;
                }
                other => {
                    tracing::debug!(
                        member = %mongod.name(),
                        attempt,
                        status = %other,
                        "Member not reachable yet"
                    );
                }
            }

            if attempt < self.max_tries {
                tokio::time::sleep(self.backoff()).await;
            }
        }

        status
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = self.retry_interval.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return self.retry_interval;
        }
        self.retry_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
