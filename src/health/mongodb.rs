/// Direct-connection ping check for a single mongod

use super::{HealthChecker, HealthStatus};
use crate::config::MongoConfig;
use crate::db::Dialer;
use crate::replset::Mongod;
use std::sync::Arc;
use std::time::Duration;

/// Dials the member directly and runs `ping`
pub struct MongodHealthChecker {
    dialer: Arc<dyn Dialer>,
    mongo: MongoConfig,
    check_timeout: Duration,
}

impl MongodHealthChecker {
    pub fn new(dialer: Arc<dyn Dialer>, mongo: MongoConfig, check_timeout: Duration) -> Self {
        Self {
            dialer,
            mongo,
            check_timeout,
        }
    }
}

#[async_trait::async_trait]
impl HealthChecker for MongodHealthChecker {
    async fn check_health(&self, mongod: &Mongod) -> HealthStatus {
        tracing::debug!(member = %mongod.name(), "Checking mongod reachability");

        let info = mongod.dial_info(&self.mongo, self.check_timeout);
        let session = match self.dialer.dial(&info).await {
            Ok(session) => session,
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: format!("Connection failed: {}", e),
                }
            }
        };

        let status = match session.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("Ping failed: {}", e),
            },
        };
        session.close().await;
        status
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}
