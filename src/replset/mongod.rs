/// Replica set member identity derived from an orchestrator task
use crate::config::MongoConfig;
use crate::db::DialInfo;
use crate::error::TaskError;
use crate::pod::{Task, ENV_MONGODB_PORT, ENV_MONGODB_REPLSET};
use std::fmt;
use std::time::Duration;

/// Pods whose name starts with this prefix run dedicated backup members
pub const BACKUP_POD_PREFIX: &str = "backup";

/// A mongod process as observed in one task snapshot.
///
/// Never mutated after construction; a newer task observation produces a
/// new value that replaces this one in its [`Replset`](super::Replset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mongod {
    pub host: String,
    pub port: u16,
    pub replset: String,
    pub service: String,
    pub pod_name: String,
    pub task_name: String,
}

impl Mongod {
    /// Build a member from a task of `pod` belonging to `service`
    pub fn from_task(task: &dyn Task, service: &str, pod: &str) -> Result<Self, TaskError> {
        let port_value = task
            .mongo_port()
            .ok_or_else(|| TaskError::missing_env_var(task.name(), ENV_MONGODB_PORT))?;
        let port = port_value
            .trim()
            .parse::<u16>()
            .map_err(|_| TaskError::InvalidEnvVar {
                task: task.name().to_string(),
                var: ENV_MONGODB_PORT.to_string(),
                value: port_value.clone(),
            })?;

        let replset = task
            .mongo_replset_name()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| TaskError::missing_env_var(task.name(), ENV_MONGODB_REPLSET))?;

        Ok(Self {
            host: task.mongo_hostname(service),
            port,
            replset,
            service: service.to_string(),
            pod_name: pod.to_string(),
            task_name: task.name().to_string(),
        })
    }

    /// Identity key, `host:port`
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_backup_node(&self) -> bool {
        self.pod_name.starts_with(BACKUP_POD_PREFIX)
    }

    /// Direct, fail-fast dial info used to probe this member before admission.
    ///
    /// No credentials are attached: a member that has not joined the set yet
    /// does not have the replicated admin users.
    pub fn dial_info(&self, config: &MongoConfig, timeout: Duration) -> DialInfo {
        let mut info = DialInfo::direct(self.name(), timeout);
        if config.tls.enabled {
            info.tls = Some(config.tls.clone());
        }
        info
    }
}

impl fmt::Display for Mongod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pod {}, replset {})", self.name(), self.pod_name, self.replset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_utils::FakeTask;

    #[test]
    fn test_from_task() {
        let task = FakeTask::mongod("rs-0-mongod", "27017", "rs");
        let mongod = Mongod::from_task(&task, "mongo", "rs-0").unwrap();

        assert_eq!(mongod.name(), "rs-0-mongod.mongo.test:27017");
        assert_eq!(mongod.replset, "rs");
        assert_eq!(mongod.pod_name, "rs-0");
        assert!(!mongod.is_backup_node());
    }

    #[test]
    fn test_missing_env_vars() {
        let mut task = FakeTask::mongod("rs-0-mongod", "27017", "rs");
        task.env.remove(ENV_MONGODB_PORT);
        let err = Mongod::from_task(&task, "mongo", "rs-0").unwrap_err();
        assert!(matches!(err, TaskError::MissingEnvVar { ref var, .. } if var == ENV_MONGODB_PORT));

        let mut task = FakeTask::mongod("rs-0-mongod", "27017", "rs");
        task.env.remove(ENV_MONGODB_REPLSET);
        let err = Mongod::from_task(&task, "mongo", "rs-0").unwrap_err();
        assert!(matches!(err, TaskError::MissingEnvVar { ref var, .. } if var == ENV_MONGODB_REPLSET));
    }

    #[test]
    fn test_invalid_port() {
        let task = FakeTask::mongod("rs-0-mongod", "not-a-port", "rs");
        let err = Mongod::from_task(&task, "mongo", "rs-0").unwrap_err();
        assert!(matches!(err, TaskError::InvalidEnvVar { .. }));
    }

    #[test]
    fn test_backup_node_classification() {
        let task = FakeTask::mongod("backup-0-mongod", "27017", "rs");
        let mongod = Mongod::from_task(&task, "mongo", "backup-0").unwrap();
        assert!(mongod.is_backup_node());
    }

    #[test]
    fn test_dial_info_is_direct() {
        let task = FakeTask::mongod("rs-0-mongod", "27017", "rs");
        let mongod = Mongod::from_task(&task, "mongo", "rs-0").unwrap();
        let config = Config::default();
        let info = mongod.dial_info(&config.mongodb, Duration::from_secs(2));

        assert!(info.direct);
        assert!(info.fail_fast);
        assert_eq!(info.addrs, vec![mongod.name()]);
        assert!(info.username.is_none());
    }
}
