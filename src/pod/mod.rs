/// DC/OS SDK implementation of the pod source
pub mod dcos;

use crate::error::WatchdogResult;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Environment variable carrying the mongod port of a task
pub const ENV_MONGODB_PORT: &str = "MONGODB_PORT";
/// Environment variable carrying the replica set name of a task
pub const ENV_MONGODB_REPLSET: &str = "MONGODB_REPLSET";

/// Kind of database process a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Mongod,
    Mongos,
    Other,
}

impl TaskType {
    pub fn from_task_name(name: &str) -> Self {
        if name.ends_with("-mongod") {
            TaskType::Mongod
        } else if name.ends_with("-mongos") {
            TaskType::Mongos
        } else {
            TaskType::Other
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Mongod => write!(f, "mongod"),
            TaskType::Mongos => write!(f, "mongos"),
            TaskType::Other => write!(f, "other"),
        }
    }
}

/// Pod name encoded in a `{pod}-mongod.{service}...:port` member host
pub fn pod_name_from_host(host: &str) -> Option<String> {
    let hostname = host.rsplit_once(':').map_or(host, |(name, _)| name);
    let task = hostname.split('.').next()?;
    let pod = task.strip_suffix("-mongod")?;
    if pod.is_empty() {
        return None;
    }
    Some(pod.to_string())
}

/// A single orchestrator task, as seen by the reconciliation engine.
///
/// Each orchestrator backend provides its own implementation; nothing
/// downstream of discovery branches on the backend type.
pub trait Task: fmt::Debug + Send + Sync {
    /// Task name as reported by the orchestrator
    fn name(&self) -> &str;

    /// Whether the orchestrator reported any state for this task yet
    fn has_state(&self) -> bool;

    fn is_running(&self) -> bool;

    fn is_task_type(&self, task_type: TaskType) -> bool;

    /// Whether the task reached a terminal state and will not come back
    fn is_removed(&self) -> bool;

    fn env_var(&self, name: &str) -> Option<String>;

    /// Hostname the mongod of this task is reachable on
    fn mongo_hostname(&self, service: &str) -> String;

    fn mongo_port(&self) -> Option<String> {
        self.env_var(ENV_MONGODB_PORT)
    }

    fn mongo_replset_name(&self) -> Option<String> {
        self.env_var(ENV_MONGODB_REPLSET)
    }
}

/// Orchestrator view of which pods and tasks exist
#[async_trait]
pub trait Source: Send + Sync {
    /// List the names of all pods of the service
    async fn list_pods(&self) -> WatchdogResult<Vec<String>>;

    /// List the tasks running inside a pod
    async fn list_tasks(&self, pod: &str) -> WatchdogResult<Vec<Box<dyn Task>>>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Pod a replica set member runs in, told from its host alone.
    ///
    /// Used for members that carry no pod tag, such as the member the
    /// replica set was initiated with.
    fn pod_name_from_host(&self, host: &str) -> Option<String> {
        pod_name_from_host(host)
    }
}

/// Pod names the orchestrator listed on its latest successful poll.
///
/// Written once per poll by the driver, read by every watcher to tell a
/// removed pod from a member that is only temporarily unreachable.
#[derive(Debug, Clone, Default)]
pub struct ActivePods {
    pods: Arc<RwLock<HashSet<String>>>,
}

impl ActivePods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot
    pub async fn update<I>(&self, pods: I)
    where
        I: IntoIterator<Item = String>,
    {
        let pods: HashSet<String> = pods.into_iter().collect();
        *self.pods.write().await = pods;
    }

    pub async fn contains(&self, pod: &str) -> bool {
        self.pods.read().await.contains(pod)
    }

    pub async fn snapshot(&self) -> HashSet<String> {
        self.pods.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.pods.read().await.len()
    }
}

/// Counters for orchestrator polls
#[derive(Debug, Default)]
pub struct SourceMetrics {
    pods_ok: AtomicU64,
    pods_errors: AtomicU64,
    tasks_ok: AtomicU64,
    tasks_errors: AtomicU64,
}

/// Point-in-time copy of [`SourceMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceMetricsSnapshot {
    pub pods_ok: u64,
    pub pods_errors: u64,
    pub tasks_ok: u64,
    pub tasks_errors: u64,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pods(&self, ok: bool) {
        if ok {
            self.pods_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pods_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tasks(&self, ok: bool) {
        if ok {
            self.tasks_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            pods_ok: self.pods_ok.load(Ordering::Relaxed),
            pods_errors: self.pods_errors.load(Ordering::Relaxed),
            tasks_ok: self.tasks_ok.load(Ordering::Relaxed),
            tasks_errors: self.tasks_errors.load(Ordering::Relaxed),
        }
    }
}
