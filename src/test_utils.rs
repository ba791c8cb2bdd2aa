//! In-memory stand-ins for MongoDB and the orchestrator, for unit tests

use crate::db::{DialInfo, Dialer, RsConfig, RsMember, RsStatus, RsStatusMember, Session};
use crate::error::{MongoError, WatchdogError, WatchdogResult};
use crate::pod::{Source, Task, TaskType, ENV_MONGODB_PORT, ENV_MONGODB_REPLSET};
use crate::replset::Mongod;
use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_SERVICE: &str = "mongo";

/// Member as discovered from a `{pod}-mongod` task of the test service
pub fn mongod(replset: &str, pod: &str, port: u16) -> Mongod {
    let task = FakeTask::mongod(&format!("{}-mongod", pod), &port.to_string(), replset);
    Mongod::from_task(&task, TEST_SERVICE, pod).expect("valid fake task")
}

#[derive(Debug, Default)]
struct ClusterState {
    config: Option<RsConfig>,
    status: Option<RsStatus>,
    reachable: HashSet<String>,
    failing_writes: usize,
    fail_config: bool,
    fail_status: bool,
    fail_dials: bool,
    fail_pings: bool,
    writes: usize,
    dials: usize,
    status_reads: usize,
}

/// A fake replica set shared by every session dialed from it
#[derive(Clone)]
pub struct FakeCluster {
    name: String,
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(ClusterState::default())),
        }
    }

    /// Cluster with an initiated, empty config at version 0
    pub fn initiated(name: &str) -> Self {
        let cluster = Self::new(name);
        cluster.set_config(RsConfig::new(name));
        cluster.set_status(RsStatus {
            set: name.to_string(),
            my_state: 1,
            members: Vec::new(),
        });
        cluster
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().expect("fake cluster lock poisoned")
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(FakeDialer {
            cluster: self.clone(),
        })
    }

    pub fn set_config(&self, config: RsConfig) {
        self.lock().config = Some(config);
    }

    pub fn config(&self) -> Option<RsConfig> {
        self.lock().config.clone()
    }

    pub fn set_status(&self, status: RsStatus) {
        self.lock().status = Some(status);
    }

    /// Add config members `host`s as voting members, reported healthy secondaries
    pub fn seed_members(&self, hosts: &[(&str, Option<&str>)]) {
        let mut state = self.lock();
        let name = self.name.clone();
        let config = state.config.get_or_insert_with(|| RsConfig::new(&name));
        for (host, pod) in hosts {
            let mut member = RsMember::new(config.next_member_id(), host);
            if let Some(pod) = pod {
                member
                    .tags
                    .insert(crate::db::TAG_POD_NAME.to_string(), pod.to_string());
            }
            config.add_member(member);
        }
        let members = config
            .members
            .iter()
            .map(|m| RsStatusMember {
                id: m.id,
                name: m.host.clone(),
                health: 1.0,
                state: if m.id == 0 { 1 } else { 2 },
                state_str: (if m.id == 0 { "PRIMARY" } else { "SECONDARY" }).to_string(),
            })
            .collect();
        state.status = Some(RsStatus {
            set: name,
            my_state: 1,
            members,
        });
    }

    /// Mark a member down (health 0, state DOWN) in the live status
    pub fn mark_down(&self, host: &str) {
        let mut state = self.lock();
        if let Some(status) = state.status.as_mut() {
            for member in status.members.iter_mut().filter(|m| m.name == host) {
                member.health = 0.0;
                member.state = 8;
                member.state_str = "(not reachable/healthy)".to_string();
            }
        }
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.reachable.insert(host.to_string());
        } else {
            state.reachable.remove(host);
        }
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    pub fn set_fail_config(&self, fail: bool) {
        self.lock().fail_config = fail;
    }

    pub fn set_fail_status(&self, fail: bool) {
        self.lock().fail_status = fail;
    }

    pub fn set_fail_dials(&self, fail: bool) {
        self.lock().fail_dials = fail;
    }

    pub fn set_fail_pings(&self, fail: bool) {
        self.lock().fail_pings = fail;
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    pub fn status_reads(&self) -> usize {
        self.lock().status_reads
    }
}

struct FakeDialer {
    cluster: FakeCluster,
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, info: &DialInfo) -> WatchdogResult<Arc<dyn Session>> {
        let mut state = self.cluster.lock();
        if state.fail_dials {
            return Err(MongoError::dial(info.target(), "dial refused".to_string()).into());
        }
        let direct_host = if info.direct {
            let host = info.addrs.first().cloned().unwrap_or_default();
            if !state.reachable.contains(&host) {
                return Err(MongoError::dial(host, "no reachable servers".to_string()).into());
            }
            Some(host)
        } else {
            None
        };
        state.dials += 1;

        Ok(Arc::new(FakeSession {
            cluster: self.cluster.clone(),
            direct_host,
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeSession {
    cluster: FakeCluster,
    direct_host: Option<String>,
    closed: AtomicBool,
}

impl FakeSession {
    fn check_open(&self) -> WatchdogResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MongoError::not_connected(self.cluster.name.as_str()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn ping(&self) -> WatchdogResult<()> {
        self.check_open()?;
        let state = self.cluster.lock();
        if state.fail_pings {
            return Err(MongoError::command("ping", "connection reset").into());
        }
        if let Some(host) = &self.direct_host {
            if !state.reachable.contains(host) {
                return Err(MongoError::command("ping", "host unreachable").into());
            }
        }
        Ok(())
    }

    async fn run_command(&self, _command: Document) -> WatchdogResult<Document> {
        self.check_open()?;
        Ok(doc! { "ok": 1 })
    }

    async fn read_replset_config(&self) -> WatchdogResult<RsConfig> {
        self.check_open()?;
        let state = self.cluster.lock();
        if state.fail_config {
            return Err(MongoError::command("replSetGetConfig", "not authorized").into());
        }
        state.config.clone().ok_or_else(|| {
            WatchdogError::from(MongoError::command(
                "replSetGetConfig",
                "no replset config has been received",
            ))
        })
    }

    async fn write_replset_config(&self, config: &RsConfig) -> WatchdogResult<()> {
        self.check_open()?;
        let mut state = self.cluster.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(MongoError::command("replSetReconfig", "not primary").into());
        }
        let current = state.config.as_ref().map(|c| c.version).unwrap_or(0);
        if config.version != current + 1 {
            return Err(MongoError::command(
                "replSetReconfig".to_string(),
                format!("version {} must be {}", config.version, current + 1),
            )
            .into());
        }
        state.config = Some(config.clone());
        state.writes += 1;
        Ok(())
    }

    async fn replset_status(&self) -> WatchdogResult<RsStatus> {
        self.check_open()?;
        let mut state = self.cluster.lock();
        state.status_reads += 1;
        if state.fail_status {
            return Err(MongoError::command("replSetGetStatus", "status unavailable").into());
        }
        state
            .status
            .clone()
            .ok_or_else(|| MongoError::command("replSetGetStatus", "no replset config").into())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Orchestrator task with settable state and environment
#[derive(Debug, Clone)]
pub struct FakeTask {
    pub name: String,
    pub state: Option<String>,
    pub removed: bool,
    pub env: HashMap<String, String>,
}

impl FakeTask {
    pub fn mongod(name: &str, port: &str, replset: &str) -> Self {
        let mut env = HashMap::new();
        env.insert(ENV_MONGODB_PORT.to_string(), port.to_string());
        env.insert(ENV_MONGODB_REPLSET.to_string(), replset.to_string());
        Self {
            name: name.to_string(),
            state: Some("running".to_string()),
            removed: false,
            env,
        }
    }
}

impl Task for FakeTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_state(&self) -> bool {
        self.state.is_some()
    }

    fn is_running(&self) -> bool {
        self.state.as_deref() == Some("running")
    }

    fn is_task_type(&self, task_type: TaskType) -> bool {
        TaskType::from_task_name(&self.name) == task_type
    }

    fn is_removed(&self) -> bool {
        self.removed
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn mongo_hostname(&self, service: &str) -> String {
        format!("{}.{}.test", self.name, service)
    }
}

#[derive(Default)]
struct SourceState {
    pods: Vec<String>,
    tasks: HashMap<String, Vec<FakeTask>>,
    fail_pods: bool,
    failing_pods: HashSet<String>,
}

/// Orchestrator with an editable pod list
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().expect("fake source lock poisoned")
    }

    /// Add a pod running a single mongod task for `replset`
    pub fn add_mongod_pod(&self, pod: &str, replset: &str, port: u16) {
        let task = FakeTask::mongod(&format!("{}-mongod", pod), &port.to_string(), replset);
        self.add_pod(pod, vec![task]);
    }

    pub fn add_pod(&self, pod: &str, tasks: Vec<FakeTask>) {
        let mut state = self.lock();
        if !state.pods.iter().any(|p| p == pod) {
            state.pods.push(pod.to_string());
        }
        state.tasks.insert(pod.to_string(), tasks);
    }

    pub fn remove_pod(&self, pod: &str) {
        let mut state = self.lock();
        state.pods.retain(|p| p != pod);
        state.tasks.remove(pod);
    }

    pub fn set_fail_pods(&self, fail: bool) {
        self.lock().fail_pods = fail;
    }

    pub fn fail_tasks_for(&self, pod: &str) {
        self.lock().failing_pods.insert(pod.to_string());
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn list_pods(&self) -> WatchdogResult<Vec<String>> {
        let state = self.lock();
        if state.fail_pods {
            return Err(WatchdogError::source("pod list unavailable"));
        }
        Ok(state.pods.clone())
    }

    async fn list_tasks(&self, pod: &str) -> WatchdogResult<Vec<Box<dyn Task>>> {
        let state = self.lock();
        if state.failing_pods.contains(pod) {
            return Err(WatchdogError::source(format!("pod {} info unavailable", pod)));
        }
        Ok(state
            .tasks
            .get(pod)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|task| Box::new(task) as Box<dyn Task>)
            .collect())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
