/// DC/OS SDK scheduler API: pods and their tasks over HTTP
use super::{Source, Task, TaskType};
use crate::config::ServiceConfig;
use crate::error::{WatchdogError, WatchdogResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Domain suffix of DC/OS auto-IP task hostnames
pub const AUTOIP_DOMAIN: &str = "autoip.dcos.thisdcos.directory";

const TASK_STATE_RUNNING: &str = "TASK_RUNNING";
const TERMINAL_TASK_STATES: &[&str] = &[
    "TASK_KILLED",
    "TASK_FINISHED",
    "TASK_FAILED",
    "TASK_LOST",
    "TASK_GONE",
    "TASK_ERROR",
];

/// One entry of `GET /v1/pod/{pod}/info`
#[derive(Debug, Clone, Deserialize)]
pub struct DcosTask {
    pub info: DcosTaskInfo,
    #[serde(default)]
    pub status: Option<DcosTaskStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcosTaskInfo {
    pub name: String,
    #[serde(default)]
    pub command: Option<DcosCommand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcosCommand {
    #[serde(default)]
    pub environment: Option<DcosEnvironment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcosEnvironment {
    #[serde(default)]
    pub variables: Vec<DcosVariable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcosVariable {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcosTaskStatus {
    pub state: String,
}

impl DcosTask {
    fn state(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.state.as_str())
    }
}

impl Task for DcosTask {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn has_state(&self) -> bool {
        self.state().is_some()
    }

    fn is_running(&self) -> bool {
        self.state() == Some(TASK_STATE_RUNNING)
    }

    fn is_task_type(&self, task_type: TaskType) -> bool {
        TaskType::from_task_name(&self.info.name) == task_type
    }

    fn is_removed(&self) -> bool {
        self.state()
            .map(|state| TERMINAL_TASK_STATES.contains(&state))
            .unwrap_or(false)
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.info
            .command
            .as_ref()?
            .environment
            .as_ref()?
            .variables
            .iter()
            .find(|v| v.name == name)
            .and_then(|v| v.value.clone())
    }

    fn mongo_hostname(&self, service: &str) -> String {
        format!("{}.{}.{}", self.info.name, service, AUTOIP_DOMAIN)
    }
}

/// Pod source backed by the DC/OS SDK scheduler HTTP API
pub struct DcosSource {
    client: reqwest::Client,
    base_url: String,
}

impl DcosSource {
    pub fn new(config: &ServiceConfig) -> WatchdogResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_sec))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}://{}/v1", config.api_scheme, config.api_host),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pods_url(&self) -> String {
        format!("{}/pod", self.base_url)
    }

    fn pod_info_url(&self, pod: &str) -> String {
        format!("{}/pod/{}/info", self.base_url, pod)
    }
}

#[async_trait]
impl Source for DcosSource {
    async fn list_pods(&self) -> WatchdogResult<Vec<String>> {
        let response = self.client.get(self.pods_url()).send().await?;
        let pods = response.error_for_status()?.json::<Vec<String>>().await?;
        Ok(pods)
    }

    async fn list_tasks(&self, pod: &str) -> WatchdogResult<Vec<Box<dyn Task>>> {
        if pod.is_empty() {
            return Err(WatchdogError::source("empty pod name"));
        }
        let response = self.client.get(self.pod_info_url(pod)).send().await?;
        let tasks = response.error_for_status()?.json::<Vec<DcosTask>>().await?;
        Ok(tasks
            .into_iter()
            .map(|task| Box::new(task) as Box<dyn Task>)
            .collect())
    }

    fn name(&self) -> &'static str {
        "dcos"
    }

    fn pod_name_from_host(&self, host: &str) -> Option<String> {
        let hostname = host.rsplit_once(':').map_or(host, |(name, _)| name);
        if !hostname.ends_with(AUTOIP_DOMAIN) {
            return None;
        }
        super::pod_name_from_host(hostname)
    }
}
