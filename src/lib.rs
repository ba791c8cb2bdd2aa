//! Replset Watchdog - keeps MongoDB replica set membership in step with an orchestrator
//!
//! The watchdog polls the orchestrator for the pods of one service, turns
//! their running mongod tasks into a per-replica-set view, and runs one
//! watcher per replica set that adds newly scheduled members to the replica
//! set config and removes members whose pods were scaled away.
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod pod;
pub mod replset;
pub mod utils;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

use crate::config::Config;
use crate::db::Dialer;
use crate::error::{ErrorSeverity, WatchdogError, WatchdogResult};
use crate::health::ReachabilityProbe;
use crate::pod::{ActivePods, Source, SourceMetrics, TaskType};
use crate::replset::{Mongod, ReplsetManager};
use crate::watcher::{WatcherContext, WatcherManager};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DISCOVERY_QUEUE_SIZE: usize = 64;

/// Outcome of one orchestrator poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Pods listed by the orchestrator
    pub pods: usize,
    /// Pods skipped by the ignore list
    pub ignored: usize,
    /// Mongod members observed
    pub members: usize,
    /// Pods whose task list could not be fetched
    pub failed_pods: usize,
    /// Members dropped because their pod is gone
    pub removed: usize,
}

/// Log a failed cycle at the level its severity calls for
pub(crate) fn log_error(message: &str, e: &WatchdogError) {
    match e.severity() {
        ErrorSeverity::Critical | ErrorSeverity::Error => {
            error!(error = %e, severity = %e.severity(), recoverable = e.is_recoverable(), "{}", message)
        }
        ErrorSeverity::Warning => {
            warn!(error = %e, recoverable = e.is_recoverable(), "{}", message)
        }
    }
}

/// Top-level driver: discovery loop plus the watcher registry
pub struct Watchdog {
    config: Arc<Config>,
    source: Arc<dyn Source>,
    replsets: Arc<ReplsetManager>,
    watchers: Arc<WatcherManager>,
    active_pods: ActivePods,
    metrics: Arc<SourceMetrics>,
    started_at: Instant,
}

impl Watchdog {
    pub fn new(
        config: Arc<Config>,
        source: Arc<dyn Source>,
        dialer: Arc<dyn Dialer>,
        probe: Arc<ReachabilityProbe>,
    ) -> Self {
        let active_pods = ActivePods::new();
        let ctx = WatcherContext {
            config: Arc::clone(&config),
            dialer,
            probe,
            active_pods: active_pods.clone(),
            source: Arc::clone(&source),
        };

        Self {
            config,
            source,
            replsets: Arc::new(ReplsetManager::new()),
            watchers: Arc::new(WatcherManager::new(ctx)),
            active_pods,
            metrics: Arc::new(SourceMetrics::new()),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn replsets(&self) -> &Arc<ReplsetManager> {
        &self.replsets
    }

    pub fn watchers(&self) -> &Arc<WatcherManager> {
        &self.watchers
    }

    pub fn active_pods(&self) -> &ActivePods {
        &self.active_pods
    }

    pub fn metrics(&self) -> &Arc<SourceMetrics> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Poll the orchestrator once and refresh the replica set view.
    ///
    /// Task lists are fetched for all pods concurrently; every observed
    /// member goes through a single updater task. Members of pods that are
    /// no longer listed are dropped afterwards.
    pub async fn poll(&self) -> WatchdogResult<DiscoveryReport> {
        let pods = match self.source.list_pods().await {
            Ok(pods) => {
                self.metrics.record_pods(true);
                pods
            }
            Err(e) => {
                self.metrics.record_pods(false);
                return Err(e);
            }
        };

        let (tx, mut rx) = mpsc::channel::<Mongod>(DISCOVERY_QUEUE_SIZE);
        let replsets = Arc::clone(&self.replsets);
        let updater = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(mongod) = rx.recv().await {
                replsets.update_member(mongod).await;
                count += 1;
            }
            count
        });

        let ignore = &self.config.discovery.ignore_pods;
        let (ignored, wanted): (Vec<&String>, Vec<&String>) = pods
            .iter()
            .partition(|pod| utils::is_pod_ignored(pod, ignore));
        for pod in &ignored {
            debug!(pod = %pod, "Ignoring pod");
        }

        let results = join_all(wanted.iter().map(|pod| self.discover_pod(pod, tx.clone()))).await;
        drop(tx);

        let members = updater
            .await
            .map_err(|e| WatchdogError::internal(format!("discovery updater failed: {}", e)))?;

        // Ignored pods stay active so the watchers never evict their members
        self.active_pods.update(pods.iter().cloned()).await;
        let removed = self
            .replsets
            .remove_inactive(&self.active_pods.snapshot().await)
            .await;

        let report = DiscoveryReport {
            pods: pods.len(),
            ignored: ignored.len(),
            members,
            failed_pods: results.iter().filter(|ok| !**ok).count(),
            removed: removed.len(),
        };
        debug!(source = self.source.name(), report = ?report, "Discovery finished");
        Ok(report)
    }

    // Returns false when the task list of the pod could not be fetched
    async fn discover_pod(&self, pod: &str, tx: mpsc::Sender<Mongod>) -> bool {
        let tasks = match self.source.list_tasks(pod).await {
            Ok(tasks) => {
                self.metrics.record_tasks(true);
                tasks
            }
            Err(e) => {
                self.metrics.record_tasks(false);
                warn!(pod = %pod, error = %e, "Failed to list pod tasks");
                return false;
            }
        };

        let service = &self.config.service.name;
        for task in &tasks {
            if !task.is_task_type(TaskType::Mongod) {
                continue;
            }
            if !task.has_state() || !task.is_running() || task.is_removed() {
                debug!(pod = %pod, task = %task.name(), "Skipping mongod task that is not running");
                continue;
            }

            match Mongod::from_task(&**task, service, pod) {
                Ok(mongod) => {
                    if tx.send(mongod).await.is_err() {
                        warn!(pod = %pod, "Discovery updater stopped");
                        return false;
                    }
                }
                Err(e) => {
                    warn!(pod = %pod, task = %task.name(), error = %e, "Skipping task");
                }
            }
        }
        true
    }

    /// Start a watcher for every replica set that has members
    pub async fn ensure_watchers(&self) -> usize {
        let service = &self.config.service.name;
        let mut started = 0;
        for replset in self.replsets.replsets().await {
            if replset.is_empty().await {
                continue;
            }
            if self.watchers.watch(service, replset).await {
                started += 1;
            }
        }
        started
    }

    /// Poll until `shutdown` completes, then stop every watcher
    pub async fn run<F>(&self, shutdown: F) -> WatchdogResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let poll = &self.config.poll;
        let watchers_from = tokio::time::Instant::now() + poll.delay_watcher_start();
        let mut interval = tokio::time::interval(poll.api_interval());

        info!(
            service = %self.config.service.name,
            source = self.source.name(),
            api_interval = %utils::format_duration(poll.api_interval()),
            watcher_delay = %utils::format_duration(poll.delay_watcher_start()),
            "Watchdog started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    match self.poll().await {
                        Ok(report) => {
                            if report.failed_pods > 0 {
                                warn!(failed_pods = report.failed_pods, "Some pods could not be inspected");
                            }
                        }
                        Err(e) => log_error("Failed to poll orchestrator", &e),
                    }

                    if tokio::time::Instant::now() >= watchers_from {
                        let started = self.ensure_watchers().await;
                        if started > 0 {
                            info!(started, "Started replica set watchers");
                        }
                    }
                }
            }
        }

        self.watchers.close().await;
        let metrics = self.metrics.snapshot();
        info!(
            uptime = %utils::format_duration(self.uptime()),
            pods_ok = metrics.pods_ok,
            pods_errors = metrics.pods_errors,
            tasks_ok = metrics.tasks_ok,
            tasks_errors = metrics.tasks_errors,
            "Watchdog stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::mongodb::MongodHealthChecker;
    use crate::test_utils::{mongod, FakeCluster, FakeSource, FakeTask, TEST_SERVICE};
    use tokio::sync::oneshot;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.service.name = TEST_SERVICE.to_string();
        config.poll.delay_watcher_start_sec = 0;
        config.discovery.ignore_pods = vec!["admin-*".to_string()];
        config
    }

    fn watchdog(source: &FakeSource, cluster: &FakeCluster) -> Watchdog {
        let config = test_config();
        let checker = MongodHealthChecker::new(
            cluster.dialer(),
            config.mongodb.clone(),
            Duration::from_millis(200),
        );
        let probe = ReachabilityProbe::new(Box::new(checker), 2, Duration::from_millis(1));
        Watchdog::new(
            Arc::new(config),
            Arc::new(source.clone()),
            cluster.dialer(),
            Arc::new(probe),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_poll_filters_tasks() {
        let source = FakeSource::new();
        source.add_mongod_pod("rs-0", "rs", 27017);
        source.add_mongod_pod("admin-0", "rs", 27017);

        let mut stopped = FakeTask::mongod("rs-1-mongod", "27017", "rs");
        stopped.state = Some("finished".to_string());
        let mut removed = FakeTask::mongod("rs-2-mongod", "27017", "rs");
        removed.removed = true;
        let mut pending = FakeTask::mongod("rs-3-mongod", "27017", "rs");
        pending.state = None;
        let init = FakeTask::mongod("rs-4-init", "27017", "rs");
        let bad_port = FakeTask::mongod("rs-5-mongod", "not-a-port", "rs");
        source.add_pod("rs-1", vec![stopped]);
        source.add_pod("rs-2", vec![removed]);
        source.add_pod("rs-3", vec![pending]);
        source.add_pod("rs-4", vec![init]);
        source.add_pod("rs-5", vec![bad_port]);

        let cluster = FakeCluster::initiated("rs");
        let watchdog = watchdog(&source, &cluster);
        let report = watchdog.poll().await.unwrap();

        assert_eq!(report.pods, 7);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.members, 1);
        assert_eq!(report.failed_pods, 0);

        let rs = watchdog.replsets().get("rs").await.unwrap();
        let members = rs.members().await;
        assert_eq!(members, vec![mongod("rs", "rs-0", 27017)]);
        assert!(watchdog.active_pods().contains("admin-0").await);
        assert_eq!(watchdog.metrics().snapshot().tasks_ok, 6);
    }

    #[tokio::test]
    async fn test_poll_groups_members_by_replset() {
        let source = FakeSource::new();
        source.add_mongod_pod("shard-a-0", "shard-a", 27017);
        source.add_mongod_pod("shard-a-1", "shard-a", 27017);
        source.add_mongod_pod("shard-b-0", "shard-b", 27018);

        let cluster = FakeCluster::initiated("shard-a");
        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();

        assert_eq!(watchdog.replsets().get("shard-a").await.unwrap().len().await, 2);
        assert_eq!(watchdog.replsets().get("shard-b").await.unwrap().len().await, 1);
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_previous_view() {
        let source = FakeSource::new();
        source.add_mongod_pod("rs-0", "rs", 27017);
        let cluster = FakeCluster::initiated("rs");
        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();

        source.set_fail_pods(true);
        assert!(watchdog.poll().await.is_err());
        assert!(watchdog.active_pods().contains("rs-0").await);
        assert_eq!(watchdog.replsets().get("rs").await.unwrap().len().await, 1);

        let metrics = watchdog.metrics().snapshot();
        assert_eq!(metrics.pods_ok, 1);
        assert_eq!(metrics.pods_errors, 1);
    }

    #[tokio::test]
    async fn test_task_fetch_failure_is_isolated() {
        let source = FakeSource::new();
        source.add_mongod_pod("rs-0", "rs", 27017);
        source.add_mongod_pod("rs-1", "rs", 27017);
        let cluster = FakeCluster::initiated("rs");
        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();

        source.fail_tasks_for("rs-1");
        let report = watchdog.poll().await.unwrap();
        assert_eq!(report.failed_pods, 1);
        assert_eq!(report.removed, 0);
        // rs-1 is still listed, so its member stays in the view
        assert_eq!(watchdog.replsets().get("rs").await.unwrap().len().await, 2);
        assert_eq!(watchdog.metrics().snapshot().tasks_errors, 1);
    }

    #[tokio::test]
    async fn test_removed_pod_is_pruned() {
        let source = FakeSource::new();
        source.add_mongod_pod("rs-0", "rs", 27017);
        source.add_mongod_pod("rs-1", "rs", 27017);
        let cluster = FakeCluster::initiated("rs");
        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();

        source.remove_pod("rs-1");
        let report = watchdog.poll().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!watchdog.active_pods().contains("rs-1").await);
        let rs = watchdog.replsets().get("rs").await.unwrap();
        assert!(!rs.has_member(&mongod("rs", "rs-1", 27017).name()).await);
    }

    #[tokio::test]
    async fn test_ignored_pod_member_is_not_evicted() {
        let source = FakeSource::new();
        let cluster = FakeCluster::initiated("rs");
        let member = mongod("rs", "rs-0", 27017);
        let admin = mongod("rs", "admin-0", 27017);
        cluster.seed_members(&[
            (member.name().as_str(), Some("rs-0")),
            (admin.name().as_str(), Some("admin-0")),
        ]);
        cluster.mark_down(&admin.name());
        source.add_mongod_pod("rs-0", "rs", 27017);
        source.add_mongod_pod("admin-0", "rs", 27017);

        let watchdog = watchdog(&source, &cluster);
        let report = watchdog.poll().await.unwrap();
        assert_eq!(report.ignored, 1);
        assert!(!watchdog
            .replsets()
            .get("rs")
            .await
            .unwrap()
            .has_member(&admin.name())
            .await);

        watchdog.ensure_watchers().await;
        let watcher = watchdog.watchers().get(TEST_SERVICE, "rs").await.unwrap();
        let plan = watcher.reconcile().await.unwrap();
        assert!(plan.evict.is_empty());
        watchdog.watchers().close().await;
        assert!(cluster.config().unwrap().has_member(&admin.name()));
    }

    #[tokio::test]
    async fn test_untagged_initial_member_is_evicted_after_scale_down() {
        let source = FakeSource::new();
        let cluster = FakeCluster::initiated("rs");
        let first = mongod("rs", "rs-0", 27017);
        let second = mongod("rs", "rs-1", 27017);
        // the member the replica set was initiated with carries no tags
        cluster.seed_members(&[(first.name().as_str(), None), (second.name().as_str(), Some("rs-1"))]);
        cluster.mark_down(&first.name());
        source.add_mongod_pod("rs-1", "rs", 27017);

        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();
        watchdog.ensure_watchers().await;

        let observer = cluster.clone();
        assert!(wait_for(|| observer.config().map(|c| c.members.len()) == Some(1)).await);
        watchdog.watchers().close().await;

        let config = cluster.config().unwrap();
        assert!(!config.has_member(&first.name()));
        assert!(config.has_member(&second.name()));
    }

    #[tokio::test]
    async fn test_ensure_watchers_once_per_replset() {
        let source = FakeSource::new();
        source.add_mongod_pod("rs-0", "rs", 27017);
        let cluster = FakeCluster::initiated("rs");
        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();

        assert_eq!(watchdog.ensure_watchers().await, 1);
        assert_eq!(watchdog.ensure_watchers().await, 0);
        assert!(watchdog.watchers().has_watcher(TEST_SERVICE, "rs").await);
        watchdog.watchers().close().await;
    }

    #[tokio::test]
    async fn test_run_admits_new_replset_members() {
        let source = FakeSource::new();
        let cluster = FakeCluster::initiated("rs");
        for i in 0..3 {
            let pod = format!("rs-{}", i);
            source.add_mongod_pod(&pod, "rs", 27017);
            cluster.set_reachable(&mongod("rs", &pod, 27017).name(), true);
        }
        let watchdog = Arc::new(watchdog(&source, &cluster));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = {
            let watchdog = Arc::clone(&watchdog);
            tokio::spawn(async move {
                watchdog
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let observer = cluster.clone();
        assert!(wait_for(|| observer.config().map(|c| c.members.len()) == Some(3)).await);

        stop_tx.send(()).unwrap();
        runner.await.unwrap().unwrap();
        assert!(watchdog.watchers().is_empty().await);

        let config = cluster.config().unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.voting_members(), 3);
    }

    #[tokio::test]
    async fn test_scaled_down_member_is_evicted() {
        let source = FakeSource::new();
        let cluster = FakeCluster::initiated("rs");
        let members: Vec<Mongod> = (0..3).map(|i| mongod("rs", &format!("rs-{}", i), 27017)).collect();
        let hosts: Vec<String> = members.iter().map(Mongod::name).collect();
        cluster.seed_members(&[
            (hosts[0].as_str(), Some("rs-0")),
            (hosts[1].as_str(), Some("rs-1")),
            (hosts[2].as_str(), Some("rs-2")),
        ]);
        source.add_mongod_pod("rs-0", "rs", 27017);
        source.add_mongod_pod("rs-1", "rs", 27017);
        cluster.mark_down(&hosts[2]);

        let watchdog = watchdog(&source, &cluster);
        watchdog.poll().await.unwrap();
        watchdog.ensure_watchers().await;

        let observer = cluster.clone();
        assert!(wait_for(|| observer.config().map(|c| c.members.len()) == Some(2)).await);
        watchdog.watchers().close().await;

        let config = cluster.config().unwrap();
        assert!(!config.has_member(&hosts[2]));
        assert_eq!(config.version, 1);
    }
}
