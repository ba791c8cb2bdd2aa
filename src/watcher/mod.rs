/// Per-replica-set reconciliation loop
///
/// A [`Watcher`] owns one session to its replica set. Every tick it fetches
/// the live config and status, compares them with the orchestrator view in
/// its [`Replset`], and hands admission and eviction batches to two
/// single-consumer queues so only one mutation per kind is ever in flight.
pub mod manager;
pub mod state;

pub use manager::{WatcherKey, WatcherManager};
pub use state::{MemberRole, State};

use crate::config::Config;
use crate::db::{Dialer, MemberState, RsConfig, RsStatus, Session, TAG_POD_NAME};
use crate::error::{MongoError, WatchdogError, WatchdogResult};
use crate::health::ReachabilityProbe;
use crate::pod::{ActivePods, Source};
use crate::replset::{Mongod, Replset};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Shared dependencies handed to every watcher
#[derive(Clone)]
pub struct WatcherContext {
    pub config: Arc<Config>,
    pub dialer: Arc<dyn Dialer>,
    pub probe: Arc<ReachabilityProbe>,
    pub active_pods: ActivePods,
    /// Tells the pod of members that carry no pod tag
    pub source: Arc<dyn Source>,
}

/// Membership changes computed by one reconciliation tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub admit: Vec<Mongod>,
    /// `host:port` of members to drop from the config
    pub evict: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.admit.is_empty() && self.evict.is_empty()
    }
}

/// Orchestrator members missing from the replica set config
pub fn admission_candidates(members: &[Mongod], config: &RsConfig) -> Vec<Mongod> {
    members
        .iter()
        .filter(|m| !config.has_member(&m.name()))
        .cloned()
        .collect()
}

/// Config members whose pod is gone and that are not serving.
///
/// A member is only evicted when all of these hold: it is unknown to the
/// orchestrator view, its pod is known and not in the active set, and the
/// live status does not report it healthy. The pod comes from the member's
/// pod tag, or from its host when untagged. Members whose pod cannot be
/// told (added by hand under another hostname) are left alone.
pub fn eviction_candidates(
    config: &RsConfig,
    status: Option<&RsStatus>,
    known: &HashSet<String>,
    active_pods: &HashSet<String>,
    source: &dyn Source,
) -> Vec<String> {
    config
        .members
        .iter()
        .filter(|m| !known.contains(&m.host))
        .filter(|m| {
            let pod = match m.tag(TAG_POD_NAME) {
                Some(pod) => Some(pod.to_string()),
                None => source.pod_name_from_host(&m.host),
            };
            pod.map_or(false, |pod| !active_pods.contains(&pod))
        })
        .filter(|m| {
            status
                .and_then(|s| s.get_member(&m.host))
                .map_or(true, |s| !s.is_healthy())
        })
        .map(|m| m.host.clone())
        .collect()
}

pub struct Watcher {
    replset: Arc<Replset>,
    state: Arc<State>,
    ctx: WatcherContext,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl Watcher {
    pub fn new(replset: Arc<Replset>, state: Arc<State>, ctx: WatcherContext) -> Self {
        Self {
            replset,
            state,
            ctx,
            session: Mutex::new(None),
        }
    }

    pub fn replset(&self) -> &Arc<Replset> {
        &self.replset
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Return a live session, redialing when the cached one stopped answering
    pub async fn connect(&self) -> WatchdogResult<Arc<dyn Session>> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.take() {
            match session.ping().await {
                Ok(()) => {
                    *guard = Some(Arc::clone(&session));
                    return Ok(session);
                }
                Err(e) => {
                    warn!(replset = %self.replset.name(), error = %e, "Session lost, reconnecting");
                    session.close().await;
                }
            }
        }

        let config = &self.ctx.config;
        let info = self
            .replset
            .dial_info(&config.mongodb, config.replset.connect_timeout())
            .await
            .ok_or_else(|| MongoError::not_connected(self.replset.name()))?;

        let session = self.ctx.dialer.dial(&info).await?;
        info!(replset = %self.replset.name(), addr = %info.target(), "Connected to replica set");
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    pub async fn close_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
            debug!(replset = %self.replset.name(), "Closed replica set session");
        }
    }

    /// Fetch live state and compute what to admit and evict
    pub async fn reconcile(&self) -> WatchdogResult<ReconcilePlan> {
        let session = self.connect().await?;
        self.state.fetch(session.as_ref()).await?;

        let config = self
            .state
            .config()
            .await
            .ok_or_else(|| MongoError::no_config(self.replset.name()))?;
        let status = self.state.status().await;
        if let Some(status) = &status {
            self.log_topology(status);
        }

        let members = self.replset.members().await;
        let known: HashSet<String> = members.iter().map(Mongod::name).collect();
        let active_pods = self.ctx.active_pods.snapshot().await;

        let plan = ReconcilePlan {
            admit: admission_candidates(&members, &config),
            evict: eviction_candidates(
                &config,
                status.as_ref(),
                &known,
                &active_pods,
                self.ctx.source.as_ref(),
            ),
        };

        for mongod in &plan.admit {
            info!(
                replset = %self.replset.name(),
                member = %mongod.name(),
                pod = %mongod.pod_name,
                decision = "admit",
                "Member missing from replica set config"
            );
        }
        for host in &plan.evict {
            info!(
                replset = %self.replset.name(),
                member = %host,
                decision = "evict",
                "Member pod is gone and member is not healthy"
            );
        }

        Ok(plan)
    }

    /// Probe each candidate and add the reachable ones to the config
    pub async fn admit(&self, members: Vec<Mongod>) -> WatchdogResult<Vec<String>> {
        let mut reachable = Vec::with_capacity(members.len());
        for mongod in members {
            let status = self.ctx.probe.probe(&mongod).await;
            if status.is_healthy() {
                reachable.push(mongod);
            } else {
                warn!(
                    replset = %self.replset.name(),
                    member = %mongod.name(),
                    decision = "skip",
                    reason = %status,
                    "Member not reachable, skipping until next cycle"
                );
            }
        }

        if reachable.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.connect().await?;
        self.state.add_config_members(session.as_ref(), &reachable).await
    }

    pub async fn evict(&self, hosts: Vec<String>) -> WatchdogResult<Vec<String>> {
        if hosts.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.connect().await?;
        self.state.remove_config_members(session.as_ref(), &hosts).await
    }

    /// Tick until `stop` fires, then drain both queues and return
    pub async fn run(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        let capacity = self.ctx.config.replset.queue_capacity.max(1);
        let (admit_tx, mut admit_rx) = mpsc::channel::<Vec<Mongod>>(capacity);
        let (evict_tx, mut evict_rx) = mpsc::channel::<Vec<String>>(capacity);

        let admitter = {
            let watcher = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(batch) = admit_rx.recv().await {
                    if let Err(e) = watcher.admit(batch).await {
                        watcher.report("Failed to admit members", &e);
                    }
                }
            })
        };
        let evictor = {
            let watcher = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(batch) = evict_rx.recv().await {
                    if let Err(e) = watcher.evict(batch).await {
                        watcher.report("Failed to evict members", &e);
                    }
                }
            })
        };

        info!(replset = %self.replset.name(), "Watcher started");
        let mut interval = tokio::time::interval(self.ctx.config.poll.replset_interval());

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = interval.tick() => {
                    match self.reconcile().await {
                        Ok(plan) => {
                            if !plan.admit.is_empty() && admit_tx.try_send(plan.admit).is_err() {
                                debug!(replset = %self.replset.name(), "Admission still in progress, deferring batch");
                            }
                            if !plan.evict.is_empty() && evict_tx.try_send(plan.evict).is_err() {
                                debug!(replset = %self.replset.name(), "Eviction still in progress, deferring batch");
                            }
                        }
                        Err(e) => self.report("Reconciliation failed", &e),
                    }
                }
            }
        }

        drop(admit_tx);
        drop(evict_tx);
        let _ = admitter.await;
        let _ = evictor.await;
        info!(replset = %self.replset.name(), "Watcher stopped");
    }

    fn report(&self, message: &str, e: &WatchdogError) {
        let _span = tracing::info_span!("watcher", replset = %self.replset.name()).entered();
        crate::log_error(message, e);
    }

    fn log_topology(&self, status: &RsStatus) {
        match status.primary() {
            Some(primary) => debug!(replset = %self.replset.name(), primary = %primary.name, "Replica set primary"),
            None => warn!(replset = %self.replset.name(), "Replica set has no primary"),
        }
        let secondaries: Vec<&str> = status
            .members_in_state(MemberState::Secondary)
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        debug!(replset = %self.replset.name(), secondaries = ?secondaries, "Replica set secondaries");
    }
}
