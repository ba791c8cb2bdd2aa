/// Orchestrator-side view of replica set membership
///
/// A [`Replset`] holds the members the orchestrator currently runs for one
/// replica set name. The [`ReplsetManager`] is the only writer; watchers read
/// snapshots. Actual MongoDB membership lives in the replica set config, not
/// here.
pub mod mongod;

pub use mongod::{Mongod, BACKUP_POD_PREFIX};

use crate::config::MongoConfig;
use crate::db::DialInfo;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug)]
struct ReplsetInner {
    members: HashMap<String, Mongod>,
    last_updated: Instant,
}

/// Known members of one replica set, keyed by `host:port`
#[derive(Debug)]
pub struct Replset {
    name: String,
    inner: RwLock<ReplsetInner>,
}

impl Replset {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(ReplsetInner {
                members: HashMap::new(),
                last_updated: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace a member, returning true when it was not known before
    pub async fn update_member(&self, mongod: Mongod) -> bool {
        let mut inner = self.inner.write().await;
        inner.last_updated = Instant::now();
        inner.members.insert(mongod.name(), mongod).is_none()
    }

    pub async fn remove_member(&self, name: &str) -> Option<Mongod> {
        let mut inner = self.inner.write().await;
        let removed = inner.members.remove(name);
        if removed.is_some() {
            inner.last_updated = Instant::now();
        }
        removed
    }

    pub async fn get_member(&self, name: &str) -> Option<Mongod> {
        self.inner.read().await.members.get(name).cloned()
    }

    pub async fn has_member(&self, name: &str) -> bool {
        self.inner.read().await.members.contains_key(name)
    }

    /// Snapshot of all members, ordered by identity
    pub async fn members(&self) -> Vec<Mongod> {
        let inner = self.inner.read().await;
        let mut members: Vec<Mongod> = inner.members.values().cloned().collect();
        members.sort_by_key(|m| m.name());
        members
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.members.is_empty()
    }

    pub async fn last_updated(&self) -> Instant {
        self.inner.read().await.last_updated
    }

    /// Drop members whose pod is not in `active_pods`
    pub async fn remove_inactive(&self, active_pods: &HashSet<String>) -> Vec<Mongod> {
        let mut inner = self.inner.write().await;
        let stale: Vec<String> = inner
            .members
            .iter()
            .filter(|(_, m)| !active_pods.contains(&m.pod_name))
            .map(|(name, _)| name.clone())
            .collect();

        let removed: Vec<Mongod> = stale
            .iter()
            .filter_map(|name| inner.members.remove(name))
            .collect();
        if !removed.is_empty() {
            inner.last_updated = Instant::now();
        }
        removed
    }

    /// Replica-set aware dial info seeded from the current members
    pub async fn dial_info(&self, config: &MongoConfig, timeout: Duration) -> Option<DialInfo> {
        let addrs: Vec<String> = self.members().await.iter().map(Mongod::name).collect();
        if addrs.is_empty() {
            return None;
        }
        Some(DialInfo::replset(&self.name, addrs, timeout).with_auth(config))
    }
}

/// Registry of replica sets fed by task discovery
#[derive(Debug, Default)]
pub struct ReplsetManager {
    replsets: RwLock<HashMap<String, Arc<Replset>>>,
}

impl ReplsetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a member, creating its replica set on first sight
    pub async fn update_member(&self, mongod: Mongod) {
        let replset = {
            let mut replsets = self.replsets.write().await;
            replsets
                .entry(mongod.replset.clone())
                .or_insert_with(|| {
                    info!(replset = %mongod.replset, "Discovered new replica set");
                    Arc::new(Replset::new(&mongod.replset))
                })
                .clone()
        };

        let name = mongod.name();
        if replset.update_member(mongod).await {
            info!(replset = %replset.name(), member = %name, "Added member to replica set view");
        } else {
            debug!(replset = %replset.name(), member = %name, "Refreshed replica set member");
        }
    }

    pub async fn remove_member(&self, replset: &str, name: &str) -> Option<Mongod> {
        let replset = self.get(replset).await?;
        replset.remove_member(name).await
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Replset>> {
        self.replsets.read().await.get(name).cloned()
    }

    pub async fn has_replset(&self, name: &str) -> bool {
        self.replsets.read().await.contains_key(name)
    }

    /// All known replica sets, ordered by name
    pub async fn replsets(&self) -> Vec<Arc<Replset>> {
        let replsets = self.replsets.read().await;
        let mut all: Vec<Arc<Replset>> = replsets.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Prune members of pods that disappeared from the orchestrator
    pub async fn remove_inactive(&self, active_pods: &HashSet<String>) -> Vec<Mongod> {
        let mut removed = Vec::new();
        for replset in self.replsets().await {
            for mongod in replset.remove_inactive(active_pods).await {
                info!(
                    replset = %replset.name(),
                    member = %mongod.name(),
                    pod = %mongod.pod_name,
                    "Pod no longer listed, dropped member from replica set view"
                );
                removed.push(mongod);
            }
        }
        removed
    }

    pub async fn get_replset_dial_info(
        &self,
        name: &str,
        config: &MongoConfig,
        timeout: Duration,
    ) -> Option<DialInfo> {
        let replset = self.get(name).await?;
        replset.dial_info(config, timeout).await
    }
}
