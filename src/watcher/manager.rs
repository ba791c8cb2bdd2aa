/// Lifecycle of the running watchers
use super::{State, Watcher, WatcherContext};
use crate::replset::Replset;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry key: one watcher per service and replica set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatcherKey {
    pub service: String,
    pub replset: String,
}

impl WatcherKey {
    pub fn new(service: &str, replset: &str) -> Self {
        Self {
            service: service.to_string(),
            replset: replset.to_string(),
        }
    }
}

impl fmt::Display for WatcherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.replset)
    }
}

struct WatcherEntry {
    watcher: Arc<Watcher>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Starts at most one watcher per replica set and stops them
pub struct WatcherManager {
    ctx: WatcherContext,
    watchers: Mutex<HashMap<WatcherKey, WatcherEntry>>,
    // Kept across restarts so a pending write is not forgotten
    states: Mutex<HashMap<WatcherKey, Arc<State>>>,
}

impl WatcherManager {
    pub fn new(ctx: WatcherContext) -> Self {
        Self {
            ctx,
            watchers: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Start a watcher for `replset` of `service` unless one is already running.
    ///
    /// Returns true when a watcher was started.
    pub async fn watch(&self, service: &str, replset: Arc<Replset>) -> bool {
        let key = WatcherKey::new(service, replset.name());
        let mut watchers = self.watchers.lock().await;

        if let Some(entry) = watchers.get(&key) {
            if !entry.handle.is_finished() {
                return false;
            }
            warn!(watcher = %key, "Watcher exited unexpectedly, restarting");
            watchers.remove(&key);
        }

        let state = self.state_for(&key).await;
        let watcher = Arc::new(Watcher::new(replset, state, self.ctx.clone()));
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&watcher).run(stop_rx));

        info!(service = %key.service, replset = %key.replset, "Started replica set watcher");
        watchers.insert(
            key,
            WatcherEntry {
                watcher,
                stop,
                handle,
            },
        );
        true
    }

    /// Stop one watcher and wait for it to finish
    pub async fn stop(&self, service: &str, replset: &str) -> bool {
        let key = WatcherKey::new(service, replset);
        let entry = self.watchers.lock().await.remove(&key);
        match entry {
            Some(entry) => {
                Self::shutdown(entry).await;
                info!(service = %service, replset = %replset, "Stopped replica set watcher");
                true
            }
            None => false,
        }
    }

    /// Stop every watcher
    pub async fn close(&self) {
        let entries: Vec<(WatcherKey, WatcherEntry)> =
            self.watchers.lock().await.drain().collect();
        for (key, entry) in entries {
            debug!(watcher = %key, "Stopping watcher");
            Self::shutdown(entry).await;
        }
        info!("All watchers stopped");
    }

    pub async fn get(&self, service: &str, replset: &str) -> Option<Arc<Watcher>> {
        self.watchers
            .lock()
            .await
            .get(&WatcherKey::new(service, replset))
            .map(|entry| Arc::clone(&entry.watcher))
    }

    pub async fn has_watcher(&self, service: &str, replset: &str) -> bool {
        self.watchers
            .lock()
            .await
            .contains_key(&WatcherKey::new(service, replset))
    }

    /// Keys of the registered watchers, sorted
    pub async fn keys(&self) -> Vec<WatcherKey> {
        let mut keys: Vec<WatcherKey> = self.watchers.lock().await.keys().cloned().collect();
        keys.sort_by(|a, b| (&a.service, &a.replset).cmp(&(&b.service, &b.replset)));
        keys
    }

    pub async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.watchers.lock().await.is_empty()
    }

    /// Cached MongoDB state of a replica set, if it was ever watched
    pub async fn state(&self, service: &str, replset: &str) -> Option<Arc<State>> {
        self.states
            .lock()
            .await
            .get(&WatcherKey::new(service, replset))
            .cloned()
    }

    async fn state_for(&self, key: &WatcherKey) -> Arc<State> {
        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_insert_with(|| {
            Arc::new(State::new(
                &key.replset,
                &key.service,
                &self.ctx.config.replset,
            ))
        });
        Arc::clone(state)
    }

    async fn shutdown(entry: WatcherEntry) {
        // The receiver is gone if the watcher already exited
        let _ = entry.stop.send(());
        if let Err(e) = entry.handle.await {
            warn!(replset = %entry.watcher.replset().name(), error = %e, "Watcher task failed");
        }
        entry.watcher.close_session().await;
    }
}
