/// Cached MongoDB-side view of one replica set
use crate::config::ReplsetLimits;
use crate::db::{RsConfig, RsMember, RsStatus, Session, TAG_BACKUP, TAG_FRAMEWORK, TAG_POD_NAME};
use crate::error::{MongoError, WatchdogResult};
use crate::replset::Mongod;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct StateInner {
    config: Option<RsConfig>,
    status: Option<RsStatus>,
    pending_write: bool,
    // Delta applied in memory but not written yet, replayed on every refresh
    pending_adds: Vec<Mongod>,
    pending_removes: Vec<String>,
}

/// How an admitted member was configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Voting,
    NonVoting,
    Backup,
}

/// Replica set config and status as last read from MongoDB.
///
/// Every config mutation re-reads the config first, replays the unwritten
/// delta of earlier mutations plus the new change in memory, then writes it
/// back with the version bumped by one. A failed write keeps the delta and
/// leaves `pending_write` set, so whichever mutation comes next writes it.
#[derive(Debug)]
pub struct State {
    replset: String,
    service: String,
    max_members: usize,
    max_voting_members: usize,
    inner: Mutex<StateInner>,
}

impl State {
    pub fn new(replset: &str, service: &str, limits: &ReplsetLimits) -> Self {
        Self {
            replset: replset.to_string(),
            service: service.to_string(),
            max_members: limits.max_members,
            max_voting_members: limits.max_voting_members,
            inner: Mutex::new(StateInner::default()),
        }
    }

    pub fn replset(&self) -> &str {
        &self.replset
    }

    /// Load the current config, then the current status.
    ///
    /// The status is not fetched when the config fetch fails.
    pub async fn fetch(&self, session: &dyn Session) -> WatchdogResult<()> {
        let mut inner = self.inner.lock().await;

        let config = session.read_replset_config().await?;
        debug!(replset = %self.replset, version = config.version, "Fetched replica set config");
        inner.config = Some(config);

        let status = session.replset_status().await?;
        inner.status = Some(status);
        Ok(())
    }

    pub async fn config(&self) -> Option<RsConfig> {
        self.inner.lock().await.config.clone()
    }

    pub async fn status(&self) -> Option<RsStatus> {
        self.inner.lock().await.status.clone()
    }

    pub async fn pending_write(&self) -> bool {
        self.inner.lock().await.pending_write
    }

    /// Number of voting members in the cached config, -1 before any fetch
    pub async fn voting_members(&self) -> i64 {
        match &self.inner.lock().await.config {
            Some(config) => config.voting_members() as i64,
            None => -1,
        }
    }

    /// Add members that are not in the config yet, respecting the member
    /// and voting caps. Returns the names of the members added in memory,
    /// including ones left over from an earlier failed write.
    pub async fn add_config_members(
        &self,
        session: &dyn Session,
        members: &[Mongod],
    ) -> WatchdogResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        self.refresh_config(&mut inner, session).await?;

        for mongod in members {
            let name = mongod.name();
            inner.pending_removes.retain(|host| *host != name);
            if !inner.pending_adds.iter().any(|m| m.name() == name) {
                inner.pending_adds.push(mongod.clone());
            }
        }

        let (added, _) = self.apply_pending(&mut inner)?;
        self.persist(&mut inner, session).await?;
        Ok(added)
    }

    /// Remove members by `host:port`. Returns the names removed in memory,
    /// including ones left over from an earlier failed write.
    pub async fn remove_config_members(
        &self,
        session: &dyn Session,
        hosts: &[String],
    ) -> WatchdogResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        self.refresh_config(&mut inner, session).await?;

        for host in hosts {
            inner.pending_adds.retain(|m| m.name() != *host);
            if !inner.pending_removes.contains(host) {
                inner.pending_removes.push(host.clone());
            }
        }

        let (_, removed) = self.apply_pending(&mut inner)?;
        self.persist(&mut inner, session).await?;
        Ok(removed)
    }

    // Apply the queued delta to the freshly read config. Only the changes
    // that still make a difference stay queued.
    fn apply_pending(&self, inner: &mut StateInner) -> WatchdogResult<(Vec<String>, Vec<String>)> {
        let config = inner
            .config
            .as_mut()
            .ok_or_else(|| MongoError::no_config(self.replset.as_str()))?;

        let mut removed = Vec::new();
        for host in &inner.pending_removes {
            if config.remove_member(host) {
                info!(replset = %self.replset, member = %host, "Removing member from replica set config");
                removed.push(host.clone());
            } else {
                debug!(replset = %self.replset, member = %host, "Member not in config, nothing to remove");
            }
        }

        let mut added = Vec::new();
        let mut admitted = Vec::new();
        for mongod in &inner.pending_adds {
            let name = mongod.name();
            if config.has_member(&name) {
                debug!(replset = %self.replset, member = %name, "Member already in config, skipping");
                continue;
            }

            if config.members.len() >= self.max_members {
                warn!(
                    replset = %self.replset,
                    member = %name,
                    max_members = self.max_members,
                    reason = "max members reached",
                    "Cannot add member to replica set"
                );
                break;
            }

            let (member, role) = self.build_member(config, mongod);
            info!(
                replset = %self.replset,
                member = %name,
                id = member.id,
                role = ?role,
                votes = member.votes,
                priority = member.priority,
                hidden = member.hidden,
                "Adding member to replica set config"
            );
            config.add_member(member);
            added.push(name);
            admitted.push(mongod.clone());
        }

        inner.pending_adds = admitted;
        inner.pending_removes = removed.clone();
        inner.pending_write = !added.is_empty() || !removed.is_empty();
        Ok((added, removed))
    }

    fn build_member(&self, config: &RsConfig, mongod: &Mongod) -> (RsMember, MemberRole) {
        let mut member = RsMember::new(config.next_member_id(), &mongod.name());
        member
            .tags
            .insert(TAG_FRAMEWORK.to_string(), self.service.clone());
        member
            .tags
            .insert(TAG_POD_NAME.to_string(), mongod.pod_name.clone());

        let role = if mongod.is_backup_node() {
            member.hidden = true;
            member.priority = 0.0;
            member.votes = 0;
            member.tags.insert(TAG_BACKUP.to_string(), "true".to_string());
            MemberRole::Backup
        } else if config.voting_members() >= self.max_voting_members {
            // MongoDB requires priority 0 on non-voting members
            member.priority = 0.0;
            member.votes = 0;
            MemberRole::NonVoting
        } else {
            MemberRole::Voting
        };

        (member, role)
    }

    async fn refresh_config(
        &self,
        inner: &mut StateInner,
        session: &dyn Session,
    ) -> WatchdogResult<()> {
        if inner.pending_write {
            info!(
                replset = %self.replset,
                adds = inner.pending_adds.len(),
                removes = inner.pending_removes.len(),
                "Retrying unpersisted replica set config change"
            );
        }
        let config = session.read_replset_config().await?;
        inner.config = Some(config);
        Ok(())
    }

    async fn persist(&self, inner: &mut StateInner, session: &dyn Session) -> WatchdogResult<bool> {
        if !inner.pending_write {
            return Ok(false);
        }

        let mut next = inner
            .config
            .clone()
            .ok_or_else(|| MongoError::no_config(self.replset.as_str()))?;
        next.incr_version();

        if let Err(e) = session.write_replset_config(&next).await {
            warn!(
                replset = %self.replset,
                version = next.version,
                error = %e,
                "Failed to write replica set config, will retry next cycle"
            );
            return Err(e);
        }

        info!(
            replset = %self.replset,
            version = next.version,
            members = next.members.len(),
            "Wrote replica set config"
        );
        inner.config = Some(next);
        inner.pending_write = false;
        inner.pending_adds.clear();
        inner.pending_removes.clear();
        Ok(true)
    }
}
