/// MongoDB session abstraction and replica set documents
///
/// The reconciliation engine only needs a handful of commands from a
/// session: ping, read/write the replica set config, and read the replica
/// set status. Everything else about the wire protocol stays in the driver.
pub mod mongodb;

use crate::config::{MongoConfig, TlsConfig};
use crate::error::WatchdogResult;
use ::mongodb::bson::Document;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Member tag key holding the orchestrated service name
pub const TAG_FRAMEWORK: &str = "framework";
/// Member tag key holding the pod a member runs in
pub const TAG_POD_NAME: &str = "podName";
/// Member tag key marking dedicated backup members
pub const TAG_BACKUP: &str = "backup";

/// Read preference for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    Primary,
    PrimaryPreferred,
}

/// Everything needed to open a session
#[derive(Debug, Clone, PartialEq)]
pub struct DialInfo {
    /// host:port seed addresses
    pub addrs: Vec<String>,
    /// Replica set name, when connecting replica-set aware
    pub replset_name: Option<String>,
    /// Connect to the single seed only, without topology discovery
    pub direct: bool,
    /// Give up server selection after one attempt instead of waiting
    pub fail_fast: bool,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_source: Option<String>,
    pub tls: Option<TlsConfig>,
    pub read_preference: ReadPreference,
}

impl DialInfo {
    /// Dial info for a single host, bypassing replica set discovery
    pub fn direct(addr: String, timeout: Duration) -> Self {
        Self {
            addrs: vec![addr],
            replset_name: None,
            direct: true,
            fail_fast: true,
            timeout,
            username: None,
            password: None,
            auth_source: None,
            tls: None,
            read_preference: ReadPreference::Primary,
        }
    }

    /// Dial info for a replica set seeded from `addrs`
    pub fn replset(name: &str, addrs: Vec<String>, timeout: Duration) -> Self {
        Self {
            addrs,
            replset_name: Some(name.to_string()),
            direct: false,
            fail_fast: true,
            timeout,
            username: None,
            password: None,
            auth_source: None,
            tls: None,
            read_preference: ReadPreference::PrimaryPreferred,
        }
    }

    /// Attach credentials and TLS settings
    pub fn with_auth(mut self, config: &MongoConfig) -> Self {
        if !config.username.is_empty() {
            self.username = Some(config.username.clone());
            self.password = Some(config.password.clone());
            self.auth_source = Some(config.auth_source.clone());
        }
        if config.tls.enabled {
            self.tls = Some(config.tls.clone());
        }
        self
    }

    /// Comma separated seed list for logs
    pub fn target(&self) -> String {
        self.addrs.join(",")
    }
}

/// An open connection to a mongod or replica set
#[async_trait]
pub trait Session: Send + Sync {
    async fn ping(&self) -> WatchdogResult<()>;

    /// Run an arbitrary admin command
    async fn run_command(&self, command: Document) -> WatchdogResult<Document>;

    async fn read_replset_config(&self) -> WatchdogResult<RsConfig>;

    /// Write a replica set config; the caller sets the new version
    async fn write_replset_config(&self, config: &RsConfig) -> WatchdogResult<()>;

    async fn replset_status(&self) -> WatchdogResult<RsStatus>;

    async fn close(&self);
}

/// Opens sessions
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, info: &DialInfo) -> WatchdogResult<Arc<dyn Session>>;
}

/// A member of the replica set config document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsMember {
    #[serde(rename = "_id")]
    pub id: i32,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_indexes: Option<bool>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default = "default_votes")]
    pub votes: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_delay_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_delay: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Fields not modelled above (`horizons`, ...), written back untouched
    #[serde(flatten)]
    pub extra: Document,
}

fn default_priority() -> f64 {
    1.0
}

fn default_votes() -> i32 {
    1
}

impl RsMember {
    /// A voting, electable member with no tags
    pub fn new(id: i32, host: &str) -> Self {
        Self {
            id,
            host: host.to_string(),
            arbiter_only: None,
            build_indexes: None,
            hidden: false,
            priority: default_priority(),
            votes: default_votes(),
            secondary_delay_secs: None,
            slave_delay: None,
            tags: BTreeMap::new(),
            extra: Document::new(),
        }
    }

    pub fn is_voting(&self) -> bool {
        self.votes > 0
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// The replica set config document (`replSetGetConfig`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsConfig {
    #[serde(rename = "_id")]
    pub name: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_concern_majority_journal_default: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configsvr: Option<bool>,
    #[serde(default)]
    pub members: Vec<RsMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Document>,
    #[serde(flatten)]
    pub extra: Document,
}

impl RsConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: 0,
            protocol_version: None,
            write_concern_majority_journal_default: None,
            configsvr: None,
            members: Vec::new(),
            settings: None,
            extra: Document::new(),
        }
    }

    pub fn get_member(&self, host: &str) -> Option<&RsMember> {
        self.members.iter().find(|m| m.host == host)
    }

    pub fn has_member(&self, host: &str) -> bool {
        self.get_member(host).is_some()
    }

    /// Next free member `_id`
    pub fn next_member_id(&self) -> i32 {
        self.members.iter().map(|m| m.id + 1).max().unwrap_or(0)
    }

    pub fn add_member(&mut self, member: RsMember) {
        self.members.push(member);
    }

    /// Remove a member by host, returning whether it was present
    pub fn remove_member(&mut self, host: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.host != host);
        self.members.len() != before
    }

    pub fn voting_members(&self) -> usize {
        self.members.iter().filter(|m| m.is_voting()).count()
    }

    pub fn incr_version(&mut self) {
        self.version += 1;
    }
}

/// Replica set member states as reported by `replSetGetStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
    Recovering,
    Startup2,
    Unknown,
    Arbiter,
    Down,
    Rollback,
    Removed,
}

impl MemberState {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MemberState::Startup,
            1 => MemberState::Primary,
            2 => MemberState::Secondary,
            3 => MemberState::Recovering,
            5 => MemberState::Startup2,
            7 => MemberState::Arbiter,
            8 => MemberState::Down,
            9 => MemberState::Rollback,
            10 => MemberState::Removed,
            _ => MemberState::Unknown,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Unknown => "UNKNOWN",
            MemberState::Arbiter => "ARBITER",
            MemberState::Down => "DOWN",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Removed => "REMOVED",
        };
        write!(f, "{}", name)
    }
}

/// A member entry of `replSetGetStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsStatusMember {
    #[serde(rename = "_id")]
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub health: f64,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub state_str: String,
}

impl RsStatusMember {
    pub fn member_state(&self) -> MemberState {
        MemberState::from_code(self.state)
    }

    pub fn is_healthy(&self) -> bool {
        self.health >= 1.0 && self.member_state() != MemberState::Down
    }
}

/// The replica set status document (`replSetGetStatus`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsStatus {
    pub set: String,
    #[serde(default)]
    pub my_state: i32,
    #[serde(default)]
    pub members: Vec<RsStatusMember>,
}

impl RsStatus {
    pub fn get_member(&self, host: &str) -> Option<&RsStatusMember> {
        self.members.iter().find(|m| m.name == host)
    }

    pub fn primary(&self) -> Option<&RsStatusMember> {
        self.members
            .iter()
            .find(|m| m.member_state() == MemberState::Primary)
    }

    pub fn members_in_state(&self, state: MemberState) -> Vec<&RsStatusMember> {
        self.members
            .iter()
            .filter(|m| m.member_state() == state)
            .collect()
    }
}
