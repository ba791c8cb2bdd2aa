/// Session and dialer backed by the official MongoDB driver
use super::{DialInfo, Dialer, ReadPreference, RsConfig, RsStatus, Session};
use crate::error::{MongoError, WatchdogResult};
use ::mongodb::bson::{self, doc, Document};
use ::mongodb::options::{
    ClientOptions, Credential, ReadPreference as DriverReadPreference, SelectionCriteria,
    ServerAddress, Tls, TlsOptions,
};
use ::mongodb::Client;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const ADMIN_DB: &str = "admin";

/// A driver client bound to one dial target
pub struct MongoSession {
    target: String,
    client: RwLock<Option<Client>>,
}

impl MongoSession {
    fn new(target: String, client: Client) -> Self {
        Self {
            target,
            client: RwLock::new(Some(client)),
        }
    }

    async fn admin_command(&self, name: &str, command: Document) -> WatchdogResult<Document> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| MongoError::not_connected(self.target.as_str()))?;

        let reply = client
            .database(ADMIN_DB)
            .run_command(command, None)
            .await
            .map_err(|e| MongoError::command(name.to_string(), e.to_string()))?;
        Ok(reply)
    }
}

#[async_trait]
impl Session for MongoSession {
    async fn ping(&self) -> WatchdogResult<()> {
        self.admin_command("ping", doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn run_command(&self, command: Document) -> WatchdogResult<Document> {
        let name = command
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "<empty>".to_string());
        self.admin_command(&name, command).await
    }

    async fn read_replset_config(&self) -> WatchdogResult<RsConfig> {
        let reply = self
            .admin_command("replSetGetConfig", doc! { "replSetGetConfig": 1 })
            .await?;
        let config = reply
            .get_document("config")
            .map_err(|e| MongoError::decode(format!("replSetGetConfig reply: {}", e)))?;
        let config = bson::from_document::<RsConfig>(config.clone())
            .map_err(|e| MongoError::decode(format!("replica set config: {}", e)))?;
        Ok(config)
    }

    async fn write_replset_config(&self, config: &RsConfig) -> WatchdogResult<()> {
        let document = bson::to_document(config)
            .map_err(|e| MongoError::decode(format!("replica set config: {}", e)))?;
        self.admin_command("replSetReconfig", doc! { "replSetReconfig": document })
            .await?;
        Ok(())
    }

    async fn replset_status(&self) -> WatchdogResult<RsStatus> {
        let reply = self
            .admin_command("replSetGetStatus", doc! { "replSetGetStatus": 1 })
            .await?;
        let status = bson::from_document::<RsStatus>(reply)
            .map_err(|e| MongoError::decode(format!("replica set status: {}", e)))?;
        Ok(status)
    }

    async fn close(&self) {
        if self.client.write().await.take().is_some() {
            debug!(addr = %self.target, "Closed MongoDB session");
        }
    }
}

/// Dials sessions with bounded connect retries
pub struct MongoDialer {
    max_tries: u32,
    retry_interval: Duration,
}

impl MongoDialer {
    pub fn new(max_tries: u32, retry_interval: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            retry_interval,
        }
    }

    fn client_options(info: &DialInfo) -> WatchdogResult<ClientOptions> {
        let mut options = ClientOptions::default();

        options.hosts = info
            .addrs
            .iter()
            .map(|addr| {
                ServerAddress::parse(addr)
                    .map_err(|e| MongoError::dial(addr.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        options.direct_connection = Some(info.direct);
        options.repl_set_name = info.replset_name.clone();
        options.connect_timeout = Some(info.timeout);
        options.server_selection_timeout = Some(if info.fail_fast {
            info.timeout
        } else {
            info.timeout * 3
        });
        options.app_name = Some("replset-watchdog".to_string());

        if let Some(username) = &info.username {
            let mut credential = Credential::default();
            credential.username = Some(username.clone());
            credential.password = info.password.clone();
            credential.source = info.auth_source.clone();
            options.credential = Some(credential);
        }

        if let Some(tls) = &info.tls {
            let mut tls_options = TlsOptions::default();
            tls_options.ca_file_path = tls.ca_file.clone();
            tls_options.cert_key_file_path = tls.cert_key_file.clone();
            tls_options.allow_invalid_certificates = Some(tls.allow_invalid_certificates);
            options.tls = Some(Tls::Enabled(tls_options));
        }

        let read_preference = match info.read_preference {
            ReadPreference::Primary => DriverReadPreference::Primary,
            ReadPreference::PrimaryPreferred => DriverReadPreference::PrimaryPreferred {
                options: Default::default(),
            },
        };
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(read_preference));

        Ok(options)
    }
}

#[async_trait]
impl Dialer for MongoDialer {
    async fn dial(&self, info: &DialInfo) -> WatchdogResult<Arc<dyn Session>> {
        let target = info.target();
        let options = Self::client_options(info)?;
        let mut last_error = None;

        for attempt in 1..=self.max_tries {
            let client = Client::with_options(options.clone())
                .map_err(|e| MongoError::dial(target.clone(), e.to_string()))?;
            let session = MongoSession::new(target.clone(), client);

            match session.ping().await {
                Ok(()) => {
                    debug!(addr = %target, attempt, "Connected to MongoDB");
                    return Ok(Arc::new(session));
                }
                Err(e) => {
                    debug!(addr = %target, attempt, error = %e, "MongoDB connect attempt failed");
                    session.close().await;
                    last_error = Some(e);
                    if attempt < self.max_tries {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connect attempts made".to_string());
        warn!(addr = %target, tries = self.max_tries, "Giving up connecting to MongoDB");
        Err(MongoError::dial(target, message).into())
    }
}
