use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use mongodb::{Client as MongoClient, Database};
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::error::Result;
use crate::gate::{AdminAuthorizationGate, CodeNotifier, LogNotifier, WebhookNotifier};
use crate::ledger::{Address, JsonRpcLedger, LedgerClient, ReceiptPolling};
use crate::model::AdminCredentials;
use crate::registry::{
    ArtifactSource, ContractDeploymentStore, ContractRegistry, FileArtifactSource,
    FileDeploymentStore, FirstAccountSigner, FixedSigner, SignerProvider,
};
use crate::service::ElectionService;
use crate::store::{
    ensure_admin_exists,
    mongodb::{ensure_indexes_exist, MongoDeploymentStore},
    Stores,
};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "default_rpc_url")]
    rpc_url: String,
    #[serde(default = "default_artifact_paths")]
    artifact_paths: Vec<PathBuf>,
    #[serde(default)]
    deployment_path: Option<PathBuf>,
    #[serde(default)]
    deployer: Option<Address>,
    #[serde(default = "default_rpc_timeout")]
    rpc_timeout: u64,
    #[serde(default = "default_read_retries")]
    read_retries: u32,
    #[serde(default = "default_receipt_timeout")]
    receipt_timeout: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    receipt_poll_interval_ms: u64,
    #[serde(default = "default_deploy_lock_ttl")]
    deploy_lock_ttl: u64,
    #[serde(default = "default_reset_code_ttl")]
    reset_code_ttl: u64,
    #[serde(default)]
    reset_code_webhook: Option<String>,
    // secrets
    hmac_secret: String,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_artifact_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("build/contracts/ElectionLedger.json")]
}

fn default_rpc_timeout() -> u64 {
    10
}

fn default_read_retries() -> u32 {
    3
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_receipt_poll_interval_ms() -> u64 {
    500
}

fn default_deploy_lock_ttl() -> u64 {
    600
}

fn default_reset_code_ttl() -> u64 {
    300
}

impl Config {
    /// JSON-RPC endpoint of the ledger node.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Where to look for the compiled contract, in order.
    pub fn artifact_sources(&self) -> Vec<Box<dyn ArtifactSource>> {
        self.artifact_paths
            .iter()
            .map(|path| Box::new(FileArtifactSource::new(path)) as Box<dyn ArtifactSource>)
            .collect()
    }

    /// File holding the deployment record. Without one, the record is kept
    /// in the database.
    pub fn deployment_path(&self) -> Option<&PathBuf> {
        self.deployment_path.as_ref()
    }

    /// Deploy from the configured account, or the node's first account.
    pub fn signer(&self) -> Arc<dyn SignerProvider> {
        match self.deployer {
            Some(address) => Arc::new(FixedSigner(address)),
            None => Arc::new(FirstAccountSigner),
        }
    }

    pub fn ledger(&self) -> Result<JsonRpcLedger> {
        Ok(JsonRpcLedger::new(
            &self.rpc_url,
            Duration::from_secs(self.rpc_timeout),
            self.read_retries,
        )?)
    }

    pub fn receipt_polling(&self) -> ReceiptPolling {
        ReceiptPolling {
            interval: Duration::from_millis(self.receipt_poll_interval_ms),
            timeout: Duration::from_secs(self.receipt_timeout),
        }
    }

    /// How long a deploy lock is honoured before another process may break it.
    pub fn deploy_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.deploy_lock_ttl)
    }

    /// Valid lifetime of reset codes.
    pub fn reset_code_ttl(&self) -> Duration {
        Duration::from_secs(self.reset_code_ttl)
    }

    /// Where reset codes are delivered. Without a webhook, codes are only
    /// announced in the log and cannot be used.
    pub fn notifier(&self) -> Result<Arc<dyn CodeNotifier>> {
        match &self.reset_code_webhook {
            Some(url) => Ok(Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(self.rpc_timeout),
            )?)),
            None => {
                warn!("No reset code webhook configured; reset codes cannot be delivered");
                Ok(Arc::new(LogNotifier))
            }
        }
    }

    /// Secret key used to sign HMACs.
    pub fn hmac_secret(&self) -> &[u8] {
        self.hmac_secret.as_bytes()
    }

    /// Assemble the contract registry this configuration describes.
    pub fn registry(
        &self,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ContractDeploymentStore>,
    ) -> ContractRegistry {
        ContractRegistry::new(ledger, store, self.artifact_sources(), self.signer())
            .with_polling(self.receipt_polling())
            .with_lock_ttl(self.deploy_lock_ttl())
            .with_rpc(&self.rpc_url)
    }
}

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
pub struct DbConfig {
    // non-secrets
    #[serde(default)]
    admin_username: Option<String>,
    // secrets
    db_uri: String,
    #[serde(default)]
    admin_password: Option<String>,
}

impl DbConfig {
    pub async fn connect(
        &self,
    ) -> std::result::Result<(MongoClient, Database), mongodb::error::Error> {
        let client = MongoClient::with_uri_str(&self.db_uri).await?;
        let db = client.database(&get_database_name());
        Ok((client, db))
    }

    /// Credentials for the admin created when none exist yet.
    fn bootstrap_admin(&self) -> Option<AdminCredentials> {
        Some(AdminCredentials {
            username: self.admin_username.clone()?,
            password: self.admin_password.clone()?,
        })
    }
}

/// A fairing that loads the MongoDB config, connects to the database,
/// performs any setup necessary, and places the `Client`, the `Database` and
/// the [`Stores`] built over it into managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        // Construct the connection.
        let (client, db) = match config.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };

        // Ensure the required indexes exist.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }

        // Ensure there is at least one admin user.
        let stores = Stores::mongodb(&db);
        match config.bootstrap_admin() {
            Some(admin) => {
                if let Err(e) = ensure_admin_exists(stores.admins.as_ref(), admin).await {
                    error!("Failed to create bootstrap admin: {e}");
                    return Err(rocket);
                }
            }
            None => warn!("No bootstrap admin configured"),
        }
        info!("...database connection online!");

        // Manage the state.
        rocket = rocket.manage(client).manage(db).manage(stores);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
fn get_database_name() -> String {
    "chainvote".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}

/// A fairing that connects to the ledger, discovers or deploys the contract,
/// settles operations left pending by an earlier run, and places the
/// [`ElectionService`] into managed state.
///
/// Must be attached after [`ConfigFairing`] and [`DatabaseFairing`].
/// Failing to reach the ledger does not stop the server; the deployment is
/// retried when an election is opened.
pub struct LedgerFairing;

#[rocket::async_trait]
impl Fairing for LedgerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Ledger",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let (Some(config), Some(stores), Some(db)) = (
            rocket.state::<Config>(),
            rocket.state::<Stores>(),
            rocket.state::<Database>(),
        ) else {
            error!("Ledger fairing attached before config and database");
            return Err(rocket);
        };

        let ledger = match config.ledger() {
            Ok(ledger) => ledger,
            Err(e) => {
                error!("Failed to construct ledger client: {e}");
                return Err(rocket);
            }
        };
        let deployments: Arc<dyn ContractDeploymentStore> = match config.deployment_path() {
            Some(path) => Arc::new(FileDeploymentStore::new(path)),
            None => Arc::new(MongoDeploymentStore::new(db)),
        };
        let notifier = match config.notifier() {
            Ok(notifier) => notifier,
            Err(e) => {
                error!("Failed to construct reset code notifier: {e}");
                return Err(rocket);
            }
        };
        let registry = config.registry(Arc::new(ledger), deployments);
        let gate = AdminAuthorizationGate::new(
            stores.admins.clone(),
            stores.audit.clone(),
            stores.reset_codes.clone(),
            notifier,
            config.hmac_secret(),
            config.reset_code_ttl(),
        );
        let service = ElectionService::new(stores.clone(), Arc::new(registry), gate);

        info!("Connecting to ledger at {}...", config.rpc_url());
        match service.registry().ensure_deployed().await {
            Ok(deployment) => info!(
                "...contract live at {} on network {}",
                deployment.address, deployment.network_id
            ),
            Err(e) => warn!("...contract not available yet: {e}"),
        }
        match service.reconcile_pending().await {
            Ok(0) => {}
            Ok(n) => info!("Completed {n} pending finalizations"),
            Err(e) => error!("Failed to reconcile pending operations: {e}"),
        }

        Ok(rocket.manage(service))
    }
}

#[cfg(test)]
mod tests {
    use rocket::figment::{providers::Serialized, Figment};

    use super::*;

    #[test]
    fn defaults_apply() {
        let figment = Figment::from(Serialized::default("hmac_secret", "s3cret"));
        let config: Config = figment.extract().unwrap();
        assert_eq!(config.rpc_url(), "http://127.0.0.1:8545");
        assert_eq!(config.deployment_path(), None);
        assert_eq!(config.receipt_polling(), ReceiptPolling::default());
        assert_eq!(config.reset_code_ttl(), Duration::from_secs(300));
        assert_eq!(config.artifact_sources().len(), 1);
    }

    #[test]
    fn secret_is_required() {
        let figment = Figment::from(Serialized::default("rpc_url", "http://node:8545"));
        assert!(figment.extract::<Config>().is_err());
    }

    #[test]
    fn overrides_apply() {
        let figment = Figment::from(Serialized::default("hmac_secret", "s3cret"))
            .merge(("rpc_url", "http://node:8545"))
            .merge(("deployment_path", "/var/lib/chainvote/deployment.json"))
            .merge(("artifact_paths", ["a.json", "b.json"]))
            .merge(("receipt_poll_interval_ms", 50));
        let config: Config = figment.extract().unwrap();
        assert_eq!(config.rpc_url(), "http://node:8545");
        assert_eq!(
            config.deployment_path(),
            Some(&PathBuf::from("/var/lib/chainvote/deployment.json"))
        );
        assert_eq!(config.artifact_sources().len(), 2);
        assert_eq!(
            config.receipt_polling().interval,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn notifier_follows_webhook() {
        let figment = Figment::from(Serialized::default("hmac_secret", "s3cret"));
        let config: Config = figment.clone().extract().unwrap();
        assert_eq!(config.reset_code_webhook, None);
        assert!(config.notifier().is_ok());

        let config: Config = figment
            .merge(("reset_code_webhook", "http://relay:8080/codes"))
            .extract()
            .unwrap();
        assert_eq!(
            config.reset_code_webhook.as_deref(),
            Some("http://relay:8080/codes")
        );
        assert!(config.notifier().is_ok());
    }
}
