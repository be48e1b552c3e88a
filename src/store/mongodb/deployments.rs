use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime},
    options::{FindOptions, ReplaceOptions},
    Database,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::NetworkId;
use crate::model::{ContractDeployment, OperationKey, PendingOperation, SupersededDeployment};
use crate::registry::ContractDeploymentStore;

use super::{is_duplicate_key_error, Coll};

const DEPLOY_LOCK_ID: &str = "contract_deploy";

/// A deployment record as stored. Exactly one document per network is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDoc {
    #[serde(flatten)]
    pub deployment: ContractDeployment,
    pub live: bool,
    #[serde(default)]
    pub superseded_at: Option<DateTime<Utc>>,
}

/// An advisory lock with an expiry, so a crashed holder cannot wedge others.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub holder: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expire_at: DateTime<Utc>,
}

pub struct MongoDeploymentStore {
    deployments: Coll<DeploymentDoc>,
    locks: Coll<LockDoc>,
    pending: Coll<PendingOperation>,
}

impl MongoDeploymentStore {
    pub fn new(db: &Database) -> Self {
        Self {
            deployments: Coll::from_db(db),
            locks: Coll::from_db(db),
            pending: Coll::from_db(db),
        }
    }
}

fn deploy_key_filter(network: &NetworkId) -> mongodb::bson::Document {
    let key = OperationKey::deploy(network);
    doc! {
        "key.scope": key.scope,
        "key.action": key.action,
    }
}

#[rocket::async_trait]
impl ContractDeploymentStore for MongoDeploymentStore {
    async fn live(&self, network: &NetworkId) -> Result<Option<ContractDeployment>> {
        let filter = doc! { "networkId": network.clone(), "live": true };
        Ok(self
            .deployments
            .find_one(filter, None)
            .await?
            .map(|d| d.deployment))
    }

    async fn replace_live(&self, deployment: &ContractDeployment) -> Result<()> {
        let now = Utc::now();
        let filter = doc! { "networkId": deployment.network_id.clone(), "live": true };
        let update = doc! {
            "$set": { "live": false, "supersededAt": now.to_rfc3339() }
        };
        self.deployments.update_many(filter, update, None).await?;

        let doc = DeploymentDoc {
            deployment: deployment.clone(),
            live: true,
            superseded_at: None,
        };
        self.deployments.insert_one(doc, None).await?;
        Ok(())
    }

    async fn history(&self) -> Result<Vec<SupersededDeployment>> {
        let options = FindOptions::builder()
            .sort(doc! { "supersededAt": 1 })
            .build();
        let docs: Vec<DeploymentDoc> = self
            .deployments
            .find(doc! { "live": false }, options)
            .await?
            .try_collect()
            .await?;
        Ok(docs
            .into_iter()
            .map(|d| SupersededDeployment {
                superseded_at: d.superseded_at.unwrap_or(d.deployment.deployed_at),
                deployment: d.deployment,
            })
            .collect())
    }

    async fn pending(&self, network: &NetworkId) -> Result<Option<PendingOperation>> {
        Ok(self.pending.find_one(deploy_key_filter(network), None).await?)
    }

    async fn set_pending(&self, operation: &PendingOperation) -> Result<()> {
        let filter = doc! {
            "key.scope": &operation.key.scope,
            "key.action": &operation.key.action,
        };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.pending.replace_one(filter, operation, options).await?;
        Ok(())
    }

    async fn clear_pending(&self, network: &NetworkId) -> Result<()> {
        self.pending
            .delete_one(deploy_key_filter(network), None)
            .await?;
        Ok(())
    }

    async fn try_lock(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();

        // Break an expired lock first; a live one is left alone.
        let expired = doc! {
            "_id": DEPLOY_LOCK_ID,
            "expireAt": { "$lt": mongodb::bson::DateTime::from_chrono(now) },
        };
        if let Some(stale) = self.locks.find_one_and_delete(expired, None).await? {
            warn!("Broke expired deploy lock held by {}", stale.holder);
        }

        let lock = LockDoc {
            id: DEPLOY_LOCK_ID.to_string(),
            holder: holder.to_string(),
            expire_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(10)),
        };
        match self.locks.insert_one(&lock, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key_error(&e) => {
                let current = self
                    .locks
                    .find_one(doc! { "_id": DEPLOY_LOCK_ID }, None)
                    .await?;
                Ok(matches!(current, Some(l) if l.holder == holder))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, holder: &str) -> Result<()> {
        self.locks
            .delete_one(doc! { "_id": DEPLOY_LOCK_ID, "holder": holder }, None)
            .await?;
        Ok(())
    }
}
