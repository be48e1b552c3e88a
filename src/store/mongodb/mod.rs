//! MongoDB backends for the store traits.

mod collection;
mod counter;
mod deployments;
mod errors;

pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use counter::{Counter, ELECTION_ID_COUNTER_ID};
pub use deployments::{DeploymentDoc, LockDoc, MongoDeploymentStore};
pub use errors::{is_duplicate_key_error, on_duplicate};

use mongodb::{
    bson::doc,
    options::{FindOptions, ReplaceOptions},
    Database,
};
use rocket::futures::TryStreamExt;

use crate::error::{Error, Result};
use crate::model::{
    Admin, AdminAction, Election, ElectionId, OperationKey, PendingOperation, ResetCode,
};

use super::{AdminStore, AuditLog, ElectionStore, PendingOperationStore, ResetCodeStore};

pub struct MongoElectionStore {
    elections: Coll<Election>,
    counters: Coll<Counter>,
}

impl MongoElectionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            elections: Coll::from_db(db),
            counters: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl ElectionStore for MongoElectionStore {
    async fn next_id(&self) -> Result<ElectionId> {
        let next = Counter::next(&self.counters, ELECTION_ID_COUNTER_ID).await?;
        u32::try_from(next)
            .map(ElectionId)
            .map_err(|_| Error::Conflict("Election ID space exhausted".to_string()))
    }

    async fn insert(&self, election: &Election) -> Result<()> {
        self.elections
            .insert_one(election, None)
            .await
            .map_err(|e| {
                on_duplicate(e, || {
                    Error::Conflict(format!("Election {} already exists", election.id))
                })
            })?;
        Ok(())
    }

    async fn get(&self, id: ElectionId) -> Result<Option<Election>> {
        Ok(self.elections.find_one(doc! { "_id": id }, None).await?)
    }

    async fn save(&self, mut election: Election) -> Result<Election> {
        let expected = election.revision as i64;
        election.revision += 1;
        let filter = doc! {
            "_id": election.id,
            "revision": expected,
        };
        let result = self
            .elections
            .replace_one(filter, &election, ReplaceOptions::default())
            .await?;
        if result.matched_count == 0 {
            // Distinguish a missing election from a stale revision.
            return match self.get(election.id).await? {
                Some(_) => Err(Error::Conflict(format!(
                    "Election {} changed since it was read",
                    election.id
                ))),
                None => Err(Error::not_found(format!("Election {}", election.id))),
            };
        }
        Ok(election)
    }
}

pub struct MongoAdminStore {
    admins: Coll<Admin>,
}

impl MongoAdminStore {
    pub fn new(db: &Database) -> Self {
        Self {
            admins: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl AdminStore for MongoAdminStore {
    async fn find(&self, username: &str) -> Result<Option<Admin>> {
        Ok(self
            .admins
            .find_one(doc! { "username": username }, None)
            .await?)
    }

    async fn insert(&self, admin: Admin) -> Result<()> {
        self.admins.insert_one(&admin, None).await.map_err(|e| {
            on_duplicate(e, || {
                Error::BadRequest(format!("Admin username already in use: {}", admin.username))
            })
        })?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.admins.count_documents(None, None).await?)
    }
}

pub struct MongoAuditLog {
    actions: Coll<AdminAction>,
}

impl MongoAuditLog {
    pub fn new(db: &Database) -> Self {
        Self {
            actions: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl AuditLog for MongoAuditLog {
    async fn append(&self, action: AdminAction) -> Result<()> {
        self.actions.insert_one(action, None).await?;
        Ok(())
    }

    async fn for_election(&self, election: ElectionId) -> Result<Vec<AdminAction>> {
        let options = FindOptions::builder().sort(doc! { "at": 1 }).build();
        Ok(self
            .actions
            .find(doc! { "electionId": election }, options)
            .await?
            .try_collect()
            .await?)
    }
}

pub struct MongoPendingStore {
    operations: Coll<PendingOperation>,
}

impl MongoPendingStore {
    pub fn new(db: &Database) -> Self {
        Self {
            operations: Coll::from_db(db),
        }
    }
}

fn key_filter(key: &OperationKey) -> mongodb::bson::Document {
    doc! {
        "key.scope": &key.scope,
        "key.action": &key.action,
    }
}

#[rocket::async_trait]
impl PendingOperationStore for MongoPendingStore {
    async fn put(&self, operation: &PendingOperation) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.operations
            .replace_one(key_filter(&operation.key), operation, options)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &OperationKey) -> Result<Option<PendingOperation>> {
        Ok(self.operations.find_one(key_filter(key), None).await?)
    }

    async fn remove(&self, key: &OperationKey) -> Result<()> {
        self.operations.delete_one(key_filter(key), None).await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.operations.find(None, None).await?.try_collect().await?)
    }
}

pub struct MongoResetCodeStore {
    codes: Coll<ResetCode>,
}

impl MongoResetCodeStore {
    pub fn new(db: &Database) -> Self {
        Self {
            codes: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl ResetCodeStore for MongoResetCodeStore {
    async fn put(&self, code: ResetCode) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.codes
            .replace_one(doc! { "electionId": code.election_id }, &code, options)
            .await?;
        Ok(())
    }

    async fn take(&self, election: ElectionId) -> Result<Option<ResetCode>> {
        // Atomic remove-and-return, so two racing attempts cannot both see it.
        Ok(self
            .codes
            .find_one_and_delete(doc! { "electionId": election }, None)
            .await?)
    }
}
