use std::ops::Deref;

use log::debug;
use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::{Admin, AdminAction, Election, PendingOperation, ResetCode};

use super::{counter::Counter, deployments::DeploymentDoc, deployments::LockDoc};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for Admin {
    const NAME: &'static str = "admins";
}

impl MongoCollection for Election {
    const NAME: &'static str = "elections";
}

impl MongoCollection for AdminAction {
    const NAME: &'static str = "admin_actions";
}

impl MongoCollection for PendingOperation {
    const NAME: &'static str = "pending_operations";
}

impl MongoCollection for ResetCode {
    const NAME: &'static str = "reset_codes";
}

impl MongoCollection for DeploymentDoc {
    const NAME: &'static str = "deployments";
}

impl MongoCollection for LockDoc {
    const NAME: &'static str = "locks";
}

impl MongoCollection for Counter {
    const NAME: &'static str = "counters";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Admin collection.
    let admin_index = IndexModel::builder()
        .keys(doc! {"username": 1})
        .options(unique.clone())
        .build();
    Coll::<Admin>::from_db(db)
        .create_index(admin_index, None)
        .await?;

    // Pending operation markers: one per operation key.
    let pending_index = IndexModel::builder()
        .keys(doc! {"key.scope": 1, "key.action": 1})
        .options(unique.clone())
        .build();
    Coll::<PendingOperation>::from_db(db)
        .create_index(pending_index, None)
        .await?;

    // Reset codes: at most one outstanding per election.
    let code_index = IndexModel::builder()
        .keys(doc! {"electionId": 1})
        .options(unique)
        .build();
    Coll::<ResetCode>::from_db(db)
        .create_index(code_index, None)
        .await?;

    // Audit log lookups.
    let audit_index = IndexModel::builder()
        .keys(doc! {"electionId": 1, "at": 1})
        .build();
    Coll::<AdminAction>::from_db(db)
        .create_index(audit_index, None)
        .await?;

    // Live deployment lookups.
    let deployment_index = IndexModel::builder()
        .keys(doc! {"networkId": 1, "live": 1})
        .build();
    Coll::<DeploymentDoc>::from_db(db)
        .create_index(deployment_index, None)
        .await?;

    Ok(())
}
