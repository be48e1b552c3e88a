//! Persistence seams for everything the coordinator owns.
//!
//! Each concern is a trait so the backend can be swapped without touching the
//! lifecycle logic. [`memory`] backs tests and single-process tools,
//! [`mongodb`] backs the server.

use std::sync::Arc;

use log::warn;

use crate::error::Result;
use crate::model::{
    Admin, AdminAction, Election, ElectionId, OperationKey, PendingOperation, ResetCode,
};

pub mod memory;
pub mod mongodb;

pub use memory::{
    MemoryAdminStore, MemoryAuditLog, MemoryElectionStore, MemoryPendingStore,
    MemoryResetCodeStore,
};

/// Every store the service needs, behind their traits.
#[derive(Clone)]
pub struct Stores {
    pub elections: Arc<dyn ElectionStore>,
    pub admins: Arc<dyn AdminStore>,
    pub audit: Arc<dyn AuditLog>,
    pub pending: Arc<dyn PendingOperationStore>,
    pub reset_codes: Arc<dyn ResetCodeStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            elections: Arc::new(MemoryElectionStore::new()),
            admins: Arc::new(MemoryAdminStore::new()),
            audit: Arc::new(MemoryAuditLog::new()),
            pending: Arc::new(MemoryPendingStore::new()),
            reset_codes: Arc::new(MemoryResetCodeStore::new()),
        }
    }

    pub fn mongodb(db: &::mongodb::Database) -> Self {
        Self {
            elections: Arc::new(self::mongodb::MongoElectionStore::new(db)),
            admins: Arc::new(self::mongodb::MongoAdminStore::new(db)),
            audit: Arc::new(self::mongodb::MongoAuditLog::new(db)),
            pending: Arc::new(self::mongodb::MongoPendingStore::new(db)),
            reset_codes: Arc::new(self::mongodb::MongoResetCodeStore::new(db)),
        }
    }
}

#[rocket::async_trait]
pub trait ElectionStore: Send + Sync {
    /// Allocate a fresh election ID.
    async fn next_id(&self) -> Result<ElectionId>;

    async fn insert(&self, election: &Election) -> Result<()>;

    async fn get(&self, id: ElectionId) -> Result<Option<Election>>;

    /// Replace the stored election in a single write.
    ///
    /// The write only happens if the stored revision still equals
    /// `election.revision`; otherwise [`crate::error::Error::Conflict`] is
    /// returned and nothing changes. On success the stored copy, with its
    /// revision incremented, is returned.
    async fn save(&self, election: Election) -> Result<Election>;
}

#[rocket::async_trait]
pub trait AdminStore: Send + Sync {
    async fn find(&self, username: &str) -> Result<Option<Admin>>;

    async fn insert(&self, admin: Admin) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

/// Append-only record of gated admin actions.
#[rocket::async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, action: AdminAction) -> Result<()>;

    /// All actions concerning `election`, oldest first.
    async fn for_election(&self, election: ElectionId) -> Result<Vec<AdminAction>>;
}

#[rocket::async_trait]
pub trait PendingOperationStore: Send + Sync {
    /// Insert or replace the marker for `operation.key`.
    async fn put(&self, operation: &PendingOperation) -> Result<()>;

    async fn get(&self, key: &OperationKey) -> Result<Option<PendingOperation>>;

    async fn remove(&self, key: &OperationKey) -> Result<()>;

    async fn all(&self) -> Result<Vec<PendingOperation>>;
}

#[rocket::async_trait]
pub trait ResetCodeStore: Send + Sync {
    /// Store a code, replacing any earlier code for the same election.
    async fn put(&self, code: ResetCode) -> Result<()>;

    /// Remove and return the code for `election`, so it can only be tried once.
    async fn take(&self, election: ElectionId) -> Result<Option<ResetCode>>;
}

/// Ensure there is at least one admin, creating one from the given
/// credentials if the store is empty.
pub async fn ensure_admin_exists(
    admins: &dyn AdminStore,
    credentials: crate::model::AdminCredentials,
) -> Result<()> {
    if admins.count().await? == 0 {
        warn!(
            "No admins exist; creating bootstrap admin {}",
            credentials.username
        );
        admins.insert(Admin::try_from(credentials)?).await?;
    }
    Ok(())
}
