use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use rocket::tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{
    Admin, AdminAction, Election, ElectionId, OperationKey, PendingOperation, ResetCode,
};

use super::{AdminStore, AuditLog, ElectionStore, PendingOperationStore, ResetCodeStore};

#[derive(Default)]
pub struct MemoryElectionStore {
    next: AtomicU32,
    elections: Mutex<BTreeMap<ElectionId, Election>>,
}

impl MemoryElectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl ElectionStore for MemoryElectionStore {
    async fn next_id(&self) -> Result<ElectionId> {
        Ok(ElectionId(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    async fn insert(&self, election: &Election) -> Result<()> {
        let mut elections = self.elections.lock().await;
        if elections.contains_key(&election.id) {
            return Err(Error::Conflict(format!("Election {} already exists", election.id)));
        }
        elections.insert(election.id, election.clone());
        Ok(())
    }

    async fn get(&self, id: ElectionId) -> Result<Option<Election>> {
        Ok(self.elections.lock().await.get(&id).cloned())
    }

    async fn save(&self, mut election: Election) -> Result<Election> {
        let mut elections = self.elections.lock().await;
        let stored = elections
            .get_mut(&election.id)
            .ok_or_else(|| Error::not_found(format!("Election {}", election.id)))?;
        if stored.revision != election.revision {
            return Err(Error::Conflict(format!(
                "Election {} changed since it was read",
                election.id
            )));
        }
        election.revision += 1;
        *stored = election.clone();
        Ok(election)
    }
}

#[derive(Default)]
pub struct MemoryAdminStore {
    admins: Mutex<HashMap<String, Admin>>,
}

impl MemoryAdminStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl AdminStore for MemoryAdminStore {
    async fn find(&self, username: &str) -> Result<Option<Admin>> {
        Ok(self.admins.lock().await.get(username).cloned())
    }

    async fn insert(&self, admin: Admin) -> Result<()> {
        let mut admins = self.admins.lock().await;
        if admins.contains_key(&admin.username) {
            return Err(Error::BadRequest(format!(
                "Admin username already in use: {}",
                admin.username
            )));
        }
        admins.insert(admin.username.clone(), admin);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.admins.lock().await.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    actions: Mutex<Vec<AdminAction>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, action: AdminAction) -> Result<()> {
        self.actions.lock().await.push(action);
        Ok(())
    }

    async fn for_election(&self, election: ElectionId) -> Result<Vec<AdminAction>> {
        Ok(self
            .actions
            .lock()
            .await
            .iter()
            .filter(|a| a.election_id == Some(election))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPendingStore {
    operations: Mutex<BTreeMap<OperationKey, PendingOperation>>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl PendingOperationStore for MemoryPendingStore {
    async fn put(&self, operation: &PendingOperation) -> Result<()> {
        self.operations
            .lock()
            .await
            .insert(operation.key.clone(), operation.clone());
        Ok(())
    }

    async fn get(&self, key: &OperationKey) -> Result<Option<PendingOperation>> {
        Ok(self.operations.lock().await.get(key).cloned())
    }

    async fn remove(&self, key: &OperationKey) -> Result<()> {
        self.operations.lock().await.remove(key);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.operations.lock().await.values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryResetCodeStore {
    codes: Mutex<HashMap<ElectionId, ResetCode>>,
}

impl MemoryResetCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl ResetCodeStore for MemoryResetCodeStore {
    async fn put(&self, code: ResetCode) -> Result<()> {
        self.codes.lock().await.insert(code.election_id, code);
        Ok(())
    }

    async fn take(&self, election: ElectionId) -> Result<Option<ResetCode>> {
        Ok(self.codes.lock().await.remove(&election))
    }
}
