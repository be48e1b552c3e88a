//! Where deployment records live.
//!
//! Besides the live record, a store keeps superseded records for audit, the
//! pending-deployment marker, and the advisory lock that keeps processes
//! sharing the store from deploying concurrently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use rocket::tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::NetworkId;
use crate::model::{ContractDeployment, PendingOperation, SupersededDeployment};

#[rocket::async_trait]
pub trait ContractDeploymentStore: Send + Sync {
    /// The live deployment for `network`, if one is recorded.
    async fn live(&self, network: &NetworkId) -> Result<Option<ContractDeployment>>;

    /// Record `deployment` as live for its network. Any previous record is
    /// moved to the history, never deleted.
    async fn replace_live(&self, deployment: &ContractDeployment) -> Result<()>;

    /// Superseded deployments, oldest first.
    async fn history(&self) -> Result<Vec<SupersededDeployment>>;

    async fn pending(&self, network: &NetworkId) -> Result<Option<PendingOperation>>;

    async fn set_pending(&self, operation: &PendingOperation) -> Result<()>;

    async fn clear_pending(&self, network: &NetworkId) -> Result<()>;

    /// Try to take the cross-process deploy lock for `ttl`. Returns false if
    /// another live holder has it. Expired locks are broken.
    async fn try_lock(&self, holder: &str, ttl: Duration) -> Result<bool>;

    async fn unlock(&self, holder: &str) -> Result<()>;
}

/// Deployment store backed by a JSON record file.
///
/// The record file holds exactly the live [`ContractDeployment`]. Siblings
/// hold the history (`<name>.history.json`), the pending marker
/// (`<name>.pending.json`) and the lock (`<name>.lock`). Every write goes to a
/// temporary file first and is renamed into place, so readers never see a
/// partial record.
pub struct FileDeploymentStore {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

/// Contents of the lock file.
#[derive(Serialize, Deserialize)]
struct LockFile {
    holder: String,
    expire_at: chrono::DateTime<Utc>,
}

impl FileDeploymentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[rocket::async_trait]
impl ContractDeploymentStore for FileDeploymentStore {
    async fn live(&self, network: &NetworkId) -> Result<Option<ContractDeployment>> {
        let record: Option<ContractDeployment> = Self::read_json(&self.path).await?;
        Ok(record.filter(|r| &r.network_id == network))
    }

    async fn replace_live(&self, deployment: &ContractDeployment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(previous) = Self::read_json::<ContractDeployment>(&self.path).await? {
            let history_path = self.sibling(".history.json");
            let mut history: Vec<SupersededDeployment> =
                Self::read_json(&history_path).await?.unwrap_or_default();
            history.push(SupersededDeployment {
                deployment: previous,
                superseded_at: Utc::now(),
            });
            Self::write_json(&history_path, &history).await?;
        }
        Self::write_json(&self.path, deployment).await
    }

    async fn history(&self) -> Result<Vec<SupersededDeployment>> {
        Ok(Self::read_json(&self.sibling(".history.json"))
            .await?
            .unwrap_or_default())
    }

    async fn pending(&self, network: &NetworkId) -> Result<Option<PendingOperation>> {
        let marker: Option<PendingOperation> =
            Self::read_json(&self.sibling(".pending.json")).await?;
        Ok(marker.filter(|m| m.key == crate::model::OperationKey::deploy(network)))
    }

    async fn set_pending(&self, operation: &PendingOperation) -> Result<()> {
        Self::write_json(&self.sibling(".pending.json"), operation).await
    }

    async fn clear_pending(&self, network: &NetworkId) -> Result<()> {
        if self.pending(network).await?.is_some() {
            Self::remove_if_exists(&self.sibling(".pending.json")).await?;
        }
        Ok(())
    }

    async fn try_lock(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let path = self.sibling(".lock");
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(10));
        match Self::read_json::<LockFile>(&path).await {
            Ok(Some(existing)) => {
                if existing.holder == holder {
                    return Ok(true);
                }
                if existing.expire_at > Utc::now() {
                    return Ok(false);
                }
                warn!(
                    "Breaking expired deploy lock held by {} at {}",
                    existing.holder,
                    path.display()
                );
                Self::remove_if_exists(&path).await?;
            }
            Ok(None) => {}
            Err(e) => {
                // Unreadable: age it by its modification time instead.
                let modified = fs::metadata(&path).await?.modified()?;
                let expire_at = chrono::DateTime::<Utc>::from(modified) + ttl;
                if expire_at > Utc::now() {
                    debug!("Unreadable deploy lock {} ({e}) is recent", path.display());
                    return Ok(false);
                }
                warn!("Breaking unreadable deploy lock {} ({e})", path.display());
                Self::remove_if_exists(&path).await?;
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let lock = LockFile {
            holder: holder.to_string(),
            expire_at: Utc::now() + ttl,
        };
        // The lock is written in full under a private name, then linked into
        // place. Linking fails if the lock exists, so only one process wins
        // and nobody ever sees a partial lock.
        let mut staged_name = path.file_name().unwrap_or_default().to_os_string();
        staged_name.push(format!(".{holder}.tmp"));
        let staged = path.with_file_name(staged_name);
        let mut file = fs::File::create(&staged).await?;
        file.write_all(&serde_json::to_vec(&lock)?).await?;
        file.sync_all().await?;
        drop(file);
        let linked = fs::hard_link(&staged, &path).await;
        Self::remove_if_exists(&staged).await?;
        match linked {
            Ok(()) => {
                debug!("Took deploy lock {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, holder: &str) -> Result<()> {
        let path = self.sibling(".lock");
        match Self::read_json::<LockFile>(&path).await.unwrap_or(None) {
            Some(lock) if lock.holder == holder => Self::remove_if_exists(&path).await,
            _ => Ok(()),
        }
    }
}

/// Deployment store held in memory. Useful for tests and tools that do not
/// need the record to survive the process.
#[derive(Default)]
pub struct MemoryDeploymentStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    live: Vec<ContractDeployment>,
    history: Vec<SupersededDeployment>,
    pending: Vec<PendingOperation>,
    lock: Option<(String, chrono::DateTime<Utc>)>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl ContractDeploymentStore for MemoryDeploymentStore {
    async fn live(&self, network: &NetworkId) -> Result<Option<ContractDeployment>> {
        let state = self.state.lock().await;
        Ok(state
            .live
            .iter()
            .find(|d| &d.network_id == network)
            .cloned())
    }

    async fn replace_live(&self, deployment: &ContractDeployment) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let (superseded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.live)
            .into_iter()
            .partition(|d| d.network_id == deployment.network_id);
        state.live = kept;
        state.history.extend(superseded.into_iter().map(|d| SupersededDeployment {
            deployment: d,
            superseded_at: now,
        }));
        state.live.push(deployment.clone());
        Ok(())
    }

    async fn history(&self) -> Result<Vec<SupersededDeployment>> {
        Ok(self.state.lock().await.history.clone())
    }

    async fn pending(&self, network: &NetworkId) -> Result<Option<PendingOperation>> {
        let key = crate::model::OperationKey::deploy(network);
        Ok(self
            .state
            .lock()
            .await
            .pending
            .iter()
            .find(|p| p.key == key)
            .cloned())
    }

    async fn set_pending(&self, operation: &PendingOperation) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pending.retain(|p| p.key != operation.key);
        state.pending.push(operation.clone());
        Ok(())
    }

    async fn clear_pending(&self, network: &NetworkId) -> Result<()> {
        let key = crate::model::OperationKey::deploy(network);
        self.state.lock().await.pending.retain(|p| p.key != key);
        Ok(())
    }

    async fn try_lock(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match &state.lock {
            Some((current, expire_at)) if current != holder && *expire_at > now => Ok(false),
            _ => {
                let ttl = chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10));
                state.lock = Some((holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, holder: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(&state.lock, Some((current, _)) if current == holder) {
            state.lock = None;
        }
        Ok(())
    }
}
