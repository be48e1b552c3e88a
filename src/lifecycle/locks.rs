use std::collections::HashMap;
use std::sync::Arc;

use rocket::tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ElectionId;

/// One async mutex per election, so that operations on the same election run
/// one at a time while different elections proceed in parallel.
#[derive(Default)]
pub struct ElectionLocks {
    locks: Mutex<HashMap<ElectionId, Arc<Mutex<()>>>>,
}

impl ElectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `election`. Access ends when the guard drops.
    pub async fn lock(&self, election: ElectionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Guards and waiters hold their own reference; the rest are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(election).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
