use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Address, NetworkId, TxHash};

use super::ElectionId;

/// Identifies a chain write that must happen at most once.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub scope: String,
    pub action: String,
}

impl OperationKey {
    pub fn finalize(election: ElectionId) -> Self {
        Self {
            scope: format!("election:{election}"),
            action: "finalize".to_string(),
        }
    }

    pub fn deploy(network: &NetworkId) -> Self {
        Self {
            scope: format!("network:{network}"),
            action: "deploy".to_string(),
        }
    }

    /// The election a finalize key refers to.
    pub fn finalized_election(&self) -> Option<ElectionId> {
        if self.action != "finalize" {
            return None;
        }
        self.scope.strip_prefix("election:")?.parse().ok()
    }
}

impl Display for OperationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.action)
    }
}

/// Marker persisted before a chain write is submitted, and cleared only once
/// its outcome is settled.
///
/// The write is pinned to `sender` and `nonce`, so however often it is sent
/// at most one copy can be mined. A marker without a `tx_hash` means the node
/// may or may not have accepted it; the nonce is how that gets settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub key: OperationKey,
    pub sender: Address,
    pub nonce: u64,
    pub tx_hash: Option<TxHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn new(key: OperationKey, sender: Address, nonce: u64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            sender,
            nonce,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn submitted(mut self, tx_hash: TxHash, now: DateTime<Utc>) -> Self {
        self.tx_hash = Some(tx_hash);
        self.updated_at = now;
        self
    }
}
