use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::{Address, NetworkId, TxHash};

/// A contract deployment, in the persisted record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDeployment {
    pub address: Address,
    pub abi: Value,
    pub network_id: NetworkId,
    /// `None` when the deployment was adopted from an artifact that did not
    /// record its creating transaction.
    pub tx_hash: Option<TxHash>,
    pub deployed_at: DateTime<Utc>,
    /// The RPC endpoint the deployment was made or verified through.
    pub rpc: String,
}

/// A deployment that is no longer trusted, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupersededDeployment {
    #[serde(flatten)]
    pub deployment: ContractDeployment,
    pub superseded_at: DateTime<Utc>,
}
