//! Thin access layer for the on-chain vote ledger.
//!
//! Nothing here knows about elections: the [`LedgerClient`] trait only exposes
//! the handful of RPC operations the coordinator needs. Reads may be retried
//! by implementations; writes never are, so callers that submit transactions
//! are responsible for their own idempotency (see
//! [`crate::model::PendingOperation`] and [`nonce_slot`]).

use std::time::Duration;

use log::warn;
use rocket::tokio::time::{sleep, Instant};
use thiserror::Error;

pub mod abi;
pub mod rpc;
mod types;

#[cfg(test)]
pub mod mock;

pub use rpc::JsonRpcLedger;
pub use types::{
    decode_hex, decode_quantity, encode_hex, encode_quantity, Address, BlockTag, HexError,
    LogEntry, NetworkId, Receipt, Topic, Transaction, TxHash,
};

/// Everything that can go wrong talking to the ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The request never reached the node.
    #[error("RPC endpoint unreachable: {0}")]
    RpcUnreachable(String),
    /// The request may have reached the node, but no answer came back.
    #[error("no response from RPC endpoint: {0}")]
    NoResponse(String),
    /// The node has no accounts to sign with.
    #[error("no signer account available")]
    NoSignerAvailable,
    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The node answered with something we could not interpret.
    #[error("malformed RPC response: {0}")]
    Malformed(String),
    /// The transaction was mined but reverted.
    #[error("transaction {0} reverted")]
    TxReverted(TxHash),
    /// We stopped waiting for a receipt. The transaction may still be mined.
    #[error("timed out waiting for receipt of {0}")]
    TxTimeout(TxHash),
}

impl LedgerError {
    /// Whether a failed submission certainly left nothing at the node.
    pub fn proves_unsent(&self) -> bool {
        matches!(self, Self::RpcUnreachable(_) | Self::Rpc { .. })
    }

    /// Whether a failed read is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcUnreachable(_) | Self::NoResponse(_))
    }
}

/// The RPC operations the coordinator relies on.
#[rocket::async_trait]
pub trait LedgerClient: Send + Sync {
    /// The deployed code at `address`. Empty if nothing is deployed there.
    async fn code_at(&self, address: &Address) -> Result<Vec<u8>, LedgerError>;

    /// Accounts the node can sign for, in the node's order.
    async fn accounts(&self) -> Result<Vec<Address>, LedgerError>;

    async fn estimate_gas(&self, tx: &Transaction) -> Result<u64, LedgerError>;

    /// Number of transactions sent from `address`, which is also the next
    /// nonce it will use.
    async fn transaction_count(
        &self,
        address: &Address,
        tag: BlockTag,
    ) -> Result<u64, LedgerError>;

    /// Submit a transaction without waiting for it to be mined.
    /// Never retried.
    async fn submit(&self, tx: &Transaction) -> Result<TxHash, LedgerError>;

    /// The receipt for `tx_hash`, or `None` if it has not been mined yet.
    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, LedgerError>;

    /// Logs emitted by `address` whose leading topics equal `topics`.
    async fn logs(
        &self,
        address: &Address,
        topics: &[Topic],
    ) -> Result<Vec<LogEntry>, LedgerError>;

    async fn network_id(&self) -> Result<NetworkId, LedgerError>;
}

/// How long and how often to poll for a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Poll until `tx_hash` is mined or the timeout elapses.
///
/// A reverted receipt is returned as-is; interpreting it is up to the caller.
/// Timing out only stops the waiting, the transaction itself may still land.
pub async fn wait_for_receipt(
    ledger: &dyn LedgerClient,
    tx_hash: &TxHash,
    polling: ReceiptPolling,
) -> Result<Receipt, LedgerError> {
    let deadline = Instant::now() + polling.timeout;
    loop {
        if let Some(receipt) = ledger.receipt(tx_hash).await? {
            return Ok(receipt);
        }
        if Instant::now() >= deadline {
            return Err(LedgerError::TxTimeout(*tx_hash));
        }
        sleep(polling.interval).await;
    }
}

/// Where a sender's nonce stands on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSlot {
    /// A transaction with this nonce has been mined. It may or may not be ours.
    Consumed,
    /// The node holds a transaction with this nonce that is not mined yet.
    Queued,
    /// The node knows of no transaction with this nonce.
    Open,
}

/// Look up `nonce` of `sender`. Anything learnt about the chain after this
/// returns [`NonceSlot::Consumed`] already includes that transaction.
pub async fn nonce_slot(
    ledger: &dyn LedgerClient,
    sender: &Address,
    nonce: u64,
) -> Result<NonceSlot, LedgerError> {
    if ledger.transaction_count(sender, BlockTag::Latest).await? > nonce {
        return Ok(NonceSlot::Consumed);
    }
    if ledger.transaction_count(sender, BlockTag::Pending).await? > nonce {
        return Ok(NonceSlot::Queued);
    }
    Ok(NonceSlot::Open)
}

/// Gas bounds applied to every estimate.
pub const MIN_GAS: u64 = 300_000;
pub const MAX_GAS: u64 = 8_000_000;
/// Used when the node cannot estimate.
pub const DEFAULT_GAS: u64 = 3_000_000;

/// Estimate gas for `tx`, clamped to [`MIN_GAS`, `MAX_GAS`], falling back to
/// [`DEFAULT_GAS`] if estimation fails for any reason other than the node
/// being unreachable.
pub async fn bounded_gas(ledger: &dyn LedgerClient, tx: &Transaction) -> Result<u64, LedgerError> {
    match ledger.estimate_gas(tx).await {
        Ok(estimate) => Ok(estimate.clamp(MIN_GAS, MAX_GAS)),
        Err(err @ LedgerError::RpcUnreachable(_)) => Err(err),
        Err(err) => {
            warn!("Gas estimation failed ({err}), using default of {DEFAULT_GAS}");
            Ok(DEFAULT_GAS)
        }
    }
}
