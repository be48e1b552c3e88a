//! Locking an election's tally on the chain.
//!
//! Finalization is the one chain write per election that must happen exactly
//! once. Before submitting, a [`PendingOperation`] keyed by the election is
//! persisted with the sender and nonce the transaction will use; the
//! transaction hash is added as soon as the node accepts it and the marker is
//! removed only when the outcome is known. Any later attempt (a retry, or
//! reconciliation after a restart) resumes from the marker instead of
//! submitting again. If the node's answer was lost, the `Finalized` event and
//! the sender's nonce tell whether the write landed.

use std::sync::Arc;

use chrono::Utc;
use data_encoding::HEXLOWER;
use log::{info, warn};
use rocket::tokio::sync::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::ledger::{
    abi, bounded_gas, nonce_slot, wait_for_receipt, Address, BlockTag, LedgerClient, LedgerError,
    NonceSlot, ReceiptPolling, Transaction, TxHash,
};
use crate::model::{
    CandidateTally, Election, ElectionStatus, Finalization, OperationKey, PendingOperation,
};
use crate::registry::SignerProvider;
use crate::store::{ElectionStore, PendingOperationStore};

use super::ElectionStateMachine;

/// Per-candidate vote counts, ordered by candidate id.
pub fn snapshot(election: &Election) -> Vec<CandidateTally> {
    let mut tallies: Vec<_> = election
        .candidates
        .iter()
        .map(|c| CandidateTally {
            candidate_id: c.id,
            votes: c.votes,
        })
        .collect();
    tallies.sort_by_key(|t| t.candidate_id);
    tallies
}

/// SHA-256 over each tally as a big-endian `u32` id followed by a big-endian
/// `u64` count.
pub fn snapshot_digest(snapshot: &[CandidateTally]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for tally in snapshot {
        hasher.update(tally.candidate_id.to_be_bytes());
        hasher.update(tally.votes.to_be_bytes());
    }
    hasher.finalize().into()
}

/// What became of a finalize transaction we were waiting on.
enum Outcome {
    Mined(TxHash),
    /// Reverted; the marker has been cleared.
    Reverted(TxHash),
}

/// What an unconfirmed submission turned out to be.
enum Unconfirmed {
    Mined(TxHash),
    /// Its nonce went to a transaction that finalized nothing.
    Abandoned,
    /// The node holds a transaction with its nonce, not yet mined.
    Queued,
    /// Nothing with its nonce reached the node.
    Unsent,
}

/// Where a finalize attempt starts from.
enum Resume {
    Mined(TxHash),
    Fresh,
    /// Send the marker's transaction again under the same nonce.
    Resend(PendingOperation),
}

pub struct TallyFinalizer {
    elections: Arc<dyn ElectionStore>,
    pending: Arc<dyn PendingOperationStore>,
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<dyn SignerProvider>,
    polling: ReceiptPolling,
    /// Serialises nonce allocation and submission within this process.
    submitting: Mutex<()>,
}

impl TallyFinalizer {
    pub fn new(
        elections: Arc<dyn ElectionStore>,
        pending: Arc<dyn PendingOperationStore>,
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<dyn SignerProvider>,
        polling: ReceiptPolling,
    ) -> Self {
        Self {
            elections,
            pending,
            ledger,
            signer,
            polling,
            submitting: Mutex::new(()),
        }
    }

    /// Finalize a `Closed` election on the chain, then record it as `Finalized`.
    pub async fn finalize(&self, election: Election, actor: &str) -> Result<Election> {
        if election.is_finalized() {
            return Err(Error::AlreadyFinalized(election.id));
        }
        if election.status != ElectionStatus::Closed {
            return Err(Error::InvalidTransition {
                from: election.status,
                to: ElectionStatus::Finalized,
            });
        }

        let key = OperationKey::finalize(election.id);
        let resend = match self.pending.get(&key).await? {
            None => None,
            Some(marker) => match self.resume(&election, marker).await? {
                Resume::Mined(tx_hash) => return self.complete(election, tx_hash, actor).await,
                Resume::Fresh => None,
                Resume::Resend(marker) => Some(marker),
            },
        };

        let tx_hash = self.submit(&election, &key, resend).await?;
        match self.await_outcome(&key, tx_hash).await? {
            Outcome::Mined(tx_hash) => self.complete(election, tx_hash, actor).await,
            Outcome::Reverted(tx_hash) => Err(Error::ChainTxReverted(tx_hash)),
        }
    }

    async fn resume(&self, election: &Election, marker: PendingOperation) -> Result<Resume> {
        if let Some(tx_hash) = marker.tx_hash {
            info!("Resuming finalization of election {} from {tx_hash}", election.id);
            return match self.await_outcome(&marker.key, tx_hash).await? {
                Outcome::Mined(tx_hash) => Ok(Resume::Mined(tx_hash)),
                Outcome::Reverted(tx_hash) => {
                    warn!("Earlier finalize {tx_hash} reverted; submitting again");
                    Ok(Resume::Fresh)
                }
            };
        }
        match self.settle_unconfirmed(election, &marker).await? {
            Unconfirmed::Mined(tx_hash) => Ok(Resume::Mined(tx_hash)),
            Unconfirmed::Abandoned => Ok(Resume::Fresh),
            Unconfirmed::Queued => Err(Error::ChainTxUnconfirmed(format!(
                "finalize of election {}",
                election.id
            ))),
            Unconfirmed::Unsent => Ok(Resume::Resend(marker)),
        }
    }

    /// Settle a finalize marker left behind by an earlier process, without
    /// waiting or submitting anything. Returns the election if it was
    /// finalized as a result.
    pub async fn reconcile(&self, election: Election, actor: &str) -> Result<Option<Election>> {
        let key = OperationKey::finalize(election.id);
        let Some(marker) = self.pending.get(&key).await? else {
            return Ok(None);
        };
        if election.is_finalized() {
            self.pending.remove(&key).await?;
            return Ok(None);
        }
        let Some(tx_hash) = marker.tx_hash else {
            return match self.settle_unconfirmed(&election, &marker).await? {
                Unconfirmed::Mined(tx_hash) => {
                    self.complete(election, tx_hash, actor).await.map(Some)
                }
                Unconfirmed::Abandoned => Ok(None),
                Unconfirmed::Queued | Unconfirmed::Unsent => {
                    info!("Finalize of election {} left for the next attempt", election.id);
                    Ok(None)
                }
            };
        };
        match self.ledger.receipt(&tx_hash).await? {
            Some(receipt) if receipt.success => {
                info!("Finalize {tx_hash} of election {} was mined", election.id);
                self.complete(election, tx_hash, actor).await.map(Some)
            }
            Some(_) => {
                warn!("Finalize {tx_hash} of election {} reverted", election.id);
                self.pending.remove(&key).await?;
                Ok(None)
            }
            None => {
                info!("Finalize {tx_hash} of election {} still pending", election.id);
                Ok(None)
            }
        }
    }

    /// Work out what became of a submission whose hash we never learnt. An
    /// abandoned marker is removed.
    async fn settle_unconfirmed(
        &self,
        election: &Election,
        marker: &PendingOperation,
    ) -> Result<Unconfirmed> {
        match nonce_slot(self.ledger.as_ref(), &marker.sender, marker.nonce).await? {
            NonceSlot::Consumed => {
                if let Some(tx_hash) = self.finalized_log(election).await? {
                    info!("Finalize of election {} was mined as {tx_hash}", election.id);
                    return Ok(Unconfirmed::Mined(tx_hash));
                }
                warn!(
                    "Nonce {} of {} was used without finalizing election {}",
                    marker.nonce, marker.sender, election.id
                );
                self.pending.remove(&marker.key).await?;
                Ok(Unconfirmed::Abandoned)
            }
            NonceSlot::Queued => Ok(Unconfirmed::Queued),
            NonceSlot::Open => Ok(Unconfirmed::Unsent),
        }
    }

    /// The transaction that emitted the election's `Finalized` event, if any.
    async fn finalized_log(&self, election: &Election) -> Result<Option<TxHash>> {
        let Some(contract) = election.contract_address else {
            return Ok(None);
        };
        let topics = abi::finalized_topics(election.id.0.into());
        let logs = self.ledger.logs(&contract, &topics).await?;
        Ok(logs.first().map(|log| log.tx_hash))
    }

    /// The contract the election is bound to, provided it still has code.
    async fn live_contract(&self, election: &Election) -> Result<Address> {
        let contract = election.contract_address.ok_or_else(|| {
            Error::Conflict(format!("Election {} is not bound to a contract", election.id))
        })?;
        if self.ledger.code_at(&contract).await?.is_empty() {
            return Err(Error::Conflict(format!(
                "Contract {contract} bound to election {} has no code",
                election.id
            )));
        }
        Ok(contract)
    }

    async fn finalize_tx(
        &self,
        election: &Election,
        contract: Address,
        sender: Address,
        nonce: u64,
    ) -> Result<Transaction> {
        let digest = snapshot_digest(&snapshot(election));
        let tx = Transaction::call(contract, abi::encode_finalize(election.id.0.into(), &digest))
            .sent_by(sender)
            .with_nonce(nonce);
        let gas = bounded_gas(self.ledger.as_ref(), &tx).await?;
        Ok(tx.with_gas(gas))
    }

    /// Submit the finalize transaction, either fresh or again under the
    /// marker's nonce. The marker is dropped only if the node certainly did
    /// not take a fresh submission.
    async fn submit(
        &self,
        election: &Election,
        key: &OperationKey,
        resend: Option<PendingOperation>,
    ) -> Result<TxHash> {
        let contract = self.live_contract(election).await?;
        let _submitting = self.submitting.lock().await;

        let (marker, tx, fresh) = match resend {
            Some(marker) => {
                info!(
                    "Sending finalize of election {} again with nonce {}",
                    election.id, marker.nonce
                );
                let tx = self
                    .finalize_tx(election, contract, marker.sender, marker.nonce)
                    .await?;
                (marker, tx, false)
            }
            None => {
                let sender = self.signer.signer(self.ledger.as_ref()).await?;
                let nonce = self
                    .ledger
                    .transaction_count(&sender, BlockTag::Pending)
                    .await?;
                let tx = self.finalize_tx(election, contract, sender, nonce).await?;
                let marker = PendingOperation::new(key.clone(), sender, nonce, Utc::now());
                self.pending.put(&marker).await?;
                (marker, tx, true)
            }
        };

        let tx_hash = match self.ledger.submit(&tx).await {
            Ok(hash) => hash,
            Err(e) if fresh && e.proves_unsent() => {
                self.pending.remove(key).await?;
                return Err(e.into());
            }
            Err(e) => {
                warn!(
                    "Finalize of election {} may have reached the node ({e}); marker kept",
                    election.id
                );
                return Err(Error::ChainTxUnconfirmed(format!(
                    "finalize of election {}",
                    election.id
                )));
            }
        };
        self.pending
            .put(&marker.submitted(tx_hash, Utc::now()))
            .await?;
        info!("Submitted finalize of election {} as {tx_hash}", election.id);
        Ok(tx_hash)
    }

    /// Wait for `tx_hash`. A timeout keeps the marker and is an error.
    async fn await_outcome(&self, key: &OperationKey, tx_hash: TxHash) -> Result<Outcome> {
        match wait_for_receipt(self.ledger.as_ref(), &tx_hash, self.polling).await {
            Ok(receipt) if receipt.success => Ok(Outcome::Mined(tx_hash)),
            Ok(_) => {
                self.pending.remove(key).await?;
                Ok(Outcome::Reverted(tx_hash))
            }
            Err(e @ LedgerError::TxTimeout(_)) => {
                warn!("Finalize {tx_hash} not yet mined; marker kept for reconciliation");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a mined finalization. The status change, transaction hash and
    /// snapshot are saved together, then the marker is cleared.
    async fn complete(
        &self,
        mut election: Election,
        tx_hash: TxHash,
        actor: &str,
    ) -> Result<Election> {
        let snapshot = snapshot(&election);
        let digest = snapshot_digest(&snapshot);
        ElectionStateMachine::check(&election, ElectionStatus::Finalized)?;
        let now = Utc::now();
        election.finalization = Some(Finalization {
            tx_hash,
            finalized_at: now,
            snapshot,
            snapshot_digest: HEXLOWER.encode(&digest),
        });
        ElectionStateMachine::apply(&mut election, ElectionStatus::Finalized, actor, now);
        let saved = self.elections.save(election).await?;
        self.pending
            .remove(&OperationKey::finalize(saved.id))
            .await?;
        info!("Election {} finalized in {tx_hash}", saved.id);
        Ok(saved)
    }
}
