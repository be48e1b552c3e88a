//! Discovery and deployment of the voting contract.
//!
//! [`ContractRegistry::ensure_deployed`] is the only way a deployment record
//! comes into being. It is idempotent: as long as the recorded contract still
//! has code on the chain, it is returned unchanged and nothing is submitted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use rocket::tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

use crate::error::{Error, Result};
use crate::ledger::{
    abi, bounded_gas, nonce_slot, wait_for_receipt, Address, BlockTag, LedgerClient, LedgerError,
    NetworkId, NonceSlot, ReceiptPolling, Transaction, TxHash,
};
use crate::model::{ContractDeployment, OperationKey, PendingOperation, SupersededDeployment};

mod artifact;
mod signer;
mod store;

pub use artifact::{
    find_artifact, Artifact, ArtifactSource, FileArtifactSource, InlineArtifactSource,
    KnownDeployment,
};
pub use signer::{FirstAccountSigner, FixedSigner, SignerProvider};
pub use store::{ContractDeploymentStore, FileDeploymentStore, MemoryDeploymentStore};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

pub struct ContractRegistry {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn ContractDeploymentStore>,
    artifacts: Vec<Box<dyn ArtifactSource>>,
    signer: Arc<dyn SignerProvider>,
    polling: ReceiptPolling,
    lock_ttl: Duration,
    rpc: String,
    /// Identifies this registry as a holder of the store's deploy lock.
    holder: String,
    /// Serialises deployment within this process.
    deploying: Mutex<()>,
}

impl ContractRegistry {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ContractDeploymentStore>,
        artifacts: Vec<Box<dyn ArtifactSource>>,
        signer: Arc<dyn SignerProvider>,
    ) -> Self {
        let holder = format!("{}-{:016x}", std::process::id(), rand::thread_rng().gen::<u64>());
        Self {
            ledger,
            store,
            artifacts,
            signer,
            polling: ReceiptPolling::default(),
            lock_ttl: DEFAULT_LOCK_TTL,
            rpc: String::new(),
            holder,
            deploying: Mutex::new(()),
        }
    }

    pub fn with_polling(mut self, polling: ReceiptPolling) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// The RPC endpoint recorded alongside new deployments.
    pub fn with_rpc(mut self, rpc: impl Into<String>) -> Self {
        self.rpc = rpc.into();
        self
    }

    pub fn ledger(&self) -> Arc<dyn LedgerClient> {
        self.ledger.clone()
    }

    pub fn signer(&self) -> Arc<dyn SignerProvider> {
        self.signer.clone()
    }

    pub fn polling(&self) -> ReceiptPolling {
        self.polling
    }

    /// The recorded live deployment for the connected network, without
    /// checking the chain.
    pub async fn current(&self) -> Result<Option<ContractDeployment>> {
        let network = self.ledger.network_id().await?;
        self.store.live(&network).await
    }

    pub async fn history(&self) -> Result<Vec<SupersededDeployment>> {
        self.store.history().await
    }

    /// Return the verified live deployment, deploying the contract if there
    /// is none.
    pub async fn ensure_deployed(&self) -> Result<ContractDeployment> {
        let network = self.ledger.network_id().await?;

        // Fast path: nothing in flight and the recorded contract is alive.
        if self.store.pending(&network).await?.is_none() {
            if let Some(live) = self.verified_live(&network).await? {
                return Ok(live);
            }
        }

        let _guard = self.deploying.lock().await;
        self.lock_store().await?;
        let result = self.ensure_deployed_locked(&network).await;
        if let Err(e) = self.store.unlock(&self.holder).await {
            error!("Failed to release deploy lock: {e}");
        }
        result
    }

    async fn lock_store(&self) -> Result<()> {
        let deadline = Instant::now() + self.lock_ttl + self.polling.interval;
        while !self.store.try_lock(&self.holder, self.lock_ttl).await? {
            if Instant::now() >= deadline {
                return Err(Error::Conflict(
                    "Timed out waiting for another deployment to finish".to_string(),
                ));
            }
            debug!("Deploy lock is held elsewhere, waiting");
            sleep(self.polling.interval).await;
        }
        Ok(())
    }

    /// The live record for `network`, if its address still has code.
    async fn verified_live(&self, network: &NetworkId) -> Result<Option<ContractDeployment>> {
        let Some(live) = self.store.live(network).await? else {
            return Ok(None);
        };
        if self.ledger.code_at(&live.address).await?.is_empty() {
            warn!(
                "Recorded contract {} on network {network} has no code",
                live.address
            );
            return Ok(None);
        }
        Ok(Some(live))
    }

    async fn ensure_deployed_locked(&self, network: &NetworkId) -> Result<ContractDeployment> {
        if let Some(deployment) = self.reconcile_pending(network).await? {
            return Ok(deployment);
        }

        // Another caller may have finished while we waited for the lock.
        if let Some(live) = self.verified_live(network).await? {
            return Ok(live);
        }

        let artifact = find_artifact(&self.artifacts)
            .await?
            .ok_or(Error::ArtifactMissing)?;

        if let Some(known) = artifact.networks.get(network) {
            if !self.ledger.code_at(&known.address).await?.is_empty() {
                let deployment = ContractDeployment {
                    address: known.address,
                    abi: artifact.abi.clone(),
                    network_id: network.clone(),
                    tx_hash: known.transaction_hash,
                    deployed_at: Utc::now(),
                    rpc: self.rpc.clone(),
                };
                self.store.replace_live(&deployment).await?;
                info!(
                    "Adopted contract {} on network {network} from {}",
                    deployment.address, artifact.origin
                );
                return Ok(deployment);
            }
            debug!(
                "Artifact address {} has no code on network {network}",
                known.address
            );
        }

        self.deploy(network, &artifact).await
    }

    async fn deployment_tx(
        &self,
        artifact: &Artifact,
        sender: Address,
        nonce: u64,
    ) -> Result<Transaction> {
        let bytecode = artifact
            .bytecode
            .clone()
            .ok_or_else(|| Error::ArtifactIncomplete(artifact.origin.clone()))?;
        let tx = Transaction::deployment(bytecode)
            .sent_by(sender)
            .with_nonce(nonce);
        let gas = bounded_gas(self.ledger.as_ref(), &tx).await?;
        Ok(tx.with_gas(gas))
    }

    async fn deploy(&self, network: &NetworkId, artifact: &Artifact) -> Result<ContractDeployment> {
        if artifact.bytecode.is_none() {
            return Err(Error::ArtifactIncomplete(artifact.origin.clone()));
        }
        let sender = self.signer.signer(self.ledger.as_ref()).await?;
        let nonce = self
            .ledger
            .transaction_count(&sender, BlockTag::Pending)
            .await?;
        let tx = self.deployment_tx(artifact, sender, nonce).await?;

        let marker =
            PendingOperation::new(OperationKey::deploy(network), sender, nonce, Utc::now());
        self.store.set_pending(&marker).await?;
        self.send_deployment(network, artifact, marker, &tx, true)
            .await
    }

    /// Submit a deployment and wait for it. The marker is dropped only if the
    /// node certainly did not take a fresh submission.
    async fn send_deployment(
        &self,
        network: &NetworkId,
        artifact: &Artifact,
        marker: PendingOperation,
        tx: &Transaction,
        fresh: bool,
    ) -> Result<ContractDeployment> {
        let tx_hash = match self.ledger.submit(tx).await {
            Ok(hash) => hash,
            Err(e) if fresh && e.proves_unsent() => {
                self.store.clear_pending(network).await?;
                return Err(e.into());
            }
            Err(e) => {
                warn!(
                    "Deployment on network {network} may have reached the node ({e}); marker kept"
                );
                return Err(Error::ChainTxUnconfirmed(format!(
                    "contract deployment on network {network}"
                )));
            }
        };
        info!(
            "Deploying contract on network {network} from {} with nonce {}: {tx_hash}",
            marker.sender, marker.nonce
        );
        self.store
            .set_pending(&marker.submitted(tx_hash, Utc::now()))
            .await?;

        self.complete_deployment(network, artifact, tx_hash).await
    }

    /// Wait for a deployment transaction and record its result. The pending
    /// marker is kept only if we gave up waiting.
    async fn complete_deployment(
        &self,
        network: &NetworkId,
        artifact: &Artifact,
        tx_hash: TxHash,
    ) -> Result<ContractDeployment> {
        let receipt = match wait_for_receipt(self.ledger.as_ref(), &tx_hash, self.polling).await {
            Ok(receipt) => receipt,
            Err(e @ LedgerError::TxTimeout(_)) => {
                warn!("Deployment {tx_hash} not yet mined; will reconcile later");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        if !receipt.success {
            self.store.clear_pending(network).await?;
            return Err(Error::ChainTxReverted(tx_hash));
        }
        let address = receipt.contract_address.ok_or_else(|| {
            Error::Ledger(format!("Receipt for {tx_hash} has no contract address"))
        })?;
        self.record(network, artifact, address, Some(tx_hash)).await
    }

    /// Make `address` the live deployment and clear the marker.
    async fn record(
        &self,
        network: &NetworkId,
        artifact: &Artifact,
        address: Address,
        tx_hash: Option<TxHash>,
    ) -> Result<ContractDeployment> {
        let deployment = ContractDeployment {
            address,
            abi: artifact.abi.clone(),
            network_id: network.clone(),
            tx_hash,
            deployed_at: Utc::now(),
            rpc: self.rpc.clone(),
        };
        self.store.replace_live(&deployment).await?;
        self.store.clear_pending(network).await?;
        info!("Contract deployed at {address} on network {network}");
        Ok(deployment)
    }

    /// Resolve a deployment left in flight by an earlier attempt.
    async fn reconcile_pending(&self, network: &NetworkId) -> Result<Option<ContractDeployment>> {
        let Some(marker) = self.store.pending(network).await? else {
            return Ok(None);
        };
        let artifact = find_artifact(&self.artifacts)
            .await?
            .ok_or(Error::ArtifactMissing)?;
        let Some(tx_hash) = marker.tx_hash else {
            return self.reconcile_unconfirmed(network, &artifact, marker).await;
        };
        info!("Reconciling deployment {tx_hash} on network {network}");
        match self.complete_deployment(network, &artifact, tx_hash).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(Error::ChainTxReverted(_)) => {
                warn!("Earlier deployment {tx_hash} reverted; deploying again");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a deployment whose hash we never learnt. The contract it
    /// would create has a known address, so code there means it landed.
    async fn reconcile_unconfirmed(
        &self,
        network: &NetworkId,
        artifact: &Artifact,
        marker: PendingOperation,
    ) -> Result<Option<ContractDeployment>> {
        match nonce_slot(self.ledger.as_ref(), &marker.sender, marker.nonce).await? {
            NonceSlot::Consumed => {
                let address = abi::create_address(&marker.sender, marker.nonce);
                if !self.ledger.code_at(&address).await?.is_empty() {
                    info!("Unconfirmed deployment on network {network} landed at {address}");
                    return self.record(network, artifact, address, None).await.map(Some);
                }
                warn!(
                    "Nonce {} of {} was used without deploying; deploying again",
                    marker.nonce, marker.sender
                );
                self.store.clear_pending(network).await?;
                Ok(None)
            }
            NonceSlot::Queued => Err(Error::ChainTxUnconfirmed(format!(
                "contract deployment on network {network}"
            ))),
            NonceSlot::Open => {
                info!(
                    "Sending deployment on network {network} again with nonce {}",
                    marker.nonce
                );
                let tx = self
                    .deployment_tx(artifact, marker.sender, marker.nonce)
                    .await?;
                self.send_deployment(network, artifact, marker, &tx, false)
                    .await
                    .map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::Address;

    struct Fixture {
        ledger: Arc<MockLedger>,
        store: Arc<MemoryDeploymentStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ledger: Arc::new(MockLedger::new()),
                store: Arc::new(MemoryDeploymentStore::new()),
            }
        }

        fn registry_with(&self, artifacts: Vec<Box<dyn ArtifactSource>>) -> ContractRegistry {
            ContractRegistry::new(
                self.ledger.clone(),
                self.store.clone(),
                artifacts,
                Arc::new(FirstAccountSigner),
            )
            .with_polling(ReceiptPolling {
                interval: Duration::from_millis(2),
                timeout: Duration::from_millis(40),
            })
            .with_rpc("http://mock")
        }

        fn registry(&self) -> ContractRegistry {
            self.registry_with(vec![Box::new(InlineArtifactSource::new(
                json!([{"type": "function", "name": "finalize"}]),
                Some(vec![0x60, 0x80, 0x60, 0x40]),
            ))])
        }

        fn network() -> NetworkId {
            NetworkId::from("5777")
        }
    }

    #[rocket::async_test]
    async fn ensure_deployed_is_idempotent() {
        let fixture = Fixture::new();
        let registry = fixture.registry();

        let first = registry.ensure_deployed().await.unwrap();
        let second = registry.ensure_deployed().await.unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(fixture.ledger.submissions().len(), 1);
        assert_eq!(first.rpc, "http://mock");

        let submitted = &fixture.ledger.submissions()[0];
        assert_eq!(submitted.from, Some(Address([0xa1; 20])));
        assert_eq!(submitted.gas, Some(1_500_000));
    }

    #[rocket::async_test]
    async fn redeploys_when_code_is_gone() {
        let fixture = Fixture::new();
        let registry = fixture.registry();

        let old = registry.ensure_deployed().await.unwrap();
        fixture.ledger.wipe_chain();
        let new = registry.ensure_deployed().await.unwrap();

        assert_ne!(old.address, new.address);
        assert_eq!(
            fixture.store.live(&Fixture::network()).await.unwrap(),
            Some(new)
        );
        let history = registry.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].deployment.address, old.address);
    }

    #[rocket::async_test]
    async fn adopts_artifact_deployment() {
        let fixture = Fixture::new();
        let known = Address([0x33; 20]);
        fixture.ledger.install_code(known, vec![0xfe]);
        let registry = fixture.registry_with(vec![Box::new(
            InlineArtifactSource::new(json!([]), Some(vec![1]))
                .deployed_on(Fixture::network(), known),
        )]);

        let deployment = registry.ensure_deployed().await.unwrap();
        assert_eq!(deployment.address, known);
        assert!(fixture.ledger.submissions().is_empty());
        assert_eq!(registry.current().await.unwrap(), Some(deployment));
    }

    #[rocket::async_test]
    async fn artifact_address_without_code_is_redeployed() {
        let fixture = Fixture::new();
        let stale = Address([0x44; 20]);
        let registry = fixture.registry_with(vec![Box::new(
            InlineArtifactSource::new(json!([]), Some(vec![1]))
                .deployed_on(Fixture::network(), stale),
        )]);

        let deployment = registry.ensure_deployed().await.unwrap();
        assert_ne!(deployment.address, stale);
        assert_eq!(fixture.ledger.submissions().len(), 1);
    }

    #[rocket::async_test]
    async fn artifact_failures_leave_no_record() {
        let fixture = Fixture::new();

        let err = fixture.registry_with(vec![]).ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactMissing);

        let abi_only =
            fixture.registry_with(vec![Box::new(InlineArtifactSource::new(json!([]), None))]);
        let err = abi_only.ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactIncomplete);

        assert_eq!(fixture.store.live(&Fixture::network()).await.unwrap(), None);
        assert!(fixture.ledger.submissions().is_empty());
    }

    #[rocket::async_test]
    async fn no_signer_leaves_no_record() {
        let fixture = Fixture::new();
        fixture.ledger.set_accounts(vec![]);

        let err = fixture.registry().ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSignerAvailable);
        assert_eq!(fixture.store.live(&Fixture::network()).await.unwrap(), None);
        assert_eq!(fixture.store.pending(&Fixture::network()).await.unwrap(), None);
    }

    #[rocket::async_test]
    async fn unreachable_node() {
        let fixture = Fixture::new();
        fixture.ledger.set_unreachable(true);

        let err = fixture.registry().ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RpcUnreachable);
    }

    #[rocket::async_test]
    async fn reverted_deployment_is_not_recorded() {
        let fixture = Fixture::new();
        let registry = fixture.registry();
        fixture.ledger.revert_next();

        let err = registry.ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainTxReverted);
        assert_eq!(fixture.store.live(&Fixture::network()).await.unwrap(), None);
        assert_eq!(fixture.store.pending(&Fixture::network()).await.unwrap(), None);

        // The next attempt deploys afresh.
        registry.ensure_deployed().await.unwrap();
        assert_eq!(fixture.ledger.submissions().len(), 2);
    }

    #[rocket::async_test]
    async fn timed_out_deployment_is_reconciled_without_resubmitting() {
        let fixture = Fixture::new();
        let registry = fixture.registry();
        fixture.ledger.stall_next();

        let err = registry.ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainTxTimeout);
        let marker = fixture.store.pending(&Fixture::network()).await.unwrap().unwrap();
        assert!(marker.tx_hash.is_some());

        fixture.ledger.mine_stalled();
        let deployment = registry.ensure_deployed().await.unwrap();
        assert_eq!(deployment.tx_hash, marker.tx_hash);
        assert_eq!(fixture.ledger.submissions().len(), 1);
        assert_eq!(fixture.store.pending(&Fixture::network()).await.unwrap(), None);
    }

    #[rocket::async_test]
    async fn lost_response_is_settled_by_address() {
        let fixture = Fixture::new();
        let registry = fixture.registry();
        fixture.ledger.lose_next_response();

        let err = registry.ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainTxUnconfirmed);
        let marker = fixture.store.pending(&Fixture::network()).await.unwrap().unwrap();
        assert_eq!(marker.tx_hash, None);

        let deployment = registry.ensure_deployed().await.unwrap();
        assert_eq!(
            deployment.address,
            abi::create_address(&marker.sender, marker.nonce)
        );
        assert_eq!(deployment.tx_hash, None);
        assert_eq!(fixture.ledger.submissions().len(), 1);
        assert_eq!(fixture.store.pending(&Fixture::network()).await.unwrap(), None);
    }

    #[rocket::async_test]
    async fn queued_deployment_is_not_sent_twice() {
        let fixture = Fixture::new();
        let registry = fixture.registry();
        fixture.ledger.stall_next();
        fixture.ledger.lose_next_response();
        registry.ensure_deployed().await.unwrap_err();

        let err = registry.ensure_deployed().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainTxUnconfirmed);
        assert_eq!(fixture.ledger.submissions().len(), 1);

        fixture.ledger.mine_stalled();
        registry.ensure_deployed().await.unwrap();
        assert_eq!(fixture.ledger.submissions().len(), 1);
    }

    #[rocket::async_test]
    async fn unsent_marker_is_sent_under_its_nonce() {
        let fixture = Fixture::new();
        let sender = Address([0xa1; 20]);
        let marker = PendingOperation::new(
            OperationKey::deploy(&Fixture::network()),
            sender,
            0,
            Utc::now(),
        );
        fixture.store.set_pending(&marker).await.unwrap();

        let deployment = fixture.registry().ensure_deployed().await.unwrap();
        assert_eq!(deployment.address, abi::create_address(&sender, 0));
        let submissions = fixture.ledger.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].nonce, Some(0));
        assert_eq!(fixture.store.pending(&Fixture::network()).await.unwrap(), None);
    }

    #[rocket::async_test]
    async fn nonce_used_elsewhere_deploys_again() {
        let fixture = Fixture::new();
        let sender = Address([0xa1; 20]);
        let marker = PendingOperation::new(
            OperationKey::deploy(&Fixture::network()),
            sender,
            0,
            Utc::now(),
        );
        fixture.store.set_pending(&marker).await.unwrap();
        fixture
            .ledger
            .submit(&Transaction::call(Address([7; 20]), vec![1]).sent_by(sender))
            .await
            .unwrap();

        let deployment = fixture.registry().ensure_deployed().await.unwrap();
        assert_eq!(deployment.address, abi::create_address(&sender, 1));
        assert_eq!(fixture.ledger.submissions().len(), 2);
    }

    #[rocket::async_test]
    async fn concurrent_callers_share_one_deployment() {
        let fixture = Fixture::new();
        let registry = fixture.registry();
        // A second registry over the same store stands in for another process.
        let other = fixture.registry();

        let (a, b, c) = rocket::tokio::join!(
            registry.ensure_deployed(),
            registry.ensure_deployed(),
            other.ensure_deployed()
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a.address, b.address);
        assert_eq!(a.address, c.address);
        assert_eq!(fixture.ledger.submissions().len(), 1);
    }
}
