//! The operations exposed to the outside world.
//!
//! [`ElectionService`] composes the lifecycle components behind the
//! authorization gate. Every operation that changes an election holds that
//! election's lock for its whole read-modify-write cycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::{AdminAuthorizationGate, ResetConfirmation};
use crate::lifecycle::{
    CandidateListLock, ElectionLocks, ElectionStateMachine, ResetController, TallyFinalizer,
};
use crate::model::{
    AdminActionKind, AdminCredentials, CandidateId, ContractDeployment, Election, ElectionId,
    ElectionStatus,
};
use crate::registry::ContractRegistry;
use crate::store::{ElectionStore, PendingOperationStore, Stores};

/// Recorded as the actor of changes made while settling pending operations.
pub const RECONCILER: &str = "reconciler";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewElection {
    pub title: String,
    #[serde(default)]
    pub seats: BTreeSet<String>,
    #[serde(flatten)]
    pub credentials: AdminCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: ElectionStatus,
    #[serde(flatten)]
    pub credentials: AdminCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub reason: String,
    #[serde(flatten)]
    pub confirmation: ResetConfirmation,
    #[serde(flatten)]
    pub credentials: AdminCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCandidate {
    pub name: String,
    pub seat: String,
}

#[derive(Clone)]
pub struct ElectionService {
    elections: Arc<dyn ElectionStore>,
    pending: Arc<dyn PendingOperationStore>,
    registry: Arc<ContractRegistry>,
    gate: Arc<AdminAuthorizationGate>,
    locks: Arc<ElectionLocks>,
    state_machine: ElectionStateMachine,
    candidates: CandidateListLock,
    finalizer: Arc<TallyFinalizer>,
    resets: ResetController,
}

impl ElectionService {
    pub fn new(
        stores: Stores,
        registry: Arc<ContractRegistry>,
        gate: AdminAuthorizationGate,
    ) -> Self {
        let finalizer = TallyFinalizer::new(
            stores.elections.clone(),
            stores.pending.clone(),
            registry.ledger(),
            registry.signer(),
            registry.polling(),
        );
        Self {
            state_machine: ElectionStateMachine::new(stores.elections.clone()),
            candidates: CandidateListLock::new(stores.elections.clone()),
            resets: ResetController::new(stores.elections.clone(), stores.pending.clone()),
            finalizer: Arc::new(finalizer),
            elections: stores.elections,
            pending: stores.pending,
            registry,
            gate: Arc::new(gate),
            locks: Arc::new(ElectionLocks::new()),
        }
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub async fn get_election(&self, id: ElectionId) -> Result<Election> {
        self.elections
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Election {id}")))
    }

    pub async fn create_election(
        &self,
        title: &str,
        seats: BTreeSet<String>,
        credentials: &AdminCredentials,
    ) -> Result<Election> {
        self.gate
            .authorize(AdminActionKind::Create, None, credentials, |actor| async move {
                let title = title.trim();
                if title.is_empty() {
                    return Err(Error::BadRequest("Election title must not be blank".to_string()));
                }
                let seats: BTreeSet<String> = seats
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                let id = self.elections.next_id().await?;
                let election = Election::new(id, title.to_string(), seats, &actor, Utc::now());
                self.elections.insert(&election).await?;
                info!("Election {id} \"{title}\" created by {actor}");
                Ok(election)
            })
            .await
    }

    /// Move an election to `target`. Opening binds the election to the live
    /// contract, deploying it if needed; moving to `Finalized` goes through
    /// the on-chain finalization.
    pub async fn change_status(
        &self,
        id: ElectionId,
        target: ElectionStatus,
        credentials: &AdminCredentials,
    ) -> Result<Election> {
        self.gate
            .authorize(
                AdminActionKind::StatusChange,
                Some(id),
                credentials,
                |actor| async move {
                    let _guard = self.locks.lock(id).await;
                    let mut election = self.get_election(id).await?;
                    match target {
                        ElectionStatus::Finalized => {
                            return self.finalizer.finalize(election, &actor).await;
                        }
                        ElectionStatus::Open => {
                            ElectionStateMachine::check(&election, target)?;
                            let deployment = self.registry.ensure_deployed().await?;
                            election.contract_address = Some(deployment.address);
                            election.chain_network_id = Some(deployment.network_id);
                        }
                        _ => {}
                    }
                    self.state_machine
                        .request_transition(election, target, &actor)
                        .await
                },
            )
            .await
    }

    pub async fn finalize_tally(
        &self,
        id: ElectionId,
        credentials: &AdminCredentials,
    ) -> Result<Election> {
        self.gate
            .authorize(
                AdminActionKind::Finalize,
                Some(id),
                credentials,
                |actor| async move {
                    let _guard = self.locks.lock(id).await;
                    let election = self.get_election(id).await?;
                    self.finalizer.finalize(election, &actor).await
                },
            )
            .await
    }

    pub async fn issue_reset_code(
        &self,
        id: ElectionId,
        credentials: &AdminCredentials,
    ) -> Result<()> {
        self.get_election(id).await?;
        self.gate.issue_reset_code(id, credentials).await
    }

    pub async fn reset_election(&self, id: ElectionId, request: &ResetRequest) -> Result<Election> {
        self.gate
            .authorize_reset(
                id,
                &request.credentials,
                &request.confirmation,
                |actor| async move {
                    let _guard = self.locks.lock(id).await;
                    let election = self.get_election(id).await?;
                    self.resets.reset(election, &request.reason, &actor).await
                },
            )
            .await
    }

    pub async fn clear_votes(
        &self,
        id: ElectionId,
        credentials: &AdminCredentials,
    ) -> Result<Election> {
        self.gate
            .authorize(
                AdminActionKind::ClearVotes,
                Some(id),
                credentials,
                |actor| async move {
                    let _guard = self.locks.lock(id).await;
                    let election = self.get_election(id).await?;
                    self.resets.clear_votes(election, &actor).await
                },
            )
            .await
    }

    pub async fn lock_candidate_list(&self, id: ElectionId) -> Result<Election> {
        let _guard = self.locks.lock(id).await;
        let election = self.get_election(id).await?;
        self.candidates.lock(election).await
    }

    pub async fn add_candidate(
        &self,
        id: ElectionId,
        candidate: &NewCandidate,
    ) -> Result<Election> {
        let _guard = self.locks.lock(id).await;
        let election = self.get_election(id).await?;
        self.candidates
            .add_candidate(election, &candidate.name, &candidate.seat)
            .await
    }

    pub async fn remove_candidate(
        &self,
        id: ElectionId,
        candidate: CandidateId,
    ) -> Result<Election> {
        let _guard = self.locks.lock(id).await;
        let election = self.get_election(id).await?;
        self.candidates.remove_candidate(election, candidate).await
    }

    /// Count one vote for `candidate` in the off-chain cache.
    pub async fn record_vote(&self, id: ElectionId, candidate: CandidateId) -> Result<Election> {
        let _guard = self.locks.lock(id).await;
        let mut election = self.get_election(id).await?;
        if election.status != ElectionStatus::Open {
            return Err(Error::ElectionNotOpen(id));
        }
        let entry = election
            .candidates
            .iter_mut()
            .find(|c| c.id == candidate)
            .ok_or_else(|| Error::not_found(format!("Candidate {candidate} in election {id}")))?;
        entry.votes += 1;
        election.total_votes += 1;
        self.elections.save(election).await
    }

    /// The recorded live deployment, without touching the chain.
    pub async fn live_deployment(&self) -> Result<ContractDeployment> {
        self.registry
            .current()
            .await?
            .ok_or_else(|| Error::not_found("Contract deployment"))
    }

    /// Settle every finalization left in flight by an earlier process.
    /// Returns the number of elections finalized as a result.
    pub async fn reconcile_pending(&self) -> Result<usize> {
        let mut finalized = 0;
        for marker in self.pending.all().await? {
            let Some(id) = marker.key.finalized_election() else {
                continue;
            };
            let _guard = self.locks.lock(id).await;
            let Some(election) = self.elections.get(id).await? else {
                warn!("Dropping pending {} for missing election", marker.key);
                self.pending.remove(&marker.key).await?;
                continue;
            };
            match self.finalizer.reconcile(election, RECONCILER).await {
                Ok(Some(_)) => finalized += 1,
                Ok(None) => {}
                Err(e) => error!("Failed to reconcile {}: {e}", marker.key),
            }
        }
        Ok(finalized)
    }
}
