use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::error::{Error, Result};
use crate::model::{Election, ElectionStatus, HistoryKind, OperationKey, StatusEntry};
use crate::store::{ElectionStore, PendingOperationStore};

/// Restarts an election's off-chain data. Nothing here touches the chain or
/// the contract deployment.
#[derive(Clone)]
pub struct ResetController {
    elections: Arc<dyn ElectionStore>,
    pending: Arc<dyn PendingOperationStore>,
}

impl ResetController {
    pub fn new(elections: Arc<dyn ElectionStore>, pending: Arc<dyn PendingOperationStore>) -> Self {
        Self { elections, pending }
    }

    async fn finalize_in_flight(&self, election: &Election) -> Result<bool> {
        Ok(self
            .pending
            .get(&OperationKey::finalize(election.id))
            .await?
            .is_some())
    }

    /// Return `election` to `Setup` with an empty, unlocked candidate list.
    ///
    /// Only allowed while no votes are recorded and the election is not
    /// finalized. The reason is kept in the status history.
    pub async fn reset(
        &self,
        mut election: Election,
        reason: &str,
        actor: &str,
    ) -> Result<Election> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::BadRequest("A reset reason is required".to_string()));
        }
        if election.is_finalized() {
            return Err(Error::ResetPreconditionFailed(
                "the election is finalized".to_string(),
            ));
        }
        if election.total_votes != 0 {
            return Err(Error::ResetPreconditionFailed(format!(
                "{} votes have been recorded",
                election.total_votes
            )));
        }
        if self.finalize_in_flight(&election).await? {
            return Err(Error::ResetPreconditionFailed(
                "a finalization is in progress".to_string(),
            ));
        }

        let from = election.status;
        election.candidates.clear();
        election.candidate_list_locked = false;
        election.status = ElectionStatus::Setup;
        election.status_history.push(StatusEntry {
            status: ElectionStatus::Setup,
            kind: HistoryKind::Reset,
            at: Utc::now(),
            actor: actor.to_string(),
            reason: Some(reason.to_string()),
        });
        let saved = self.elections.save(election).await?;
        warn!(
            "Election {} reset from {from} by {actor}: {reason}",
            saved.id
        );
        Ok(saved)
    }

    /// Zero the off-chain vote counts.
    pub async fn clear_votes(&self, mut election: Election, actor: &str) -> Result<Election> {
        if matches!(
            election.status,
            ElectionStatus::Open | ElectionStatus::Finalized
        ) {
            return Err(Error::InvalidTransition {
                from: election.status,
                to: election.status,
            });
        }
        if self.finalize_in_flight(&election).await? {
            return Err(Error::Conflict(format!(
                "Election {} has a finalization in progress",
                election.id
            )));
        }
        let cleared = election.total_votes;
        for candidate in &mut election.candidates {
            candidate.votes = 0;
        }
        election.total_votes = 0;
        let saved = self.elections.save(election).await?;
        info!("Cleared {cleared} votes from election {} by {actor}", saved.id);
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ledger::Address;
    use crate::model::{ElectionId, PendingOperation};
    use crate::store::{MemoryElectionStore, MemoryPendingStore};

    struct Fixture {
        elections: Arc<MemoryElectionStore>,
        pending: Arc<MemoryPendingStore>,
        controller: ResetController,
    }

    impl Fixture {
        async fn with(election: Election) -> Self {
            let elections = Arc::new(MemoryElectionStore::new());
            let pending = Arc::new(MemoryPendingStore::new());
            elections.insert(&election).await.unwrap();
            Self {
                controller: ResetController::new(elections.clone(), pending.clone()),
                elections,
                pending,
            }
        }

        async fn election(&self) -> Election {
            self.elections.get(ElectionId(1)).await.unwrap().unwrap()
        }
    }

    fn closed_with_votes(votes: u64) -> Election {
        let mut election = Election::locked_example();
        election.status = ElectionStatus::Closed;
        election.candidates[0].votes = votes;
        election.total_votes = votes;
        election
    }

    #[rocket::async_test]
    async fn reset_requires_no_votes() {
        let fixture = Fixture::with(closed_with_votes(5)).await;

        let err = fixture
            .controller
            .reset(fixture.election().await, "typo in candidate", "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResetPreconditionFailed);
        let stored = fixture.election().await;
        assert_eq!(stored.status, ElectionStatus::Closed);
        assert_eq!(stored.candidates.len(), 2);
        assert_eq!(stored.revision, 0);
    }

    #[rocket::async_test]
    async fn reset_of_closed_election() {
        let fixture = Fixture::with(closed_with_votes(0)).await;

        let reset = fixture
            .controller
            .reset(fixture.election().await, "  wrong seats  ", "coordinator")
            .await
            .unwrap();
        assert_eq!(reset.status, ElectionStatus::Setup);
        assert!(!reset.candidate_list_locked);
        assert!(reset.candidates.is_empty());
        // Seats are configuration, not data.
        assert_eq!(reset.seats, Election::example().seats);

        let entry = reset.status_history.last().unwrap();
        assert_eq!(entry.kind, HistoryKind::Reset);
        assert_eq!(entry.status, ElectionStatus::Setup);
        assert_eq!(entry.reason.as_deref(), Some("wrong seats"));
        assert_eq!(entry.actor, "coordinator");
    }

    #[rocket::async_test]
    async fn reset_requires_reason() {
        let fixture = Fixture::with(closed_with_votes(0)).await;
        let err = fixture
            .controller
            .reset(fixture.election().await, "   ", "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[rocket::async_test]
    async fn finalized_elections_cannot_reset() {
        let mut election = closed_with_votes(0);
        election.status = ElectionStatus::Finalized;
        let fixture = Fixture::with(election).await;

        let err = fixture
            .controller
            .reset(fixture.election().await, "redo", "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResetPreconditionFailed);
    }

    #[rocket::async_test]
    async fn pending_finalize_blocks_reset_and_clear() {
        let fixture = Fixture::with(closed_with_votes(0)).await;
        let marker = PendingOperation::new(
            OperationKey::finalize(ElectionId(1)),
            Address([0xa1; 20]),
            0,
            Utc::now(),
        );
        fixture.pending.put(&marker).await.unwrap();

        let err = fixture
            .controller
            .reset(fixture.election().await, "redo", "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResetPreconditionFailed);

        let err = fixture
            .controller
            .clear_votes(fixture.election().await, "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[rocket::async_test]
    async fn clear_votes_when_closed() {
        let fixture = Fixture::with(closed_with_votes(5)).await;

        let cleared = fixture
            .controller
            .clear_votes(fixture.election().await, "coordinator")
            .await
            .unwrap();
        assert_eq!(cleared.total_votes, 0);
        assert!(cleared.candidates.iter().all(|c| c.votes == 0));
        assert_eq!(cleared.status, ElectionStatus::Closed);

        // With the votes gone, the election can now be reset.
        fixture
            .controller
            .reset(cleared, "recount", "coordinator")
            .await
            .unwrap();
    }

    #[rocket::async_test]
    async fn clear_votes_forbidden_while_open() {
        let mut election = closed_with_votes(2);
        election.status = ElectionStatus::Open;
        let fixture = Fixture::with(election).await;

        let err = fixture
            .controller
            .clear_votes(fixture.election().await, "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(fixture.election().await.total_votes, 2);
    }
}
