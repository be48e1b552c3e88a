use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::error::{Error, Result};
use crate::model::{Election, ElectionStatus, HistoryKind, StatusEntry};
use crate::store::ElectionStore;

/// Validates and records election status transitions.
#[derive(Clone)]
pub struct ElectionStateMachine {
    elections: Arc<dyn ElectionStore>,
}

impl ElectionStateMachine {
    pub fn new(elections: Arc<dyn ElectionStore>) -> Self {
        Self { elections }
    }

    /// Check that `election` may move to `target`, without changing anything.
    pub fn check(election: &Election, target: ElectionStatus) -> Result<()> {
        if !election.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: election.status,
                to: target,
            });
        }
        if target == ElectionStatus::Open && !election.candidate_list_locked {
            return Err(Error::CandidateListUnlocked);
        }
        Ok(())
    }

    /// Apply a checked transition to the in-memory election.
    pub fn apply(election: &mut Election, target: ElectionStatus, actor: &str, now: DateTime<Utc>) {
        election.status = target;
        election.status_history.push(StatusEntry {
            status: target,
            kind: HistoryKind::Transition,
            at: now,
            actor: actor.to_string(),
            reason: None,
        });
    }

    /// Move `election` to `target`, persisting the new status and its history
    /// entry in one write.
    pub async fn request_transition(
        &self,
        mut election: Election,
        target: ElectionStatus,
        actor: &str,
    ) -> Result<Election> {
        Self::check(&election, target)?;
        let from = election.status;
        Self::apply(&mut election, target, actor, Utc::now());
        let saved = self.elections.save(election).await?;
        info!(
            "Election {} moved from {from} to {target} by {actor}",
            saved.id
        );
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::ElectionId;
    use crate::store::MemoryElectionStore;

    async fn setup(election: Election) -> (ElectionStateMachine, Arc<MemoryElectionStore>) {
        let store = Arc::new(MemoryElectionStore::new());
        store.insert(&election).await.unwrap();
        (ElectionStateMachine::new(store.clone()), store)
    }

    #[rocket::async_test]
    async fn full_lifecycle() {
        let (machine, store) = setup(Election::locked_example()).await;
        let mut election = store.get(ElectionId(1)).await.unwrap().unwrap();

        for target in [
            ElectionStatus::Open,
            ElectionStatus::Closed,
            ElectionStatus::Finalized,
        ] {
            election = machine
                .request_transition(election, target, "coordinator")
                .await
                .unwrap();
            assert_eq!(election.status, target);
        }

        let stored = store.get(ElectionId(1)).await.unwrap().unwrap();
        assert_eq!(stored, election);
        let statuses: Vec<_> = stored.status_history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                ElectionStatus::Setup,
                ElectionStatus::Open,
                ElectionStatus::Closed,
                ElectionStatus::Finalized
            ]
        );
        assert!(stored.status_history[1..]
            .iter()
            .all(|e| e.kind == HistoryKind::Transition && e.actor == "coordinator"));
    }

    #[rocket::async_test]
    async fn skipping_and_reversing_are_rejected() {
        let (machine, store) = setup(Election::locked_example()).await;
        let election = store.get(ElectionId(1)).await.unwrap().unwrap();

        for target in [
            ElectionStatus::Setup,
            ElectionStatus::Closed,
            ElectionStatus::Finalized,
        ] {
            let err = machine
                .request_transition(election.clone(), target, "coordinator")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        }

        let stored = store.get(ElectionId(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, ElectionStatus::Setup);
        assert_eq!(stored.revision, 0);
    }

    #[rocket::async_test]
    async fn opening_requires_locked_list() {
        let (machine, store) = setup(Election::example()).await;
        let election = store.get(ElectionId(1)).await.unwrap().unwrap();

        let err = machine
            .request_transition(election, ElectionStatus::Open, "coordinator")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CandidateListUnlocked);

        let stored = store.get(ElectionId(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, ElectionStatus::Setup);
        assert_eq!(stored.status_history.len(), 1);
    }

    #[test]
    fn finalized_is_terminal() {
        let mut election = Election::locked_example();
        election.status = ElectionStatus::Finalized;
        for target in [
            ElectionStatus::Setup,
            ElectionStatus::Open,
            ElectionStatus::Closed,
            ElectionStatus::Finalized,
        ] {
            assert!(ElectionStateMachine::check(&election, target).is_err());
        }
    }
}
