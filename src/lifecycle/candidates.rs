use std::sync::Arc;

use log::info;

use crate::error::{Error, Result};
use crate::model::{Candidate, CandidateId, Election};
use crate::store::ElectionStore;

/// Guards the candidate list of an election. Once locked, the list can only be
/// emptied by a reset; there is no unlock.
#[derive(Clone)]
pub struct CandidateListLock {
    elections: Arc<dyn ElectionStore>,
}

impl CandidateListLock {
    pub fn new(elections: Arc<dyn ElectionStore>) -> Self {
        Self { elections }
    }

    /// Lock the candidate list. Locking an already locked list is a no-op.
    pub async fn lock(&self, mut election: Election) -> Result<Election> {
        if election.candidate_list_locked {
            return Ok(election);
        }
        election.candidate_list_locked = true;
        let saved = self.elections.save(election).await?;
        info!(
            "Candidate list of election {} locked with {} candidates",
            saved.id,
            saved.candidates.len()
        );
        Ok(saved)
    }

    pub async fn add_candidate(
        &self,
        mut election: Election,
        name: &str,
        seat: &str,
    ) -> Result<Election> {
        if election.candidate_list_locked {
            return Err(Error::ListLocked);
        }
        let (name, seat) = (name.trim(), seat.trim());
        if name.is_empty() || seat.is_empty() {
            return Err(Error::BadRequest(
                "Candidate name and seat must not be blank".to_string(),
            ));
        }
        let id = election.next_candidate_id;
        election.next_candidate_id += 1;
        election.seats.insert(seat.to_string());
        election.candidates.push(Candidate {
            id,
            name: name.to_string(),
            seat: seat.to_string(),
            votes: 0,
        });
        self.elections.save(election).await
    }

    pub async fn remove_candidate(
        &self,
        mut election: Election,
        candidate: CandidateId,
    ) -> Result<Election> {
        if election.candidate_list_locked {
            return Err(Error::ListLocked);
        }
        let before = election.candidates.len();
        election.candidates.retain(|c| c.id != candidate);
        if election.candidates.len() == before {
            return Err(Error::not_found(format!(
                "Candidate {candidate} in election {}",
                election.id
            )));
        }
        self.elections.save(election).await
    }
}
