use log::debug;
use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::logging::RequestId;
use crate::model::{CandidateId, Election, ElectionId};
use crate::service::ElectionService;

pub fn routes() -> Vec<Route> {
    routes![record_vote]
}

/// Count a vote in the off-chain cache. The tally only becomes authoritative
/// once the election is finalized on chain.
#[post("/elections/<election_id>/votes/<candidate_id>")]
async fn record_vote(
    election_id: ElectionId,
    candidate_id: CandidateId,
    request_id: &RequestId,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.record_vote(election_id, candidate_id).await?;
    debug!(
        "req{request_id} vote for candidate {candidate_id} in election {election_id}, {} total",
        election.total_votes
    );
    Ok(Json(election))
}
