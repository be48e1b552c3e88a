use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::model::{AdminCredentials, Election, ElectionId};
use crate::service::{ElectionService, NewElection, ResetRequest, StatusChange};

pub fn routes() -> Vec<Route> {
    routes![
        create_election,
        change_status,
        finalize_tally,
        issue_reset_code,
        reset_election,
        clear_votes,
    ]
}

#[post("/elections", data = "<request>", format = "json")]
async fn create_election(
    request: Json<NewElection>,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let NewElection {
        title,
        seats,
        credentials,
    } = request.0;
    let election = service
        .create_election(&title, seats, &credentials)
        .await?;
    Ok(Json(election))
}

#[post("/elections/<election_id>/status", data = "<change>", format = "json")]
async fn change_status(
    election_id: ElectionId,
    change: Json<StatusChange>,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service
        .change_status(election_id, change.status, &change.credentials)
        .await?;
    Ok(Json(election))
}

#[post("/elections/<election_id>/finalize", data = "<credentials>", format = "json")]
async fn finalize_tally(
    election_id: ElectionId,
    credentials: Json<AdminCredentials>,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.finalize_tally(election_id, &credentials).await?;
    Ok(Json(election))
}

/// The code itself goes to the admin out of band, never into the response.
#[post("/elections/<election_id>/reset-code", data = "<credentials>", format = "json")]
async fn issue_reset_code(
    election_id: ElectionId,
    credentials: Json<AdminCredentials>,
    service: &State<ElectionService>,
) -> Result<()> {
    service.issue_reset_code(election_id, &credentials).await
}

#[post("/elections/<election_id>/reset", data = "<request>", format = "json")]
async fn reset_election(
    election_id: ElectionId,
    request: Json<ResetRequest>,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.reset_election(election_id, &request).await?;
    Ok(Json(election))
}

#[post("/elections/<election_id>/clear-votes", data = "<credentials>", format = "json")]
async fn clear_votes(
    election_id: ElectionId,
    credentials: Json<AdminCredentials>,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.clear_votes(election_id, &credentials).await?;
    Ok(Json(election))
}
