use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::model::{CandidateId, Election, ElectionId};
use crate::service::{ElectionService, NewCandidate};

pub fn routes() -> Vec<Route> {
    routes![lock_candidate_list, add_candidate, remove_candidate]
}

#[post("/elections/<election_id>/lock")]
async fn lock_candidate_list(
    election_id: ElectionId,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.lock_candidate_list(election_id).await?;
    Ok(Json(election))
}

#[post("/elections/<election_id>/candidates", data = "<candidate>", format = "json")]
async fn add_candidate(
    election_id: ElectionId,
    candidate: Json<NewCandidate>,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.add_candidate(election_id, &candidate).await?;
    Ok(Json(election))
}

#[delete("/elections/<election_id>/candidates/<candidate_id>")]
async fn remove_candidate(
    election_id: ElectionId,
    candidate_id: CandidateId,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.remove_candidate(election_id, candidate_id).await?;
    Ok(Json(election))
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::json,
    };

    use super::*;
    use crate::error::{ErrorBody, ErrorKind};
    use crate::testing::Harness;

    #[backend_test]
    async fn edit_then_lock(harness: Harness, client: Client) {
        let election = harness.new_election().await;

        let response = client
            .post(uri!(add_candidate(election.id)))
            .header(ContentType::JSON)
            .body(json!({"name": "Ada Lovelace", "seat": "President"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let updated = response.into_json::<Election>().await.unwrap();
        let added = updated.candidates[0].id;

        let response = client
            .delete(uri!(remove_candidate(election.id, added)))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        assert!(response
            .into_json::<Election>()
            .await
            .unwrap()
            .candidates
            .is_empty());

        let response = client
            .post(uri!(lock_candidate_list(election.id)))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        assert!(response.into_json::<Election>().await.unwrap().candidate_list_locked);

        // Locking is one-way and idempotent.
        let response = client
            .post(uri!(lock_candidate_list(election.id)))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());

        let response = client
            .post(uri!(add_candidate(election.id)))
            .header(ContentType::JSON)
            .body(json!({"name": "Grace Hopper", "seat": "Treasurer"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());
        let body = response.into_json::<ErrorBody>().await.unwrap();
        assert_eq!(body.kind, ErrorKind::ListLocked);
    }

    #[backend_test]
    async fn remove_unknown_candidate(harness: Harness, client: Client) {
        let election = harness.new_election().await;
        let response = client
            .delete(uri!(remove_candidate(election.id, 9)))
            .dispatch()
            .await;
        assert_eq!(Status::NotFound, response.status());
    }

    #[backend_test]
    async fn blank_name_rejected(harness: Harness, client: Client) {
        let election = harness.new_election().await;
        let response = client
            .post(uri!(add_candidate(election.id)))
            .header(ContentType::JSON)
            .body(json!({"name": "  ", "seat": "President"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());
    }
}
