use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::model::{ContractDeployment, Election, ElectionId};
use crate::service::ElectionService;

pub fn routes() -> Vec<Route> {
    routes![election, deployment]
}

#[get("/elections/<election_id>")]
async fn election(
    election_id: ElectionId,
    service: &State<ElectionService>,
) -> Result<Json<Election>> {
    let election = service.get_election(election_id).await?;
    Ok(Json(election))
}

/// The live contract on the connected network. Never deploys.
#[get("/deployment")]
async fn deployment(service: &State<ElectionService>) -> Result<Json<ContractDeployment>> {
    let deployment = service.live_deployment().await?;
    Ok(Json(deployment))
}
