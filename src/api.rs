use rocket::Route;

mod admin;
mod candidates;
mod public;
mod voting;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(admin::routes());
    routes.extend(candidates::routes());
    routes.extend(public::routes());
    routes.extend(voting::routes());
    routes
}
