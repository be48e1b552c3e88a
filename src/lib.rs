#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::config::{ConfigFairing, DatabaseFairing, LedgerFairing};
use crate::logging::LoggerFairing;
use crate::service::ElectionService;

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod registry;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::Config;

/// Build the server. Everything stateful is set up by the fairings at
/// ignition: config first, then the database, then the ledger and service.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(LedgerFairing)
}

/// Build a server around an already constructed service.
pub fn rocket_for_service(service: ElectionService) -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .manage(service)
}
