use mongodb::{
    bson::doc,
    options::{FindOneAndUpdateOptions, ReturnDocument},
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::Coll;

pub const ELECTION_ID_COUNTER_ID: &str = "election_id";

/// A counter object used to implement auto-increment fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    #[serde(rename = "_id")]
    pub id: String,
    pub next: i64,
}

impl Counter {
    /// Atomically increment the counter with the given ID and return the new
    /// value. A missing counter is created, so the first value is 1.
    pub async fn next(counters: &Coll<Counter>, id: &str) -> Result<i64> {
        let update = doc! {
            "$inc": { "next": 1_i64 }
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = counters
            .find_one_and_update(doc! { "_id": id }, update, options)
            .await?
            .ok_or_else(|| Error::not_found(format!("Counter {id}")))?;
        Ok(counter.next)
    }
}
