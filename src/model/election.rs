use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use mongodb::bson::{to_bson, Bson};
use rocket::request::FromParam;
use rocket::UriDisplayPath;
use serde::{Deserialize, Serialize};

use crate::ledger::{Address, NetworkId, TxHash};

/// Unique election identifier, allocated from a counter.
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    UriDisplayPath,
)]
#[serde(transparent)]
pub struct ElectionId(pub u32);

impl Display for ElectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ElectionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl<'a> FromParam<'a> for ElectionId {
    type Error = std::num::ParseIntError;

    fn from_param(param: &'a str) -> Result<Self, Self::Error> {
        param.parse()
    }
}

impl From<ElectionId> for Bson {
    fn from(id: ElectionId) -> Self {
        Bson::Int64(id.0.into())
    }
}

/// Candidate identifier, unique within its election.
pub type CandidateId = u32;

/// States in the election lifecycle.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionStatus {
    /// Being configured; candidates may change until the list is locked.
    Setup,
    /// Accepting votes.
    Open,
    /// No longer accepting votes; awaiting finalization.
    Closed,
    /// Tally locked on-chain. Terminal.
    Finalized,
}

impl ElectionStatus {
    /// The statuses reachable from this one through ordinary transitions.
    pub fn allowed_next(self) -> &'static [ElectionStatus] {
        match self {
            Self::Setup => &[Self::Open],
            Self::Open => &[Self::Closed],
            Self::Closed => &[Self::Finalized],
            Self::Finalized => &[],
        }
    }

    pub fn can_transition_to(self, target: ElectionStatus) -> bool {
        self.allowed_next().contains(&target)
    }
}

impl Display for ElectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Setup => "Setup",
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Finalized => "Finalized",
        };
        f.write_str(name)
    }
}

impl From<ElectionStatus> for Bson {
    fn from(status: ElectionStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// What caused a history entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryKind {
    Created,
    Transition,
    Reset,
}

/// One entry of an election's append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub status: ElectionStatus,
    pub kind: HistoryKind,
    pub at: DateTime<Utc>,
    pub actor: String,
    /// Mandatory for resets, absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    pub seat: String,
    /// Off-chain cache until finalization, frozen afterwards.
    pub votes: u64,
}

/// Per-candidate counts captured at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTally {
    pub candidate_id: CandidateId,
    pub votes: u64,
}

/// The record of a successful on-chain finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finalization {
    pub tx_hash: TxHash,
    pub finalized_at: DateTime<Utc>,
    pub snapshot: Vec<CandidateTally>,
    /// Hex SHA-256 of the snapshot, as sent to the contract.
    pub snapshot_digest: String,
}

/// An election, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: ElectionId,
    pub title: String,
    pub status: ElectionStatus,
    pub status_history: Vec<StatusEntry>,
    pub candidate_list_locked: bool,
    pub seats: BTreeSet<String>,
    pub candidates: Vec<Candidate>,
    pub total_votes: u64,
    pub contract_address: Option<Address>,
    pub chain_network_id: Option<NetworkId>,
    pub finalization: Option<Finalization>,
    pub next_candidate_id: CandidateId,
    /// Incremented on every successful save; stores reject stale writes.
    pub revision: u64,
}

impl Election {
    /// Create a new election in `Setup`.
    pub fn new(
        id: ElectionId,
        title: String,
        seats: BTreeSet<String>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title,
            status: ElectionStatus::Setup,
            status_history: vec![StatusEntry {
                status: ElectionStatus::Setup,
                kind: HistoryKind::Created,
                at: now,
                actor: actor.to_string(),
                reason: None,
            }],
            candidate_list_locked: false,
            seats,
            candidates: Vec::new(),
            total_votes: 0,
            contract_address: None,
            chain_network_id: None,
            finalization: None,
            next_candidate_id: 1,
            revision: 0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status == ElectionStatus::Finalized
    }

    pub fn candidate(&self, id: CandidateId) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod examples {
    use super::*;

    impl Election {
        /// An election in `Setup` with two seats and no candidates.
        pub fn example() -> Self {
            Self::new(
                ElectionId(1),
                "Student Union 2026".to_string(),
                ["President".to_string(), "Treasurer".to_string()]
                    .into_iter()
                    .collect(),
                "coordinator",
                Utc::now(),
            )
        }

        /// An election in `Setup` with two locked-in candidates.
        pub fn locked_example() -> Self {
            let mut election = Self::example();
            election.candidates = vec![
                Candidate {
                    id: 1,
                    name: "Ada Lovelace".to_string(),
                    seat: "President".to_string(),
                    votes: 0,
                },
                Candidate {
                    id: 2,
                    name: "Charles Babbage".to_string(),
                    seat: "Treasurer".to_string(),
                    votes: 0,
                },
            ];
            election.next_candidate_id = 3;
            election.candidate_list_locked = true;
            election
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use ElectionStatus::*;

        let all = [Setup, Open, Closed, Finalized];
        let allowed = [(Setup, Open), (Open, Closed), (Closed, Finalized)];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn serialised_shape() {
        let election = Election::example();
        let value = serde_json::to_value(&election).unwrap();
        assert_eq!(value["_id"], 1);
        assert_eq!(value["status"], "Setup");
        assert_eq!(value["candidateListLocked"], false);
        assert_eq!(value["statusHistory"][0]["kind"], "created");
        assert!(value["statusHistory"][0].get("reason").is_none());

        let back: Election = serde_json::from_value(value).unwrap();
        assert_eq!(back, election);
    }
}
