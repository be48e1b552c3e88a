use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

use super::ElectionId;

/// The kinds of admin action that pass through the authorization gate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdminActionKind {
    Create,
    StatusChange,
    Finalize,
    IssueResetCode,
    Reset,
    ClearVotes,
}

/// An authentication factor presented with a request. Only the factor's name is
/// recorded, never its value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Proof {
    Password,
    ConfirmationCode,
    ConfirmPhrase,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "result", content = "kind")]
pub enum Outcome {
    Succeeded,
    Failed(ErrorKind),
}

impl<T> From<&Result<T, Error>> for Outcome {
    fn from(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(e) => Self::Failed(e.kind()),
        }
    }
}

/// Audit record of one gated admin action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAction {
    pub kind: AdminActionKind,
    /// `None` for actions not tied to an existing election, i.e. creation.
    pub election_id: Option<ElectionId>,
    /// The username presented, whether or not it authenticated.
    pub actor: String,
    pub proofs: Vec<Proof>,
    pub at: DateTime<Utc>,
    pub outcome: Outcome,
}
