//! Persisted and API-facing types.

pub mod admin;
pub mod audit;
pub mod deployment;
pub mod election;
pub mod pending;
pub mod reset_code;

pub use admin::{Admin, AdminCredentials};
pub use audit::{AdminAction, AdminActionKind, Outcome, Proof};
pub use deployment::{ContractDeployment, SupersededDeployment};
pub use election::{
    Candidate, CandidateId, CandidateTally, Election, ElectionId, ElectionStatus, Finalization,
    HistoryKind, StatusEntry,
};
pub use pending::{OperationKey, PendingOperation};
pub use reset_code::{Code, ResetCode};
