use std::io::Cursor;

use argon2::Error as Argon2Error;
use log::error;
use mongodb::error::Error as DbError;
use rocket::{
    http::{ContentType, Status},
    response::{self, Responder},
    Request, Response,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerError, TxHash};
use crate::model::{ElectionId, ElectionStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Ledger RPC endpoint unreachable: {0}")]
    RpcUnreachable(String),
    #[error("No signer account available")]
    NoSignerAvailable,
    #[error("No artifact source provided a contract ABI")]
    ArtifactMissing,
    #[error("Contract artifact {0} has an ABI but no bytecode")]
    ArtifactIncomplete(String),
    #[error("Ledger request failed: {0}")]
    Ledger(String),
    #[error("Cannot move election from {from} to {to}")]
    InvalidTransition {
        from: ElectionStatus,
        to: ElectionStatus,
    },
    #[error("The candidate list must be locked before the election can open")]
    CandidateListUnlocked,
    #[error("The candidate list is locked")]
    ListLocked,
    #[error("Election {0} is not open for voting")]
    ElectionNotOpen(ElectionId),
    #[error("Admin authentication failed")]
    AuthenticationFailed,
    #[error("Reset confirmation failed")]
    ConfirmationMismatch,
    #[error("Election {0} is already finalized")]
    AlreadyFinalized(ElectionId),
    #[error("Transaction {0} reverted")]
    ChainTxReverted(TxHash),
    #[error("Timed out waiting for transaction {0}; it may still be mined")]
    ChainTxTimeout(TxHash),
    #[error("Outcome of {0} is unknown; it is reconciled before anything is resent")]
    ChainTxUnconfirmed(String),
    #[error("Reset code could not be delivered: {0}")]
    DeliveryFailed(String),
    #[error("Reset not permitted: {0}")]
    ResetPreconditionFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Concurrent modification: {0}")]
    Conflict(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Argon2(#[from] Argon2Error),
}

/// Stable, caller-visible classification of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RpcUnreachable,
    NoSignerAvailable,
    ArtifactMissing,
    ArtifactIncomplete,
    Ledger,
    InvalidTransition,
    CandidateListUnlocked,
    ListLocked,
    ElectionNotOpen,
    AuthenticationFailed,
    ConfirmationMismatch,
    AlreadyFinalized,
    ChainTxReverted,
    ChainTxTimeout,
    ChainTxUnconfirmed,
    DeliveryFailed,
    ResetPreconditionFailed,
    NotFound,
    BadRequest,
    Conflict,
    Internal,
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RpcUnreachable(_) => ErrorKind::RpcUnreachable,
            Self::NoSignerAvailable => ErrorKind::NoSignerAvailable,
            Self::ArtifactMissing => ErrorKind::ArtifactMissing,
            Self::ArtifactIncomplete(_) => ErrorKind::ArtifactIncomplete,
            Self::Ledger(_) => ErrorKind::Ledger,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::CandidateListUnlocked => ErrorKind::CandidateListUnlocked,
            Self::ListLocked => ErrorKind::ListLocked,
            Self::ElectionNotOpen(_) => ErrorKind::ElectionNotOpen,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::ConfirmationMismatch => ErrorKind::ConfirmationMismatch,
            Self::AlreadyFinalized(_) => ErrorKind::AlreadyFinalized,
            Self::ChainTxReverted(_) => ErrorKind::ChainTxReverted,
            Self::ChainTxTimeout(_) => ErrorKind::ChainTxTimeout,
            Self::ChainTxUnconfirmed(_) => ErrorKind::ChainTxUnconfirmed,
            Self::DeliveryFailed(_) => ErrorKind::DeliveryFailed,
            Self::ResetPreconditionFailed(_) => ErrorKind::ResetPreconditionFailed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Db(_) | Self::Io(_) | Self::Json(_) | Self::Argon2(_) => ErrorKind::Internal,
        }
    }

    fn status(&self) -> Status {
        match self.kind() {
            ErrorKind::AuthenticationFailed | ErrorKind::ConfirmationMismatch => {
                Status::Unauthorized
            }
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::BadRequest => Status::BadRequest,
            ErrorKind::InvalidTransition
            | ErrorKind::CandidateListUnlocked
            | ErrorKind::ListLocked
            | ErrorKind::ElectionNotOpen
            | ErrorKind::AlreadyFinalized
            | ErrorKind::ResetPreconditionFailed
            | ErrorKind::Conflict => Status::Conflict,
            ErrorKind::RpcUnreachable
            | ErrorKind::NoSignerAvailable
            | ErrorKind::ArtifactMissing
            | ErrorKind::ArtifactIncomplete
            | ErrorKind::Ledger
            | ErrorKind::ChainTxReverted
            | ErrorKind::DeliveryFailed => Status::BadGateway,
            ErrorKind::ChainTxTimeout | ErrorKind::ChainTxUnconfirmed => Status::GatewayTimeout,
            ErrorKind::Internal => Status::InternalServerError,
        }
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::RpcUnreachable(reason) | LedgerError::NoResponse(reason) => {
                Self::RpcUnreachable(reason)
            }
            LedgerError::NoSignerAvailable => Self::NoSignerAvailable,
            LedgerError::TxReverted(hash) => Self::ChainTxReverted(hash),
            LedgerError::TxTimeout(hash) => Self::ChainTxTimeout(hash),
            other @ (LedgerError::Rpc { .. } | LedgerError::Malformed(_)) => {
                Self::Ledger(other.to_string())
            }
        }
    }
}

/// The JSON body sent with every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let message = match err.kind() {
            // Internal causes stay in the logs.
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => err.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'o> {
        if self.kind() == ErrorKind::Internal {
            error!("Internal error: {self}");
        }
        let body = serde_json::to_string(&ErrorBody::from(&self))
            .map_err(|_| Status::InternalServerError)?;
        Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_taxonomy() {
        let hash = TxHash([1; 32]);
        assert_eq!(
            Error::from(LedgerError::TxReverted(hash)).kind(),
            ErrorKind::ChainTxReverted
        );
        assert_eq!(
            Error::from(LedgerError::TxTimeout(hash)).kind(),
            ErrorKind::ChainTxTimeout
        );
        assert_eq!(
            Error::from(LedgerError::NoSignerAvailable).kind(),
            ErrorKind::NoSignerAvailable
        );
        assert_eq!(
            Error::from(LedgerError::RpcUnreachable("refused".into())).kind(),
            ErrorKind::RpcUnreachable
        );
        assert_eq!(
            Error::from(LedgerError::Malformed("junk".into())).kind(),
            ErrorKind::Ledger
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "/secret/path is on fire",
        ));
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, ErrorKind::Internal);
        assert!(!body.message.contains("secret"));
    }

    #[test]
    fn auth_errors_are_generic() {
        assert_eq!(
            ErrorBody::from(&Error::AuthenticationFailed).message,
            "Admin authentication failed"
        );
        assert_eq!(
            ErrorBody::from(&Error::ConfirmationMismatch).message,
            "Reset confirmation failed"
        );
    }
}
