//! The election lifecycle: status transitions, the candidate list lock,
//! on-chain finalization and resets.
//!
//! Every operation takes the election as read by the caller and persists its
//! change through [`crate::store::ElectionStore::save`], which rejects the
//! write if someone else saved in between. Callers serialise work on one
//! election with [`ElectionLocks`].

mod candidates;
mod finalizer;
mod locks;
mod reset;
mod state_machine;

pub use candidates::CandidateListLock;
pub use finalizer::{snapshot, snapshot_digest, TallyFinalizer};
pub use locks::ElectionLocks;
pub use reset::ResetController;
pub use state_machine::ElectionStateMachine;
