//! Mapping of MongoDB write failures onto [`crate::error::Error`]. The driver
//! exposes no constants for server error codes.

use mongodb::error::{Error as DbError, ErrorKind, WriteFailure};

use crate::error::Error;

/// Server code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;

/// Return true if the given error is a duplicate key write error.
pub fn is_duplicate_key_error(err: &DbError) -> bool {
    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

/// Replace a duplicate key error with `duplicate()`; pass any other error on.
pub fn on_duplicate(err: DbError, duplicate: impl FnOnce() -> Error) -> Error {
    if is_duplicate_key_error(&err) {
        duplicate()
    } else {
        err.into()
    }
}
