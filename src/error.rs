//! The booking error taxonomy (SPEC_FULL.md §7), grounded on
//! `original_source/wodbooker/exceptions.py`. Exception-driven control flow
//! in the source is replaced with tagged `Result` alternatives the worker's
//! main loop dispatches on (SPEC_FULL.md §9).

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BookingError {
    /// Network failure, 5xx, or unparseable JSON. Retried with linear
    /// backoff, capped by MAX_ERRORS.
    #[error("transient portal error: {0}")]
    Transient(String),

    /// A response could not be parsed in a context where no network error
    /// occurred (e.g. tokens missing from a login page).
    #[error("unparseable portal response: {0}")]
    UnparseableResponse(String),

    /// 4xx "locked" response from a claim endpoint. Small fixed backoff,
    /// does not count against the error budget.
    #[error("booking locked")]
    BookingLocked,

    /// Matching class entry is full.
    #[error("class is full")]
    ClassFull,

    /// Booking window not yet open. Carries the portal-reported opening
    /// time when known.
    #[error("booking window not open")]
    BookingWindowNotOpen(Option<NaiveDateTime>),

    /// Claim rejected with a portal-reported penalty marker.
    #[error("booking penalty: {0}")]
    BookingPenalty(String),

    /// No schedule entry found matching the target time.
    #[error("class not found")]
    ClassNotFound,

    /// Claim rejected for a reason other than penalty/full/locked.
    #[error("booking failed: {0}")]
    BookingFailed(String),

    /// Cookie login failed and no password was configured to fall back to.
    #[error("password required")]
    PasswordRequired,

    /// Fresh credential login was rejected by the portal.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The user lacks access to the configured box.
    #[error("invalid box")]
    InvalidBox,
}

impl BookingError {
    /// Per SPEC_FULL.md §7's taxonomy: whether this error should terminate
    /// the worker rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BookingError::PasswordRequired
                | BookingError::InvalidCredentials
                | BookingError::InvalidBox
        )
    }
}
