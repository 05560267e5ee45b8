//! Error handling for the Domicare client

use thiserror::Error;

use crate::import::ValidationError;
use crate::models::InterventionStatus;
use crate::session::SessionUnstable;

/// Unified error type for the Domicare client
#[derive(Error, Debug)]
pub enum Error {
    /// Session provider errors
    #[error("Authentication error: {0}")]
    Auth(#[from] domicare_auth::AuthError),

    /// Entity store errors, surfaced without translation
    #[error("Store error: {0}")]
    Store(#[from] domicare_store::StoreError),

    /// Import payload rejected before any network call
    #[error("Invalid import payload: {}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The session never stabilized within the retry budget
    #[error(transparent)]
    Session(#[from] SessionUnstable),

    /// A status change that the intervention lifecycle forbids
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: InterventionStatus,
        to: InterventionStatus,
    },

    /// A row the operation depends on does not exist (or is not visible
    /// to the caller under row-level security)
    #[error("Row not found in {table}: {id}")]
    RowNotFound { table: &'static str, id: String },
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
