//! Errors raised by library activities and collaborators.

use thiserror::Error;

use crate::value_objects::MemberId;

/// Errors that can occur in library workflow activities.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// The member registry does not know the member.
    #[error("Invalid member: {0}")]
    InvalidMember(MemberId),

    /// The member registry could not be reached.
    #[error("Member registry unavailable: {0}")]
    RegistryUnavailable(String),
}

impl From<LibraryError> for saga::ActivityError {
    fn from(err: LibraryError) -> Self {
        saga::ActivityError::Other(Box::new(err))
    }
}
