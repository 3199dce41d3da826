//! Session errors and their categories.

use crate::catalog::CatalogError;
use crate::messages::MessageError;
use crate::player_session::JoinError;
use crate::roster::RosterError;
use crate::sim::SimError;

/// Coarse classification of session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or unexpected messages.
    Protocol,
    VersionMismatch,
    RouteMismatch,
    NameCollision,
    /// A car definition could not be loaded.
    MissingAsset,
    /// The link to a peer dropped.
    TransientNetwork,
    /// A train could not be built or placed from a message.
    InconsistentTrainState,
}

/// Failures surfaced by [`Session`](crate::session::Session) operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    /// The dispatcher link went away.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// Joining needs a local train to announce.
    #[error("no local train to join with")]
    NoLocalTrain,

    /// The operation needs an active multiplayer role.
    #[error("not connected to a session")]
    NotConnected,
}

impl SessionError {
    /// Category of this error, if it belongs to one.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            SessionError::Message(_) => Some(ErrorCategory::Protocol),
            SessionError::Join(JoinError::VersionMismatch { .. }) => Some(ErrorCategory::VersionMismatch),
            SessionError::Join(JoinError::RouteMismatch { .. }) => Some(ErrorCategory::RouteMismatch),
            SessionError::Join(JoinError::NameCollision(_)) => Some(ErrorCategory::NameCollision),
            SessionError::Join(JoinError::Placement(_)) => Some(ErrorCategory::InconsistentTrainState),
            SessionError::Sim(SimError::EmptyRoute(_) | SimError::InvalidSplit { .. }) => {
                Some(ErrorCategory::InconsistentTrainState)
            }
            SessionError::Sim(_) => Some(ErrorCategory::Protocol),
            SessionError::Catalog(_) => Some(ErrorCategory::MissingAsset),
            SessionError::LinkLost(_) | SessionError::NotConnected => Some(ErrorCategory::TransientNetwork),
            SessionError::Roster(_) | SessionError::NoLocalTrain => None,
        }
    }

    /// Whether the error ends the affected peer's participation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            Some(
                ErrorCategory::VersionMismatch
                    | ErrorCategory::RouteMismatch
                    | ErrorCategory::NameCollision
                    | ErrorCategory::TransientNetwork
            )
        )
    }
}
