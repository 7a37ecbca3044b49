//! Errors surfaced by [`RealtimeHub`](crate::hub::RealtimeHub).

use thiserror::Error;

use crate::{hub::HubState, source::TransportError, store::StoreError};

/// Failures returned by the hub's lifecycle and resync operations.
///
/// Registration never fails; callback panics are contained by the registry.
#[derive(Debug, Error)]
pub enum HubError {
    /// The operation is not allowed in the hub's current state.
    #[error("cannot {operation} while hub is {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State the hub was in.
        state: HubState,
    },

    /// A resync was requested before the initial one completed.
    #[error("hub has not completed its initial resync")]
    NotReady,

    /// Fetching unread counts failed; the previous state was kept.
    #[error("unread resync failed: {0}")]
    Resync(#[from] StoreError),

    /// The change source could not be started.
    #[error("change source failed: {0}")]
    Transport(#[from] TransportError),
}

/// Result alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;
