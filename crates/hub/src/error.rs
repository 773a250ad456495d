//! Error taxonomy for the public operations. Write failures are caught,
//! classified into one of these categories, and reported to the caller with
//! a human-readable message; they never tear down the subscription set.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No active device or no signed-in principal.
    #[error("no active device or signed-in principal")]
    NotReady,

    /// The requester does not hold the target device's assignment.
    #[error("not authorized to control this device")]
    PermissionDenied,

    /// Transient backend outage (broker currently unreachable).
    #[error("backend temporarily unavailable: {0}")]
    Unavailable(String),

    /// The command channel itself is dead.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The command payload could not be encoded.
    #[error("invalid command payload: {0}")]
    InvalidPayload(String),

    /// Generic category for schedule/threshold writes; the underlying
    /// transport error rides along for logging.
    #[error("write failed: {0}")]
    WriteFailed(#[from] anyhow::Error),

    /// A read channel could not be established or was lost.
    #[error("subscription error: {0}")]
    SubscriptionError(String),
}

impl CoreError {
    /// The message shown to the person at the dashboard. Each category gets
    /// distinct wording; `Unavailable` explicitly invites a retry.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::NotReady => {
                "Select a device and sign in before sending commands.".to_string()
            }
            CoreError::PermissionDenied => {
                "You are not allowed to control this device.".to_string()
            }
            CoreError::Unavailable(_) => {
                "The service is temporarily unavailable — please try again.".to_string()
            }
            CoreError::NetworkError(_) => {
                "Network problem while contacting the device.".to_string()
            }
            CoreError::InvalidPayload(_) => {
                "The command could not be encoded; nothing was sent.".to_string()
            }
            CoreError::WriteFailed(_) => "Saving the change failed.".to_string(),
            CoreError::SubscriptionError(_) => {
                "Lost the connection to the device's data stream.".to_string()
            }
        }
    }

    /// Stable machine-readable tag used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotReady => "not_ready",
            CoreError::PermissionDenied => "permission_denied",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::NetworkError(_) => "network_error",
            CoreError::InvalidPayload(_) => "invalid_payload",
            CoreError::WriteFailed(_) => "write_failed",
            CoreError::SubscriptionError(_) => "subscription_error",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

// ===========================================================================
// Tests
// ===========================================================================
