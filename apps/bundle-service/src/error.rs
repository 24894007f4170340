use std::time::Duration;

use thiserror::Error;

/// Errors reported to callers of the endpoint session API.
///
/// Every variant is recoverable; none of them leaves a session half torn down.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("bundle engine is not running")]
    EngineUnavailable,
    #[error("endpoint {endpoint_id} is already in use")]
    EndpointInUse { endpoint_id: String },
    #[error("engine rejected opening endpoint {endpoint_id}")]
    OpenRejected { endpoint_id: String },
    #[error("endpoint is not open")]
    EndpointNotOpen,
    #[error("session lock not acquired within {waited:?}")]
    AcquireTimeout { waited: Duration },
    #[error("wait for the session lock was interrupted")]
    Interrupted,
    #[error("payload i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine send failed with code {code}")]
    EngineSendFailure { code: i32 },
    #[error("engine failed to close the endpoint handle")]
    EngineCloseFailure,
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),
}

impl EndpointError {
    /// Whether repeating the same call unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EndpointError::AcquireTimeout { .. }
                | EndpointError::Interrupted
                | EndpointError::EngineSendFailure { .. }
        )
    }
}

pub type EndpointResult<T> = Result<T, EndpointError>;
