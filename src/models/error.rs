use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Close code telling the client that authentication failed and it must not reconnect
pub const CLOSE_AUTH_FAILED: u16 = 4000;
/// Generic server-side failure, the client may retry with backoff
pub const CLOSE_SERVER_ERROR: u16 = 1011;
/// The request could not be honoured (e.g. no document name)
pub const CLOSE_POLICY: u16 = 1008;
/// The server is going away
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Errors raised while serving a document session.
///
/// Messages are kept as strings so a single failure can be cloned out to
/// every joiner waiting on the same load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    AuthenticationFailure(String),
    LoadFailure(String),
    SaveFailure(String),
    ProtocolViolation(String),
    Backend(String),
}

impl GatewayError {
    /// WebSocket close code reported to the client for this error
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::AuthenticationFailure(_) => CLOSE_AUTH_FAILED,
            _ => CLOSE_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::AuthenticationFailure(e) => write!(f, "Authentication failed: {}", e),
            GatewayError::LoadFailure(e) => write!(f, "Failed to load document: {}", e),
            GatewayError::SaveFailure(e) => write!(f, "Failed to save document: {}", e),
            GatewayError::ProtocolViolation(e) => write!(f, "Protocol violation: {}", e),
            GatewayError::Backend(e) => write!(f, "Backend error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}
