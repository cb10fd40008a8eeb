//! Error taxonomy for the agent.
//!
//! Recoverable transport errors are retried by the HTTP client; everything
//! else is surfaced to the state machine, which decides whether to abort the
//! current phase, pause for user input, or shut down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Internal invariant violation. Fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Transient network failure or retryable HTTP status (5xx, 429).
    #[error("request failed: {0}")]
    Request(String),

    /// Non-retryable HTTP status (4xx other than 429).
    #[error("request rejected with status {status}: {body}")]
    RequestInvalid { status: u16, body: String },

    /// Platform-level GraphQL error payload.
    #[error("gql error: {message}")]
    Gql { message: String, service_error: bool },

    /// A pubsub connection dropped; handled by reconnecting that connection.
    #[error("websocket closed")]
    WebsocketClosed,

    /// Authentication failed or expired; mining pauses until the user acts.
    #[error("login failed: {0}")]
    Login(String),

    /// The platform answered with a challenge we cannot solve headlessly.
    #[error("captcha challenge received")]
    CaptchaRequired,

    /// Non-blocking rate limiter acquisition found an empty bucket.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Control-surface lookups.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("channel is offline: {0}")]
    ChannelOffline(String),

    /// Settings could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// Orderly shutdown requested; propagates through the task tree.
    #[error("exit requested")]
    ExitRequest,
}

impl AgentError {
    /// Whether the HTTP client may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Request(_) => true,
            AgentError::Gql { service_error, .. } => *service_error,
            _ => false,
        }
    }

    /// Process exit code mandated for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::ExitRequest => 0,
            AgentError::Login(_) | AgentError::CaptchaRequired => 2,
            AgentError::Config(_) => 3,
            _ => 1,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Request(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Request(format!("malformed response: {e}"))
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AgentError::Request("timeout".into()).is_retryable());
        // Closed sockets reconnect, they are not retried as requests.
        assert!(!AgentError::WebsocketClosed.is_retryable());
        assert!(AgentError::Gql {
            message: "service error".into(),
            service_error: true
        }
        .is_retryable());
        assert!(!AgentError::Gql {
            message: "PersistedQueryNotFound".into(),
            service_error: false
        }
        .is_retryable());
        assert!(!AgentError::RequestInvalid {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!AgentError::CaptchaRequired.is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AgentError::ExitRequest.exit_code(), 0);
        assert_eq!(AgentError::Login("expired".into()).exit_code(), 2);
        assert_eq!(AgentError::CaptchaRequired.exit_code(), 2);
        assert_eq!(AgentError::Config("bad key".into()).exit_code(), 3);
        assert_eq!(AgentError::Invariant("oops".into()).exit_code(), 1);
    }
}
