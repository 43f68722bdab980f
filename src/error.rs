use thiserror::Error;

use crate::models::AuthState;

/// Type alias for Result with AuthError
pub type Result<T> = std::result::Result<T, AuthError>;

/// Comprehensive error types for the login automation core
///
/// The taxonomy follows four groups: configuration errors (fail fast, never
/// retried), protocol-state errors (surfaced as tagged results for the
/// caller to act on), transient errors (retryable by the caller) and
/// OTP-specific errors (fatal to the current verify step).
#[derive(Error, Debug)]
pub enum AuthError {
    /// Configuration error - missing recovery email, malformed options, etc.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The login flow reached a state that blocks automation (locked
    /// account, reauth required, passkey interrupt, ...). Carries the raw
    /// state so the caller can branch without string-matching.
    #[error("Login blocked in state {state:?}: {message}")]
    ProtocolState { state: AuthState, message: String },

    /// Submitted credentials were rejected
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The username existence check reported an unknown account
    #[error("Account does not exist: {0}")]
    AccountNotFound(String),

    /// A response could not be mapped to any known page state.
    /// Requires a new classifier rule, not a retry.
    #[error("Unhandled page state: {0}")]
    UnknownPage(String),

    /// The redirect-driving loop exceeded its step bound
    #[error("Redirect loop exceeded after {steps} steps")]
    RedirectLoopExceeded { steps: usize },

    /// A page transition did not produce the expected response shape
    /// (e.g. KMSI confirmation without a 302)
    #[error("Protocol error: {0}")]
    ProtocolViolation(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// OAuth/PKCE token acquisition failed
    #[error("Token acquisition failed: {0}")]
    TokenAcquisition(String),

    /// The OTP poll loop exhausted its timeout
    #[error("OTP retrieval timed out after {attempts} attempts over {waited_secs}s")]
    OtpTimeout { attempts: usize, waited_secs: u64 },

    /// OTP retrieval failed for a reason other than timeout
    /// (no recovery session configured, mailbox fetch error, ...)
    #[error("OTP retrieval failed: {0}")]
    OtpError(String),

    /// Post-login identity verification returned a different account
    #[error("Session verification failed: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// IO error (fixture/config file operations)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Underlying HTTP transport error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl AuthError {
    /// Check if the error is transient and the caller may retry the attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::NetworkError(_)
                | AuthError::RedirectLoopExceeded { .. }
                | AuthError::OtpTimeout { .. }
                | AuthError::HttpError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// The blocking auth state carried by this error, if any
    pub fn state(&self) -> Option<AuthState> {
        match self {
            AuthError::ProtocolState { state, .. } => Some(*state),
            AuthError::InvalidCredentials(_) => Some(AuthState::InvalidCredentials),
            AuthError::UnknownPage(_) => Some(AuthState::Unknown),
            _ => None,
        }
    }
}
