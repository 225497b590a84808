use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    TransientNetwork(#[from] reqwest::Error),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Challenge could not be resolved: {0}")]
    ChallengeUnresolved(String),

    #[error("Call failed after {attempts} attempts")]
    ConnectionFailure { attempts: u32 },

    #[error("Unauthorized - session may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Client is already logged in")]
    AlreadyLoggedIn,

    #[error("Client is not logged in")]
    NotLoggedIn,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Two-factor authentication failed")]
    TwoFactorFailed,

    #[error("No OTP secret registered for {0}")]
    MissingOtpSecret(String),

    #[error("Invalid OTP secret: {0}")]
    InvalidOtpSecret(String),

    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Harvest item {id} failed: {reason}")]
    HarvestItemFailed { id: String, reason: String },

    #[error("Storage sink failed: {0}")]
    Storage(String),

    #[error("Not supported for {0} accounts")]
    Unsupported(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length for response bodies embedded in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl Error {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut cut = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => Error::Unauthorized,
            403 => Error::AccessDenied(truncated),
            404 => Error::NotFound(truncated),
            429 => Error::RateLimited,
            500..=599 => Error::ServerError(truncated),
            _ => Error::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Conditions the transport absorbs by retrying. Request-building and
    /// decode failures repeat identically, so they are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientNetwork(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            Error::RateLimited => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            Error::from_status(StatusCode::UNAUTHORIZED, ""),
            Error::Unauthorized
        ));
        assert!(matches!(
            Error::from_status(StatusCode::NOT_FOUND, "gone"),
            Error::NotFound(ref body) if body == "gone"
        ));
        assert!(matches!(
            Error::from_status(StatusCode::BAD_GATEWAY, ""),
            Error::ServerError(_)
        ));
        assert!(matches!(
            Error::from_status(StatusCode::IM_A_TEAPOT, ""),
            Error::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "é".repeat(400);
        let truncated = Error::truncate_body(&body);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::RateLimited.is_transient());
        assert!(!Error::ConnectionFailure { attempts: 3 }.is_transient());
        assert!(!Error::ChallengeUnresolved("x".into()).is_transient());
    }

    #[test]
    fn test_builder_error_is_not_transient() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert!(err.is_builder());
        assert!(!Error::from(err).is_transient());
    }
}
