//! MRS client-side error types.

use thiserror::Error;

use crate::types::ErrorCode;

#[derive(Error, Debug)]
pub enum MrsError {
    #[error("Server error ({1:?}): {0}")]
    ServerError(String, ErrorCode),

    #[error("Invalid input: {0}")]
    Validation(#[from] crate::validation::ValidationError),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Referral depth exceeded at {0}")]
    DepthExceeded(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MrsError::ServerError("no such registration".to_string(), ErrorCode::NotFound);
        let msg = err.to_string();
        assert!(msg.contains("no such registration"));
        assert!(msg.contains("NotFound"));

        let err = MrsError::DepthExceeded("https://b.example".to_string());
        assert!(err.to_string().contains("b.example"));
    }
}
