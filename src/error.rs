use thiserror::Error;

pub type Result<T> = core::result::Result<T, SchedulerError>;

/// Crate-wide error taxonomy. Orchestrator responses are classified by
/// status code; everything the transport layer produces lands in
/// `Transport`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("orchestrator returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Internal(String),
}

impl SchedulerError {
    /// HTTP status reported back to callers of the scheduler operations.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Malformed(_) => 400,
            Self::AuthFailed(_) => 403,
            Self::Api { status, .. } => *status,
            Self::Transport(_) | Self::Unsupported(_) | Self::Internal(_) => 500,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }
}

impl From<kube::Error> for SchedulerError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                400 => Self::Malformed(resp.message),
                404 => Self::NotFound(resp.message),
                409 => Self::Conflict(resp.message),
                401 | 403 => Self::AuthFailed(resp.message),
                code => Self::Api {
                    status: code,
                    message: resp.message,
                },
            },
            kube::Error::Auth(err) => Self::AuthFailed(err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<kube::config::InferConfigError> for SchedulerError {
    fn from(err: kube::config::InferConfigError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for SchedulerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_status_classification() {
        assert!(SchedulerError::from(api_error(404)).is_not_found());
        assert!(SchedulerError::from(api_error(409)).is_conflict());
        assert!(SchedulerError::from(api_error(401)).is_auth());
        assert!(SchedulerError::from(api_error(403)).is_auth());
        assert!(matches!(
            SchedulerError::from(api_error(400)),
            SchedulerError::Malformed(_)
        ));
    }

    #[test]
    fn test_other_statuses_keep_their_code() {
        let err = SchedulerError::from(api_error(422));
        assert!(matches!(err, SchedulerError::Api { status: 422, .. }));
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn test_transport_surfaces_as_500() {
        let err = SchedulerError::Transport("connection reset".to_string());
        assert_eq!(err.status(), 500);
    }
}
