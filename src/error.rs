use std::io;

/// Coarse classification of a [`DeployError`], stable enough to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    UntrustedOrigin,
    Configuration,
    Execution,
    Reporting,
    Internal,
}

/// Custom error type for autodeploy operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Invalid event payload: {0}")]
    Validation(String),

    #[error("Untrusted origin: {0}")]
    UntrustedOrigin(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command failed: {operation}\n{message}")]
    Execution { operation: String, message: String },

    #[error("Reporting to {service} failed: {message}")]
    Reporting { service: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Validation(_) | DeployError::Json(_) => ErrorKind::Validation,
            DeployError::UntrustedOrigin(_) => ErrorKind::UntrustedOrigin,
            DeployError::Configuration(_) | DeployError::TomlParse(_) => ErrorKind::Configuration,
            DeployError::Execution { .. } => ErrorKind::Execution,
            DeployError::Reporting { .. } | DeployError::Http(_) => ErrorKind::Reporting,
            DeployError::Io(_) | DeployError::Database(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn reporting(service: &str, message: impl Into<String>) -> Self {
        DeployError::Reporting {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_counts_as_validation() {
        let err: DeployError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn execution_error_message_names_operation() {
        let err = DeployError::Execution {
            operation: "git clone".to_string(),
            message: "exit code 128".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().starts_with("Command failed: git clone"));
    }
}
