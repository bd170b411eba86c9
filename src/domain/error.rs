//! Typed errors for the devservices domain.
//!
//! Services and the CLI pass these around inside `anyhow::Error`; callers
//! that need to branch on a specific failure use `downcast_ref`.

use thiserror::Error;

/// Mistakes in what the user asked for. Raised before any runtime call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error(
        "Service `{name}` is not known or not enabled.\n\nServices that are available:\n{}",
        available.join("\n")
    )]
    UnknownService {
        name: String,
        available: Vec<String>,
    },

    #[error("No services selected.")]
    NothingSelected,
}

/// Failures reported by the container runtime client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{context}: {message}")]
    Api { context: String, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl RuntimeError {
    pub fn api(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            context: context.into(),
            message: message.into(),
        }
    }

    /// True for failures worth an immediate retry (the daemon answered, but badly).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}

/// Problems in the declarative service table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Empty service name found")]
    EmptyServiceName,

    #[error("Service name '{name}' contains invalid character '{found}'")]
    InvalidServiceName { name: String, found: char },

    #[error("Service '{0}' has no 'image'")]
    MissingImage(String),

    #[error("Service '{service}', variable '{variable}': {reason}")]
    Interpolation {
        service: String,
        variable: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_service_lists_available_names() {
        let err = UsageError::UnknownService {
            name: "kafak".into(),
            available: vec!["kafka".into(), "postgres".into()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Service `kafak` is not known"));
        assert!(msg.ends_with("kafka\npostgres"));
    }

    #[test]
    fn only_api_errors_are_transient() {
        assert!(RuntimeError::api("pulling redis", "EOF").is_transient());
        assert!(!RuntimeError::Cancelled.is_transient());
    }
}
