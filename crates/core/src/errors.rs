use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flows::RunTransitionError;

/// Failure taxonomy shared by providers, runs and the HTTP boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    AuthInvalid,
    UserCancelled,
    StaleClarification,
    RegistryNotFound,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::AuthInvalid => "auth_invalid",
            Self::UserCancelled => "user_cancelled",
            Self::StaleClarification => "stale_clarification",
            Self::RegistryNotFound => "registry_not_found",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "rate_limited" => Some(Self::RateLimited),
            "timeout" => Some(Self::Timeout),
            "auth_invalid" => Some(Self::AuthInvalid),
            "user_cancelled" => Some(Self::UserCancelled),
            "stale_clarification" => Some(Self::StaleClarification),
            "registry_not_found" => Some(Self::RegistryNotFound),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    InvalidRunTransition(#[from] RunTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("tool registry `{name}` does not exist")]
    RegistryNotFound { name: String },
    #[error("clarification `{clarification_id}` is not outstanding")]
    StaleClarification { clarification_id: String },
    #[error("outcome `{outcome}` does not answer a `{kind}` clarification")]
    ClarificationMismatch { outcome: String, kind: String },
    #[error("run `{run_id}` was not found")]
    RunNotFound { run_id: String },
    #[error("conversation `{conversation_id}` has no runs")]
    ConversationNotFound { conversation_id: String },
    #[error("run `{run_id}` cannot be cancelled while {status}")]
    CancelRejected { run_id: String, status: String },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RegistryNotFound { .. } => ErrorKind::RegistryNotFound,
            Self::StaleClarification { .. } => ErrorKind::StaleClarification,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, error_kind: ErrorKind, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, error_kind: ErrorKind, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, error_kind: ErrorKind, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, error_kind: ErrorKind, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, error_kind: ErrorKind, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => {
                "The request conflicts with the current state of the run. Refresh and retry."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { error_kind, .. }
            | Self::NotFound { error_kind, .. }
            | Self::Conflict { error_kind, .. }
            | Self::ServiceUnavailable { error_kind, .. }
            | Self::Internal { error_kind, .. } => *error_kind,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let error_kind = value.kind();
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::InvalidRequest(_)
            | ApplicationError::RegistryNotFound { .. }
            | ApplicationError::ClarificationMismatch { .. } => {
                Self::BadRequest { message, error_kind, correlation_id }
            }
            ApplicationError::RunNotFound { .. } | ApplicationError::ConversationNotFound { .. } => {
                Self::NotFound { message, error_kind, correlation_id }
            }
            ApplicationError::StaleClarification { .. } | ApplicationError::CancelRejected { .. } => {
                Self::Conflict { message, error_kind, correlation_id }
            }
            ApplicationError::Persistence(_) => {
                Self::ServiceUnavailable { message, error_kind, correlation_id }
            }
            ApplicationError::Domain(_)
            | ApplicationError::Integration(_)
            | ApplicationError::Configuration(_) => Self::Internal {
                message: "internal orchestration failure".to_owned(),
                error_kind,
                correlation_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::run::RunStatus;
    use crate::errors::{ApplicationError, DomainError, ErrorKind, InterfaceError};
    use crate::flows::{RunEvent, RunTransitionError};

    #[test]
    fn registry_not_found_maps_to_bad_request_with_kind() {
        let interface = ApplicationError::RegistryNotFound { name: "partner".to_owned() }
            .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                error_kind: ErrorKind::RegistryNotFound,
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
        assert!(interface.message().contains("partner"));
    }

    #[test]
    fn stale_clarification_maps_to_conflict() {
        let interface = ApplicationError::StaleClarification {
            clarification_id: "clr_old".to_owned(),
        }
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Conflict { .. }));
        assert_eq!(interface.error_kind(), ErrorKind::StaleClarification);
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn missing_run_maps_to_not_found() {
        let interface =
            ApplicationError::RunNotFound { run_id: "run_x".to_owned() }.into_interface("req-3");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
        assert_eq!(interface.error_kind(), ErrorKind::Unknown);
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn domain_error_details_do_not_leak_to_clients() {
        let interface = ApplicationError::from(DomainError::from(
            RunTransitionError::InvalidTransition {
                state: RunStatus::Completed,
                event: RunEvent::Started,
            },
        ))
        .into_interface("req-5");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.message(), "internal orchestration failure");
    }

    #[test]
    fn error_kind_storage_encoding_round_trips() {
        for kind in [
            ErrorKind::RateLimited,
            ErrorKind::Timeout,
            ErrorKind::AuthInvalid,
            ErrorKind::UserCancelled,
            ErrorKind::StaleClarification,
            ErrorKind::RegistryNotFound,
            ErrorKind::Unknown,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
