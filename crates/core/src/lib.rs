pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use domain::clarification::{
    Clarification, ClarificationId, ClarificationKind, ClarificationOutcome,
    ClarificationPayload, ClarificationRequest, ClarificationResponse,
};
pub use domain::provider::{ProviderDescriptor, ProviderId};
pub use domain::registry::{RegistryCatalog, ToolCategory, ToolDescriptor, ToolRegistry};
pub use domain::run::{
    ConversationId, ProviderFailureRecord, Run, RunFailure, RunId, RunStatus,
};
pub use errors::{ApplicationError, DomainError, ErrorKind, InterfaceError};
pub use flows::{RunEvent, RunTransitionError};
