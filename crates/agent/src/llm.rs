use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nexus_core::domain::clarification::{ClarificationId, ClarificationOutcome, ClarificationRequest};
use nexus_core::domain::provider::ProviderDescriptor;
use nexus_core::domain::registry::ToolRegistry;
use nexus_core::errors::ErrorKind;

/// Terminal result of one provider invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Success { payload: Value, tools_used: Vec<String> },
    NeedsClarification { request: ClarificationRequest, tools_used: Vec<String> },
    Failure(ProviderFailure),
}

impl ProviderOutcome {
    pub fn failure(&self) -> Option<&ProviderFailure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A failed invocation. When tools already ran before the failure, `tools_used` lists them
/// and `checkpoint` holds the conversation including their results, so a retry can continue
/// from it instead of running the tools again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

impl ProviderFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), tools_used: Vec::new(), checkpoint: None }
    }

    pub fn with_progress(mut self, tools_used: Vec<String>, checkpoint: Option<String>) -> Self {
        self.tools_used = tools_used;
        self.checkpoint = checkpoint;
        self
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthInvalid, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

/// Everything a provider needs to continue a suspended run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resumption {
    pub clarification_id: ClarificationId,
    pub outcome: ClarificationOutcome,
    pub continuation: String,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// `prompt` is non-empty and `registry` is already resolved. Implementations never panic
    /// or return transport errors directly; every failure is folded into
    /// `ProviderOutcome::Failure`.
    async fn invoke(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        resumption: Option<&Resumption>,
    ) -> ProviderOutcome;

    /// Continues an invocation that failed after running tools, from the `checkpoint` it
    /// reported. Tools whose results the checkpoint holds are not executed again.
    async fn continue_from(
        &self,
        _prompt: &str,
        _registry: &ToolRegistry,
        _checkpoint: &str,
    ) -> ProviderOutcome {
        ProviderOutcome::Failure(ProviderFailure::unknown(
            "provider cannot continue from a checkpoint",
        ))
    }
}
