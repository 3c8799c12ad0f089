use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::clarification::Clarification;
use crate::domain::provider::ProviderId;
use crate::domain::registry::ToolRegistry;
use crate::errors::ErrorKind;
use crate::flows::{FlowDefinition, RunEvent, RunFlow, RunTransitionError, TransitionOutcome};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingClarification,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "awaiting_clarification" => Some(Self::AwaitingClarification),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailureRecord {
    pub provider_id: ProviderId,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    /// Tools the provider ran before it failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub summary: String,
    pub provider_failures: Vec<ProviderFailureRecord>,
}

impl RunFailure {
    /// Aggregates per-provider terminal failures. The run-level kind is the shared kind when
    /// every provider failed the same way, otherwise `Unknown`.
    pub fn exhausted(provider_failures: Vec<ProviderFailureRecord>) -> Self {
        let kind = match provider_failures.split_first() {
            Some((first, rest)) if rest.iter().all(|record| record.kind == first.kind) => {
                first.kind
            }
            _ => ErrorKind::Unknown,
        };
        let listing = provider_failures
            .iter()
            .map(|record| {
                let mut line = format!(
                    "{} {} after {} attempt(s): {}",
                    record.provider_id,
                    record.kind.as_str(),
                    record.attempts,
                    record.message
                );
                if !record.tools_used.is_empty() {
                    line.push_str(&format!(" (tools already run: {})", record.tools_used.join(", ")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("; ");
        let summary = if listing.is_empty() {
            "all providers failed".to_owned()
        } else {
            format!("all providers failed: {listing}")
        };

        Self { kind, summary, provider_failures }
    }

    pub fn no_providers() -> Self {
        Self {
            kind: ErrorKind::Unknown,
            summary: "no providers are available; configure at least one provider credential"
                .to_owned(),
            provider_failures: Vec::new(),
        }
    }

    pub fn user_cancelled(summary: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UserCancelled,
            summary: summary.into(),
            provider_failures: Vec::new(),
        }
    }

    pub fn orphaned() -> Self {
        Self {
            kind: ErrorKind::UserCancelled,
            summary: "run was cancelled after losing its owner".to_owned(),
            provider_failures: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub conversation_id: ConversationId,
    pub prompt: String,
    pub registry_name: String,
    /// Tools resolved when the run was created. Resumption uses these, not the live catalog.
    #[serde(default)]
    pub registry: Option<ToolRegistry>,
    pub provider_id: Option<ProviderId>,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub failure: Option<RunFailure>,
    pub tools_used: Vec<String>,
    pub pending_clarification: Option<Clarification>,
    pub state_version: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        conversation_id: ConversationId,
        prompt: impl Into<String>,
        registry_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::generate(),
            conversation_id,
            prompt: prompt.into(),
            registry_name: registry_name.into(),
            registry: None,
            provider_id: None,
            status: RunStatus::Pending,
            result: None,
            failure: None,
            tools_used: Vec::new(),
            pending_clarification: None,
            state_version: 0,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Applies `event` through the run state machine. The version is bumped by the ledger on
    /// persist, not here.
    pub fn apply(
        &mut self,
        event: RunEvent,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RunTransitionError> {
        let outcome = RunFlow.transition(&self.status, &event)?;
        self.status = outcome.to;
        self.updated_at = now;
        if outcome.to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(outcome)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<TransitionOutcome, RunTransitionError> {
        self.apply(RunEvent::Started, now)
    }

    pub fn complete(
        &mut self,
        provider_id: ProviderId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RunTransitionError> {
        let outcome = self.apply(RunEvent::Completed, now)?;
        self.provider_id = Some(provider_id);
        self.result = Some(result);
        self.failure = None;
        Ok(outcome)
    }

    pub fn fail(
        &mut self,
        failure: RunFailure,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RunTransitionError> {
        let event = if self.status == RunStatus::AwaitingClarification {
            RunEvent::ClarificationRejected
        } else {
            RunEvent::Failed
        };
        let outcome = self.apply(event, now)?;
        self.pending_clarification = None;
        self.failure = Some(failure);
        Ok(outcome)
    }

    /// Only a `running` run can be cancelled; awaiting runs are ended by rejecting the
    /// clarification instead.
    pub fn cancel(
        &mut self,
        failure: RunFailure,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RunTransitionError> {
        let outcome = self.apply(RunEvent::CancelRequested, now)?;
        self.failure = Some(failure);
        Ok(outcome)
    }

    pub fn suspend(
        &mut self,
        provider_id: ProviderId,
        clarification: Clarification,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RunTransitionError> {
        if self.pending_clarification.is_some() {
            return Err(RunTransitionError::ClarificationOutstanding { run_id: self.id.clone() });
        }
        let outcome = self.apply(RunEvent::ClarificationRaised, now)?;
        self.provider_id = Some(provider_id);
        self.pending_clarification = Some(clarification);
        Ok(outcome)
    }

    /// Consumes the outstanding clarification and moves back to `running`.
    pub fn resume(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(TransitionOutcome, Clarification), RunTransitionError> {
        let Some(clarification) = self.pending_clarification.clone() else {
            return Err(RunTransitionError::InvalidTransition {
                state: self.status,
                event: RunEvent::ClarificationResolved,
            });
        };
        let outcome = self.apply(RunEvent::ClarificationResolved, now)?;
        self.pending_clarification = None;
        Ok((outcome, clarification))
    }

    pub fn record_tools(&mut self, tools: impl IntoIterator<Item = String>) {
        self.tools_used.extend(tools);
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        let end = self.completed_at.unwrap_or(now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{ConversationId, ProviderFailureRecord, Run, RunFailure, RunStatus};
    use crate::domain::clarification::{
        Clarification, ClarificationPayload, ClarificationRequest,
    };
    use crate::domain::provider::ProviderId;
    use crate::errors::ErrorKind;
    use crate::flows::RunTransitionError;

    fn sample_run() -> Run {
        Run::new(ConversationId("conv-1".to_owned()), "send the report", "default", Utc::now())
    }

    fn oauth_clarification(run: &Run) -> Clarification {
        Clarification::raise(
            run.id.clone(),
            ClarificationRequest {
                prompt: "Authorize Gmail".to_owned(),
                payload: ClarificationPayload::OauthAuthorization {
                    auth_url: "https://auth.example.com".to_owned(),
                },
                continuation: "{}".to_owned(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn run_completes_through_clarification_round_trip() {
        let mut run = sample_run();
        run.start(Utc::now()).expect("pending -> running");
        let clarification = oauth_clarification(&run);
        run.suspend(ProviderId::new("gemini"), clarification.clone(), Utc::now())
            .expect("running -> awaiting");
        assert_eq!(run.status, RunStatus::AwaitingClarification);

        let (_, consumed) = run.resume(Utc::now()).expect("awaiting -> running");
        assert_eq!(consumed.id, clarification.id);
        assert!(run.pending_clarification.is_none());

        run.complete(ProviderId::new("gemini"), json!({"final_output": "sent"}), Utc::now())
            .expect("running -> completed");
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn second_outstanding_clarification_is_an_invariant_violation() {
        let mut run = sample_run();
        run.start(Utc::now()).expect("start");
        let first = oauth_clarification(&run);
        run.suspend(ProviderId::new("gemini"), first, Utc::now()).expect("first suspend");

        let second = oauth_clarification(&run);
        let error = run
            .suspend(ProviderId::new("gemini"), second, Utc::now())
            .expect_err("second clarification must be rejected");
        assert!(matches!(error, RunTransitionError::ClarificationOutstanding { .. }));
    }

    #[test]
    fn rejected_clarification_fails_the_run() {
        let mut run = sample_run();
        run.start(Utc::now()).expect("start");
        let clarification = oauth_clarification(&run);
        run.suspend(ProviderId::new("gemini"), clarification, Utc::now()).expect("suspend");

        run.fail(RunFailure::user_cancelled("denied"), Utc::now()).expect("awaiting -> failed");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.pending_clarification.is_none());
        assert_eq!(run.failure.as_ref().map(|f| f.kind), Some(ErrorKind::UserCancelled));
    }

    #[test]
    fn cancel_is_only_accepted_while_running() {
        let mut pending = sample_run();
        assert!(pending.cancel(RunFailure::user_cancelled("stop"), Utc::now()).is_err());

        let mut awaiting = sample_run();
        awaiting.start(Utc::now()).expect("start");
        let clarification = oauth_clarification(&awaiting);
        awaiting
            .suspend(ProviderId::new("gemini"), clarification, Utc::now())
            .expect("suspend");
        assert!(awaiting.cancel(RunFailure::user_cancelled("stop"), Utc::now()).is_err());

        let mut running = sample_run();
        running.start(Utc::now()).expect("start");
        running.cancel(RunFailure::user_cancelled("stop"), Utc::now()).expect("cancel");
        assert_eq!(running.status, RunStatus::Failed);
        assert_eq!(running.failure.as_ref().map(|f| f.kind), Some(ErrorKind::UserCancelled));
    }

    #[test]
    fn exhausted_failure_keeps_shared_kind_or_falls_back_to_unknown() {
        let record = |provider: &str, kind| ProviderFailureRecord {
            provider_id: ProviderId::new(provider),
            kind,
            message: "boom".to_owned(),
            attempts: 1,
            tools_used: Vec::new(),
        };

        let shared = RunFailure::exhausted(vec![
            record("p1", ErrorKind::AuthInvalid),
            record("p2", ErrorKind::AuthInvalid),
        ]);
        assert_eq!(shared.kind, ErrorKind::AuthInvalid);
        assert!(shared.summary.contains("p1 auth_invalid"));
        assert!(shared.summary.contains("p2 auth_invalid"));

        let mixed = RunFailure::exhausted(vec![
            record("p1", ErrorKind::RateLimited),
            record("p2", ErrorKind::Timeout),
        ]);
        assert_eq!(mixed.kind, ErrorKind::Unknown);

        let mut after_send = record("p1", ErrorKind::RateLimited);
        after_send.tools_used = vec!["gmail_send".to_owned()];
        let blocked = RunFailure::exhausted(vec![after_send]);
        assert!(blocked.summary.contains("(tools already run: gmail_send)"));
    }

    #[test]
    fn status_storage_encoding_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::AwaitingClarification,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }
}
