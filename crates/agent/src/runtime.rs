use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use nexus_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use nexus_core::domain::clarification::{Clarification, ClarificationResponse};
use nexus_core::domain::provider::ProviderDescriptor;
use nexus_core::domain::registry::{RegistryCatalog, DEFAULT_REGISTRY};
use nexus_core::domain::run::{ConversationId, Run, RunFailure, RunId, RunStatus};
use nexus_core::errors::{ApplicationError, DomainError, ErrorKind};
use nexus_db::{RepositoryError, RunRepository};

use crate::cascade::{CascadeResult, FallbackCascade};
use crate::clarification::{check_submission, resolve, Resolution};
use crate::retry::CancellationSignal;
use crate::tools::{RegistrySnapshot, ToolRegistrySelector};

const ACTOR: &str = "orchestrator";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRequest {
    pub prompt: String,
    pub registry_name: Option<String>,
    pub provider_preference: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub correlation_id: String,
}

/// Owns run lifecycles: creates runs, drives the cascade, persists every transition through
/// the ledger, and routes clarification responses and cancellations back to their runs.
pub struct Orchestrator {
    cascade: FallbackCascade,
    registries: Arc<ToolRegistrySelector>,
    ledger: Arc<dyn RunRepository>,
    audit: Arc<dyn AuditSink>,
    active: Arc<Mutex<HashMap<RunId, CancellationSignal>>>,
}

/// Keeps a run's cancellation signal registered while this process drives it.
struct ActiveRun {
    run_id: RunId,
    signal: CancellationSignal,
    active: Arc<Mutex<HashMap<RunId, CancellationSignal>>>,
}

impl ActiveRun {
    fn register(active: &Arc<Mutex<HashMap<RunId, CancellationSignal>>>, run_id: &RunId) -> Self {
        let signal = CancellationSignal::new();
        match active.lock() {
            Ok(mut runs) => runs.insert(run_id.clone(), signal.clone()),
            Err(poisoned) => poisoned.into_inner().insert(run_id.clone(), signal.clone()),
        };
        Self { run_id: run_id.clone(), signal, active: Arc::clone(active) }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        match self.active.lock() {
            Ok(mut runs) => runs.remove(&self.run_id),
            Err(poisoned) => poisoned.into_inner().remove(&self.run_id),
        };
    }
}

fn persistence_error(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::NotFound { run_id } => ApplicationError::RunNotFound { run_id },
        other => ApplicationError::Persistence(other.to_string()),
    }
}

fn context(run: &Run, correlation_id: &str) -> AuditContext {
    AuditContext::new(
        Some(run.id.clone()),
        Some(run.conversation_id.clone()),
        correlation_id,
        ACTOR,
    )
}

impl Orchestrator {
    pub fn new(
        cascade: FallbackCascade,
        registries: Arc<ToolRegistrySelector>,
        ledger: Arc<dyn RunRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { cascade, registries, ledger, audit, active: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        self.cascade.descriptors()
    }

    pub fn registries(&self) -> Arc<RegistrySnapshot> {
        self.registries.snapshot()
    }

    pub fn reload_registries(&self, catalog: RegistryCatalog) -> Arc<RegistrySnapshot> {
        self.registries.reload(catalog)
    }

    pub async fn ledger_ready(&self) -> bool {
        self.ledger.ping().await.is_ok()
    }

    pub async fn run_query(&self, request: QueryRequest) -> Result<Run, ApplicationError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(ApplicationError::InvalidRequest("prompt must not be empty".to_string()));
        }

        let registry_name = request
            .registry_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_REGISTRY);
        let registry = self.registries.resolve(registry_name).inspect_err(|_| {
            warn!(
                event_name = "run.registry_not_found",
                correlation_id = %request.correlation_id,
                registry = registry_name,
                "query rejected before any provider was invoked"
            );
        })?;

        let conversation_id = request.conversation_id.clone().unwrap_or_else(ConversationId::generate);
        let mut run = Run::new(conversation_id, prompt, registry_name, Utc::now())
            .with_registry(registry.as_ref().clone());
        let audit = context(&run, &request.correlation_id);
        let guard = ActiveRun::register(&self.active, &run.id);

        self.ledger.insert_run(&run).await.map_err(persistence_error)?;
        self.emit(
            AuditEvent::new(&audit, "run.created", AuditCategory::Ingress, AuditOutcome::Success)
                .with_metadata("registry_name", registry_name)
                .with_metadata("tool_count", registry.tool_count().to_string()),
        );

        run.start(Utc::now()).map_err(DomainError::from)?;
        self.persist(&mut run).await?;
        self.emit(AuditEvent::new(&audit, "run.started", AuditCategory::Lifecycle, AuditOutcome::Success));
        info!(
            event_name = "run.started",
            correlation_id = %request.correlation_id,
            run_id = %run.id,
            conversation_id = %run.conversation_id,
            registry = registry_name,
            "run started"
        );

        let result = self
            .cascade
            .run(
                &run.id,
                &run.prompt,
                &registry,
                request.provider_preference.as_deref(),
                &guard.signal,
            )
            .await;
        self.settle(run, result, &audit).await
    }

    pub async fn submit_clarification(
        &self,
        response: ClarificationResponse,
        correlation_id: &str,
    ) -> Result<Run, ApplicationError> {
        let owner = self
            .ledger
            .find_run_by_clarification(&response.clarification_id)
            .await
            .map_err(persistence_error)?;
        let (mut run, clarification) = check_submission(owner, &response)?;
        let audit = context(&run, correlation_id);

        match resolve(&clarification, &response) {
            Resolution::Reject(failure) => {
                run.fail(failure, Utc::now()).map_err(DomainError::from)?;
                self.persist_claim(&mut run, &clarification).await?;
                self.emit(
                    AuditEvent::new(
                        &audit,
                        "run.clarification_rejected",
                        AuditCategory::Clarification,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("clarification_id", clarification.id.as_str())
                    .with_metadata("outcome", response.outcome.as_str()),
                );
                self.emit_failed(&audit, &run);
                Ok(run)
            }
            Resolution::Resume(resumption) => {
                let registry = match run.registry.clone() {
                    Some(registry) => registry,
                    None => {
                        warn!(
                            event_name = "run.registry_not_pinned",
                            correlation_id = %correlation_id,
                            run_id = %run.id,
                            registry = %run.registry_name,
                            "run has no stored registry; resolving the current one"
                        );
                        self.registries.resolve(&run.registry_name)?.as_ref().clone()
                    }
                };
                let Some(provider_id) = run.provider_id.clone() else {
                    return Err(DomainError::InvariantViolation(format!(
                        "run `{}` is awaiting clarification without a provider",
                        run.id
                    ))
                    .into());
                };

                let guard = ActiveRun::register(&self.active, &run.id);
                run.resume(Utc::now()).map_err(DomainError::from)?;
                self.persist_claim(&mut run, &clarification).await?;
                self.emit(
                    AuditEvent::new(
                        &audit,
                        "run.clarification_resolved",
                        AuditCategory::Clarification,
                        AuditOutcome::Success,
                    )
                    .with_metadata("clarification_id", clarification.id.as_str())
                    .with_metadata("outcome", response.outcome.as_str()),
                );

                let result = self
                    .cascade
                    .resume(&run.id, &provider_id, &run.prompt, &registry, &resumption, &guard.signal)
                    .await;
                self.settle(run, result, &audit).await
            }
        }
    }

    /// Signals a run this process is driving, or fails an orphaned `running` run directly.
    /// The returned snapshot may still show `running` when the owner has not yet observed
    /// the signal.
    pub async fn cancel_run(
        &self,
        run_id: &RunId,
        correlation_id: &str,
    ) -> Result<Run, ApplicationError> {
        let mut run = self.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(ApplicationError::CancelRejected {
                run_id: run_id.to_string(),
                status: run.status.as_str().to_string(),
            });
        }
        let audit = context(&run, correlation_id);

        let live = match self.active.lock() {
            Ok(runs) => runs.get(run_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(run_id).cloned(),
        };
        if let Some(signal) = live {
            signal.cancel();
            self.emit(AuditEvent::new(
                &audit,
                "run.cancel_requested",
                AuditCategory::Lifecycle,
                AuditOutcome::Success,
            ));
            return Ok(run);
        }

        run.cancel(RunFailure::orphaned(), Utc::now()).map_err(DomainError::from)?;
        let expected = run.state_version;
        run.state_version = self.ledger.update_run(&run, expected).await.map_err(|error| {
            match error {
                RepositoryError::VersionConflict { .. } => ApplicationError::CancelRejected {
                    run_id: run_id.to_string(),
                    status: "changing".to_string(),
                },
                other => persistence_error(other),
            }
        })?;
        self.emit(
            AuditEvent::new(&audit, "run.cancel_requested", AuditCategory::Lifecycle, AuditOutcome::Success)
                .with_metadata("orphaned", "true"),
        );
        self.emit_failed(&audit, &run);
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Run, ApplicationError> {
        self.ledger
            .find_run(run_id)
            .await
            .map_err(persistence_error)?
            .ok_or_else(|| ApplicationError::RunNotFound { run_id: run_id.to_string() })
    }

    pub async fn latest_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Run, ApplicationError> {
        self.ledger
            .latest_run_for_conversation(conversation_id)
            .await
            .map_err(persistence_error)?
            .ok_or_else(|| ApplicationError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })
    }

    async fn settle(
        &self,
        mut run: Run,
        result: CascadeResult,
        audit: &AuditContext,
    ) -> Result<Run, ApplicationError> {
        for record in result.failures() {
            self.emit(
                AuditEvent::new(
                    audit,
                    "run.provider_attempt_failed",
                    AuditCategory::Provider,
                    AuditOutcome::Failed,
                )
                .with_metadata("provider_id", record.provider_id.as_str())
                .with_metadata("kind", record.kind.as_str())
                .with_metadata("attempts", record.attempts.to_string())
                .with_metadata("tools_used", record.tools_used.join(",")),
            );
        }

        // Tools of failed attempts count too; their side effects already happened.
        run.record_tools(result.tools_used());
        let now = Utc::now();
        match result {
            CascadeResult::Success { provider_id, payload, .. } => {
                run.complete(provider_id, payload, now).map_err(DomainError::from)?;
                self.persist(&mut run).await?;
                self.emit(
                    AuditEvent::new(audit, "run.completed", AuditCategory::Lifecycle, AuditOutcome::Success)
                        .with_metadata(
                            "provider_id",
                            run.provider_id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
                        )
                        .with_metadata("tools_used", run.tools_used.join(",")),
                );
                info!(
                    event_name = "run.completed",
                    correlation_id = %audit.correlation_id,
                    run_id = %run.id,
                    elapsed_seconds = run.elapsed_seconds(now),
                    "run completed"
                );
            }
            CascadeResult::NeedsClarification { provider_id, request, .. } => {
                let clarification = Clarification::raise(run.id.clone(), request, now);
                run.suspend(provider_id, clarification.clone(), now).map_err(DomainError::from)?;
                self.persist(&mut run).await?;
                self.emit(
                    AuditEvent::new(
                        audit,
                        "run.clarification_raised",
                        AuditCategory::Clarification,
                        AuditOutcome::Success,
                    )
                    .with_metadata("clarification_id", clarification.id.as_str())
                    .with_metadata("kind", clarification.kind().as_str()),
                );
            }
            CascadeResult::Exhausted(records) => {
                run.fail(RunFailure::exhausted(records), now).map_err(DomainError::from)?;
                self.persist(&mut run).await?;
                self.emit_failed(audit, &run);
            }
            CascadeResult::NoProviders => {
                run.fail(RunFailure::no_providers(), now).map_err(DomainError::from)?;
                self.persist(&mut run).await?;
                self.emit_failed(audit, &run);
            }
            CascadeResult::Cancelled { failures, .. } => {
                let failure = RunFailure {
                    kind: ErrorKind::UserCancelled,
                    summary: "run was cancelled by request".to_string(),
                    provider_failures: failures,
                };
                run.cancel(failure, now).map_err(DomainError::from)?;
                self.persist(&mut run).await?;
                self.emit_failed(audit, &run);
            }
        }

        Ok(run)
    }

    async fn persist(&self, run: &mut Run) -> Result<(), ApplicationError> {
        let expected = run.state_version;
        run.state_version =
            self.ledger.update_run(run, expected).await.map_err(persistence_error)?;
        Ok(())
    }

    /// Persists the transition that consumes `clarification`. Losing the CAS race means a
    /// concurrent submission already consumed it.
    async fn persist_claim(
        &self,
        run: &mut Run,
        clarification: &Clarification,
    ) -> Result<(), ApplicationError> {
        let expected = run.state_version;
        run.state_version = self.ledger.update_run(run, expected).await.map_err(|error| match error {
            RepositoryError::VersionConflict { .. } => ApplicationError::StaleClarification {
                clarification_id: clarification.id.to_string(),
            },
            other => persistence_error(other),
        })?;
        Ok(())
    }

    fn emit_failed(&self, audit: &AuditContext, run: &Run) {
        let (kind, summary) = run
            .failure
            .as_ref()
            .map(|failure| (failure.kind.as_str(), failure.summary.clone()))
            .unwrap_or((ErrorKind::Unknown.as_str(), String::new()));
        self.emit(
            AuditEvent::new(audit, "run.failed", AuditCategory::Lifecycle, AuditOutcome::Failed)
                .with_metadata("kind", kind)
                .with_metadata("summary", summary),
        );
    }

    fn emit(&self, event: AuditEvent) {
        self.audit.emit(event);
    }
}
