use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{info, warn};

use nexus_core::config::RetryConfig;
use nexus_core::domain::clarification::ClarificationRequest;
use nexus_core::domain::provider::{ProviderDescriptor, ProviderId};
use nexus_core::domain::registry::ToolRegistry;
use nexus_core::domain::run::{ProviderFailureRecord, RunId};
use nexus_core::errors::ErrorKind;

use crate::llm::{ProviderAdapter, ProviderFailure, ProviderOutcome, Resumption};
use crate::retry::{with_retry, CancellationSignal, RetryPolicy, RetryResult, Sleeper};

#[derive(Clone, Debug, PartialEq)]
pub enum CascadeResult {
    Success {
        provider_id: ProviderId,
        payload: Value,
        tools_used: Vec<String>,
        failures: Vec<ProviderFailureRecord>,
    },
    NeedsClarification {
        provider_id: ProviderId,
        request: ClarificationRequest,
        tools_used: Vec<String>,
        failures: Vec<ProviderFailureRecord>,
    },
    Exhausted(Vec<ProviderFailureRecord>),
    NoProviders,
    Cancelled {
        failures: Vec<ProviderFailureRecord>,
        tools_used: Vec<String>,
    },
}

/// Walks providers strictly one after another, each under its retry budget, until one
/// produces a non-failure outcome. A provider that ran tools before failing ends the walk,
/// so no second provider repeats their side effects.
pub struct FallbackCascade {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    primary: RetryPolicy,
    fallback: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl FallbackCascade {
    pub fn new(
        providers: Vec<Arc<dyn ProviderAdapter>>,
        primary: RetryPolicy,
        fallback: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { providers, primary, fallback, sleeper }
    }

    pub fn from_retry_config(
        providers: Vec<Arc<dyn ProviderAdapter>>,
        retry: &RetryConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self::new(providers, RetryPolicy::primary(retry), RetryPolicy::fallback(retry), sleeper)
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers.iter().map(|provider| provider.descriptor().clone()).collect()
    }

    pub fn provider(&self, provider_id: &ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.iter().find(|provider| &provider.descriptor().id == provider_id).cloned()
    }

    /// Available providers by ascending priority (id breaks ties), with a usable preference
    /// moved to the front.
    pub fn order(&self, preference: Option<&str>) -> Vec<Arc<dyn ProviderAdapter>> {
        let mut ordered: Vec<Arc<dyn ProviderAdapter>> = self
            .providers
            .iter()
            .filter(|provider| provider.descriptor().available)
            .cloned()
            .collect();
        ordered.sort_by(|left, right| {
            let (left, right) = (left.descriptor(), right.descriptor());
            left.priority.cmp(&right.priority).then_with(|| left.id.cmp(&right.id))
        });

        let Some(preference) = preference.map(str::trim).filter(|value| !value.is_empty()) else {
            return ordered;
        };
        match ordered.iter().position(|provider| provider.descriptor().id.as_str() == preference) {
            Some(position) => {
                let preferred = ordered.remove(position);
                ordered.insert(0, preferred);
            }
            None => {
                let known = self
                    .providers
                    .iter()
                    .any(|provider| provider.descriptor().id.as_str() == preference);
                warn!(
                    event_name = "cascade.preference_ignored",
                    provider_preference = preference,
                    reason = if known { "unavailable" } else { "unknown" },
                    "provider preference ignored"
                );
            }
        }
        ordered
    }

    pub async fn run(
        &self,
        run_id: &RunId,
        prompt: &str,
        registry: &ToolRegistry,
        preference: Option<&str>,
        cancel: &CancellationSignal,
    ) -> CascadeResult {
        let ordered = self.order(preference);
        if ordered.is_empty() {
            warn!(event_name = "cascade.no_providers", run_id = %run_id, "no provider is available");
            return CascadeResult::NoProviders;
        }

        let mut failures = Vec::new();
        for (position, provider) in ordered.iter().enumerate() {
            let policy = if position == 0 { self.primary } else { self.fallback };
            let attempt = self.attempt(run_id, provider.as_ref(), policy, prompt, registry, None, cancel).await;
            match attempt {
                Attempt::Produced(result) => return result.with_failures(failures),
                Attempt::Failed(record) if !record.tools_used.is_empty() => {
                    warn!(
                        event_name = "cascade.fallback_blocked",
                        run_id = %run_id,
                        provider_id = %record.provider_id,
                        tools_used = %record.tools_used.join(","),
                        "provider failed after running tools; not falling back"
                    );
                    failures.push(record);
                    return CascadeResult::Exhausted(failures);
                }
                Attempt::Failed(record) => failures.push(record),
                Attempt::Cancelled(tools_used) => {
                    return CascadeResult::Cancelled { failures, tools_used }
                }
            }
        }

        CascadeResult::Exhausted(failures)
    }

    /// Re-invokes the provider that raised a clarification. There is no fallback: a resumed
    /// failure ends the run with that provider's failure listed.
    pub async fn resume(
        &self,
        run_id: &RunId,
        provider_id: &ProviderId,
        prompt: &str,
        registry: &ToolRegistry,
        resumption: &Resumption,
        cancel: &CancellationSignal,
    ) -> CascadeResult {
        let Some(provider) = self.provider(provider_id).filter(|p| p.descriptor().available) else {
            warn!(
                event_name = "cascade.resume_provider_missing",
                run_id = %run_id,
                provider_id = %provider_id,
                "provider that raised the clarification is no longer available"
            );
            return CascadeResult::Exhausted(vec![ProviderFailureRecord {
                provider_id: provider_id.clone(),
                kind: ErrorKind::Unknown,
                message: "provider is no longer available".to_string(),
                attempts: 0,
                tools_used: Vec::new(),
            }]);
        };

        let attempt = self
            .attempt(run_id, provider.as_ref(), self.primary, prompt, registry, Some(resumption), cancel)
            .await;
        match attempt {
            Attempt::Produced(result) => result,
            Attempt::Failed(record) => CascadeResult::Exhausted(vec![record]),
            Attempt::Cancelled(tools_used) => {
                CascadeResult::Cancelled { failures: Vec::new(), tools_used }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        run_id: &RunId,
        provider: &dyn ProviderAdapter,
        policy: RetryPolicy,
        prompt: &str,
        registry: &ToolRegistry,
        resumption: Option<&Resumption>,
        cancel: &CancellationSignal,
    ) -> Attempt {
        let provider_id = provider.descriptor().id.clone();
        info!(
            event_name = "cascade.provider_selected",
            run_id = %run_id,
            provider_id = %provider_id,
            max_attempts = policy.max_attempts,
            resumed = resumption.is_some(),
            "invoking provider"
        );

        let progress = Mutex::new(Progress::default());
        let progress = &progress;
        let result = with_retry(policy, self.sleeper.as_ref(), cancel, |attempt| async move {
            let checkpoint = lock(progress).checkpoint.clone();
            let outcome = match checkpoint {
                Some(checkpoint) => {
                    info!(
                        event_name = "cascade.continued_from_checkpoint",
                        run_id = %run_id,
                        provider_id = %provider.descriptor().id,
                        attempt,
                        "retrying from the last checkpoint"
                    );
                    provider.continue_from(prompt, registry, &checkpoint).await
                }
                None => provider.invoke(prompt, registry, resumption).await,
            };
            if let ProviderOutcome::Failure(failure) = &outcome {
                lock(progress).absorb(failure);
            }
            outcome
        })
        .await;
        let mut tools_used = lock(progress).take_tools();

        match result {
            RetryResult::Cancelled { attempts } => {
                info!(
                    event_name = "cascade.cancelled",
                    run_id = %run_id,
                    provider_id = %provider_id,
                    attempts,
                    "cascade stopped by cancellation"
                );
                Attempt::Cancelled(tools_used)
            }
            RetryResult::Finished { outcome, attempts } => match outcome {
                ProviderOutcome::Success { payload, tools_used: produced } => {
                    tools_used.extend(produced);
                    Attempt::Produced(CascadeResult::Success {
                        provider_id,
                        payload,
                        tools_used,
                        failures: Vec::new(),
                    })
                }
                ProviderOutcome::NeedsClarification { request, tools_used: produced } => {
                    tools_used.extend(produced);
                    Attempt::Produced(CascadeResult::NeedsClarification {
                        provider_id,
                        request,
                        tools_used,
                        failures: Vec::new(),
                    })
                }
                ProviderOutcome::Failure(failure) => {
                    warn!(
                        event_name = "cascade.provider_failed",
                        run_id = %run_id,
                        provider_id = %provider_id,
                        kind = failure.kind.as_str(),
                        attempts,
                        error = %failure.message,
                        "provider failed"
                    );
                    Attempt::Failed(ProviderFailureRecord {
                        provider_id,
                        kind: failure.kind,
                        message: failure.message,
                        attempts,
                        tools_used,
                    })
                }
            },
        }
    }
}

fn lock(progress: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    match progress.lock() {
        Ok(progress) => progress,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What earlier failed attempts against one provider left behind.
#[derive(Default)]
struct Progress {
    tools_used: Vec<String>,
    checkpoint: Option<String>,
}

impl Progress {
    fn absorb(&mut self, failure: &ProviderFailure) {
        self.tools_used.extend(failure.tools_used.iter().cloned());
        if let Some(checkpoint) = &failure.checkpoint {
            self.checkpoint = Some(checkpoint.clone());
        }
    }

    fn take_tools(&mut self) -> Vec<String> {
        std::mem::take(&mut self.tools_used)
    }
}

enum Attempt {
    Produced(CascadeResult),
    Failed(ProviderFailureRecord),
    Cancelled(Vec<String>),
}

impl CascadeResult {
    fn with_failures(self, earlier: Vec<ProviderFailureRecord>) -> Self {
        match self {
            Self::Success { provider_id, payload, tools_used, .. } => {
                Self::Success { provider_id, payload, tools_used, failures: earlier }
            }
            Self::NeedsClarification { provider_id, request, tools_used, .. } => {
                Self::NeedsClarification { provider_id, request, tools_used, failures: earlier }
            }
            other => other,
        }
    }

    /// Every tool that ran during the cascade, including those of failed attempts.
    pub fn tools_used(&self) -> Vec<String> {
        let mut tools: Vec<String> = self
            .failures()
            .iter()
            .flat_map(|record| record.tools_used.iter().cloned())
            .collect();
        match self {
            Self::Success { tools_used, .. }
            | Self::NeedsClarification { tools_used, .. }
            | Self::Cancelled { tools_used, .. } => tools.extend(tools_used.iter().cloned()),
            Self::Exhausted(_) | Self::NoProviders => {}
        }
        tools
    }

    /// Failed provider attempts that preceded the result, in cascade order.
    pub fn failures(&self) -> &[ProviderFailureRecord] {
        match self {
            Self::Success { failures, .. }
            | Self::NeedsClarification { failures, .. }
            | Self::Exhausted(failures)
            | Self::Cancelled { failures, .. } => failures,
            Self::NoProviders => &[],
        }
    }
}
