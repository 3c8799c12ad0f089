//! Query orchestration: provider adapters, tool registries, retry and fallback, and the
//! clarification round-trip that suspends a run until a human answers.
//!
//! # Flow
//!
//! 1. [`runtime::Orchestrator::run_query`] resolves the tool registry, records the run and
//!    hands it to the [`cascade::FallbackCascade`].
//! 2. The cascade invokes providers in priority order, each wrapped in
//!    [`retry::with_retry`].
//! 3. A provider that needs human input returns a clarification request; the run is parked
//!    in the ledger as `awaiting_clarification`.
//! 4. [`runtime::Orchestrator::submit_clarification`] validates the response and resumes the
//!    same provider from its continuation token.

pub mod cascade;
pub mod chat;
pub mod clarification;
pub mod llm;
pub mod retry;
pub mod runtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tools;

pub use cascade::{CascadeResult, FallbackCascade};
pub use chat::{ChatCompletionsAdapter, ChatTransport, ReqwestTransport};
pub use llm::{ProviderAdapter, ProviderFailure, ProviderOutcome, Resumption};
pub use retry::{CancellationSignal, RetryPolicy, Sleeper, TokioSleeper};
pub use runtime::{Orchestrator, QueryRequest};
pub use tools::{HttpToolExecutor, ToolExecutor, ToolRegistrySelector};
