//! Deterministic fakes for provider and backoff behavior. Built for this crate's tests and,
//! behind the `testing` feature, for downstream test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use nexus_core::domain::provider::ProviderDescriptor;
use nexus_core::domain::registry::ToolRegistry;

use crate::chat::{ChatCompletionRequest, ChatCompletionResponse, ChatTransport};
use crate::llm::{ProviderAdapter, ProviderFailure, ProviderOutcome, Resumption};
use crate::retry::Sleeper;
use crate::tools::{ToolCallResult, ToolExecutor, ToolInvocation};

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub prompt: String,
    pub registry: String,
    pub tool_count: usize,
    pub resumption: Option<Resumption>,
    pub checkpoint: Option<String>,
}

/// Replays a fixed list of outcomes. Once the script is empty every call fails with `Unknown`.
pub struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    script: Mutex<VecDeque<ProviderOutcome>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new(descriptor: ProviderDescriptor, script: Vec<ProviderOutcome>) -> Self {
        Self {
            descriptor,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    fn next(&self, call: RecordedCall) -> ProviderOutcome {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }

        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| {
            ProviderOutcome::Failure(ProviderFailure::unknown("scripted provider exhausted"))
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        resumption: Option<&Resumption>,
    ) -> ProviderOutcome {
        self.next(RecordedCall {
            prompt: prompt.to_string(),
            registry: registry.name.clone(),
            tool_count: registry.tool_count(),
            resumption: resumption.cloned(),
            checkpoint: None,
        })
    }

    async fn continue_from(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        checkpoint: &str,
    ) -> ProviderOutcome {
        self.next(RecordedCall {
            prompt: prompt.to_string(),
            registry: registry.name.clone(),
            tool_count: registry.tool_count(),
            resumption: None,
            checkpoint: Some(checkpoint.to_string()),
        })
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
    }
}

/// Records requested delays and never wakes, so a test can act while a run sits in backoff.
#[derive(Debug, Default)]
pub struct PendingSleeper {
    delays: Mutex<Vec<Duration>>,
    entered: Notify,
}

impl PendingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn wait_for_sleeps(&self, count: usize) {
        loop {
            let entered = self.entered.notified();
            if self.delays().len() >= count {
                return;
            }
            entered.await;
        }
    }
}

#[async_trait]
impl Sleeper for PendingSleeper {
    async fn sleep(&self, duration: Duration) {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
        self.entered.notify_waiters();
        std::future::pending::<()>().await;
    }
}

/// Replays chat-completion responses and records every request it receives.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<ScriptedTransportInner>,
}

#[derive(Default)]
struct ScriptedTransportInner {
    script: Mutex<VecDeque<Result<ChatCompletionResponse, ProviderFailure>>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<ChatCompletionResponse, ProviderFailure>>) -> Self {
        Self {
            inner: Arc::new(ScriptedTransportInner {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        match self.inner.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderFailure> {
        match self.inner.requests.lock() {
            Ok(mut requests) => requests.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        let next = match self.inner.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| Err(ProviderFailure::unknown("scripted transport exhausted")))
    }
}

/// Answers tool calls from a per-tool table; unknown tools succeed with `{"ok": true}`.
#[derive(Default)]
pub struct ScriptedToolExecutor {
    responses: Mutex<HashMap<String, ToolCallResult>>,
    invocations: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedToolExecutor {
    pub fn respond(&self, tool_id: &str, result: ToolCallResult) {
        match self.responses.lock() {
            Ok(mut responses) => responses.insert(tool_id.to_string(), result),
            Err(poisoned) => poisoned.into_inner().insert(tool_id.to_string(), result),
        };
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        match self.invocations.lock() {
            Ok(invocations) => invocations.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ToolExecutor for ScriptedToolExecutor {
    async fn execute(&self, invocation: &ToolInvocation) -> ToolCallResult {
        match self.invocations.lock() {
            Ok(mut invocations) => invocations.push(invocation.clone()),
            Err(poisoned) => poisoned.into_inner().push(invocation.clone()),
        }
        let configured = match self.responses.lock() {
            Ok(responses) => responses.get(&invocation.tool_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&invocation.tool_id).cloned(),
        };
        configured.unwrap_or_else(|| ToolCallResult::Ok { output: json!({"ok": true}) })
    }
}
