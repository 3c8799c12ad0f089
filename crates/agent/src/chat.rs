//! Provider adapter for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Gemini and Mistral both accept this wire format. The adapter owns the tool-calling loop:
//! each tool call the model requests is executed through a [`ToolExecutor`], and a tool that
//! needs a human decision suspends the loop with a continuation token. The token carries the
//! conversation so far plus the pending and not-yet-executed calls, so a resumed invocation
//! re-executes only the pending call. A request that fails after tools ran returns a
//! checkpoint of the conversation with their results, and retries continue from it.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use nexus_core::config::ProviderConfig;
use nexus_core::domain::clarification::{ClarificationOutcome, ClarificationRequest};
use nexus_core::domain::provider::ProviderDescriptor;
use nexus_core::domain::registry::ToolRegistry;
use nexus_core::errors::{ApplicationError, ErrorKind};

use crate::llm::{ProviderAdapter, ProviderFailure, ProviderOutcome, Resumption};
use crate::tools::{ToolCallResult, ToolExecutor, ToolInvocation};

const TOOL_SYSTEM_PROMPT: &str =
    "Answer the user's request. Call the provided tools when they are needed to complete it.";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as produced by the model.
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// Single-choice response carrying a final assistant answer.
    pub fn text(content: impl Into<String>) -> Self {
        Self::from_message(Message {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        })
    }

    /// Single-choice response asking for the given `(call id, function name, arguments)` calls.
    pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Self {
        let calls = calls
            .iter()
            .map(|(id, name, arguments)| ToolCall {
                id: (*id).to_string(),
                call_type: Some("function".to_string()),
                function: FunctionCall { name: (*name).to_string(), arguments: arguments.to_string() },
            })
            .collect();
        Self::from_message(Message {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        })
    }

    fn from_message(message: Message) -> Self {
        Self {
            id: None,
            model: None,
            choices: vec![Choice { index: 0, message, finish_reason: None }],
            usage: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: usize,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderFailure>;
}

pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        401 | 403 => ErrorKind::AuthInvalid,
        408 | 504 => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl ReqwestTransport {
    pub fn new(
        base_url: &str,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, ApplicationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self { client, endpoint, api_key })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ProviderFailure::timeout(format!("request timed out: {error}"))
                } else {
                    ProviderFailure::unknown(format!("request failed: {error}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            return Err(ProviderFailure::new(
                classify_status(status.as_u16()),
                format!("HTTP {status}: {snippet}"),
            ));
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|error| ProviderFailure::unknown(format!("unreadable response body: {error}")))
    }
}

/// Suspension point encoded into a clarification's continuation token.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Continuation {
    messages: Vec<Message>,
    pending_call: ToolCall,
    remaining_calls: Vec<ToolCall>,
    rounds: u32,
}

/// Conversation after at least one tool round, including the tool results.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    messages: Vec<Message>,
    rounds: u32,
}

/// Tool-loop state of one invocation.
struct Session {
    messages: Vec<Message>,
    rounds: u32,
    tools_used: Vec<String>,
}

impl Session {
    /// A failure after tools ran reports them together with a checkpoint to continue from.
    fn fail(self, failure: ProviderFailure) -> ProviderOutcome {
        if self.tools_used.is_empty() {
            return ProviderOutcome::Failure(failure);
        }
        let checkpoint = Checkpoint { messages: self.messages, rounds: self.rounds };
        let checkpoint = serde_json::to_string(&checkpoint)
            .inspect_err(|error| {
                warn!(
                    event_name = "provider.checkpoint_unencodable",
                    error = %error,
                    "failed request cannot be continued"
                );
            })
            .ok();
        ProviderOutcome::Failure(failure.with_progress(self.tools_used, checkpoint))
    }
}

enum ToolPhase {
    Continue,
    Suspend(ClarificationRequest),
}

/// Maps wire-safe function names back to registry tool ids.
struct ToolIndex {
    by_function: HashMap<String, String>,
    definitions: Vec<Tool>,
}

impl ToolIndex {
    fn new(registry: &ToolRegistry) -> Self {
        let mut by_function = HashMap::new();
        let mut definitions = Vec::new();
        for tool in &registry.tools {
            let name = function_name(&tool.id);
            if by_function.contains_key(&name) {
                continue;
            }
            by_function.insert(name.clone(), tool.id.clone());
            let description = if tool.description.is_empty() {
                tool.display_name.clone()
            } else {
                tool.description.clone()
            };
            definitions.push(Tool {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name,
                    description,
                    parameters: json!({"type": "object", "additionalProperties": true}),
                },
            });
        }
        Self { by_function, definitions }
    }

    fn tool_id(&self, function: &str) -> Option<&str> {
        self.by_function.get(function).map(String::as_str)
    }
}

/// Function names may only contain `[A-Za-z0-9_-]`; cloud tool ids use `:` separators.
pub fn function_name(tool_id: &str) -> String {
    tool_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' { ch } else { '_' })
        .collect()
}

pub struct ChatCompletionsAdapter<T> {
    descriptor: ProviderDescriptor,
    model: String,
    transport: T,
    executor: Arc<dyn ToolExecutor>,
    max_tool_rounds: u32,
}

impl<T> ChatCompletionsAdapter<T>
where
    T: ChatTransport,
{
    pub fn new(
        descriptor: ProviderDescriptor,
        model: impl Into<String>,
        transport: T,
        executor: Arc<dyn ToolExecutor>,
        max_tool_rounds: u32,
    ) -> Self {
        Self { descriptor, model: model.into(), transport, executor, max_tool_rounds }
    }

    async fn execute_calls(
        &self,
        calls: &[ToolCall],
        mut first_resolution: Option<ClarificationOutcome>,
        index: &ToolIndex,
        messages: &mut Vec<Message>,
        rounds: u32,
        tools_used: &mut Vec<String>,
    ) -> Result<ToolPhase, ProviderFailure> {
        for (position, call) in calls.iter().enumerate() {
            let resolution = first_resolution.take();
            let Some(tool_id) = index.tool_id(&call.function.name) else {
                warn!(
                    event_name = "provider.unknown_tool_requested",
                    provider_id = %self.descriptor.id,
                    function = %call.function.name,
                    "model requested a tool outside the resolved registry"
                );
                messages.push(Message::tool(
                    &call.id,
                    json!({"error": format!("unknown tool `{}`", call.function.name)}).to_string(),
                ));
                continue;
            };

            let arguments = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({"raw": call.function.arguments}));
            let invocation = ToolInvocation { tool_id: tool_id.to_string(), arguments, resolution };

            match self.executor.execute(&invocation).await {
                ToolCallResult::Ok { output } => {
                    tools_used.push(invocation.tool_id);
                    messages.push(Message::tool(&call.id, output.to_string()));
                }
                ToolCallResult::Error { message } => {
                    tools_used.push(invocation.tool_id);
                    messages.push(Message::tool(&call.id, json!({"error": message}).to_string()));
                }
                ToolCallResult::ClarificationRequired { prompt, payload } => {
                    if !self.descriptor.supports_clarification {
                        messages.push(Message::tool(
                            &call.id,
                            json!({"error": format!("tool `{tool_id}` needs human input, which this provider cannot request")})
                                .to_string(),
                        ));
                        continue;
                    }

                    let continuation = Continuation {
                        messages: messages.clone(),
                        pending_call: call.clone(),
                        remaining_calls: calls[position + 1..].to_vec(),
                        rounds,
                    };
                    let continuation = serde_json::to_string(&continuation).map_err(|error| {
                        ProviderFailure::unknown(format!("could not encode continuation: {error}"))
                    })?;
                    return Ok(ToolPhase::Suspend(ClarificationRequest {
                        prompt,
                        payload,
                        continuation,
                    }));
                }
            }
        }
        Ok(ToolPhase::Continue)
    }

    async fn drive(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        resumption: Option<&Resumption>,
    ) -> ProviderOutcome {
        let index = ToolIndex::new(registry);
        let send_tools = self.descriptor.supports_tools && !index.definitions.is_empty();

        let session = match resumption {
            None => {
                let mut messages = Vec::new();
                if send_tools {
                    messages.push(Message::system(TOOL_SYSTEM_PROMPT));
                }
                messages.push(Message::user(prompt));
                Session { messages, rounds: 0, tools_used: Vec::new() }
            }
            Some(resumption) => {
                let continuation: Continuation = match serde_json::from_str(&resumption.continuation)
                {
                    Ok(continuation) => continuation,
                    Err(error) => {
                        return ProviderOutcome::Failure(ProviderFailure::unknown(format!(
                            "continuation token is unreadable: {error}"
                        )))
                    }
                };
                let Continuation { messages, pending_call, remaining_calls, rounds } = continuation;
                let mut session = Session { messages, rounds, tools_used: Vec::new() };
                let mut calls = Vec::with_capacity(remaining_calls.len() + 1);
                calls.push(pending_call);
                calls.extend(remaining_calls);

                let phase = self
                    .execute_calls(
                        &calls,
                        Some(resumption.outcome.clone()),
                        &index,
                        &mut session.messages,
                        session.rounds,
                        &mut session.tools_used,
                    )
                    .await;
                match phase {
                    Ok(ToolPhase::Continue) => session,
                    Ok(ToolPhase::Suspend(request)) => {
                        return ProviderOutcome::NeedsClarification {
                            request,
                            tools_used: session.tools_used,
                        }
                    }
                    Err(failure) => return session.fail(failure),
                }
            }
        };

        self.finish(&index, send_tools, session).await
    }

    async fn resume_checkpoint(&self, registry: &ToolRegistry, checkpoint: &str) -> ProviderOutcome {
        let index = ToolIndex::new(registry);
        let send_tools = self.descriptor.supports_tools && !index.definitions.is_empty();
        let checkpoint: Checkpoint = match serde_json::from_str(checkpoint) {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                return ProviderOutcome::Failure(ProviderFailure::unknown(format!(
                    "checkpoint is unreadable: {error}"
                )))
            }
        };
        debug!(
            event_name = "provider.checkpoint_resumed",
            provider_id = %self.descriptor.id,
            round = checkpoint.rounds,
            "continuing after a failed request without repeating tool calls"
        );

        let session =
            Session { messages: checkpoint.messages, rounds: checkpoint.rounds, tools_used: Vec::new() };
        self.finish(&index, send_tools, session).await
    }

    async fn finish(&self, index: &ToolIndex, send_tools: bool, mut session: Session) -> ProviderOutcome {
        match self.converse(index, send_tools, &mut session).await {
            Ok(outcome) => outcome,
            Err(failure) => session.fail(failure),
        }
    }

    async fn converse(
        &self,
        index: &ToolIndex,
        send_tools: bool,
        session: &mut Session,
    ) -> Result<ProviderOutcome, ProviderFailure> {
        loop {
            let request = ChatCompletionRequest {
                model: self.model.clone(),
                messages: session.messages.clone(),
                tools: send_tools.then(|| index.definitions.clone()),
            };
            let response = self.transport.send(&request).await?;
            let model = response.model.clone().unwrap_or_else(|| self.model.clone());
            let usage = response.usage.clone();
            let Some(choice) = response.choices.into_iter().next() else {
                return Err(ProviderFailure::unknown("provider returned no choices"));
            };

            let calls = choice.message.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() || !send_tools {
                let final_output = choice.message.content.unwrap_or_default();
                let mut payload = json!({"final_output": final_output, "model": model});
                if let Some(usage) = usage.and_then(|usage| serde_json::to_value(usage).ok()) {
                    payload["usage"] = usage;
                }
                return Ok(ProviderOutcome::Success {
                    payload,
                    tools_used: mem::take(&mut session.tools_used),
                });
            }

            session.rounds += 1;
            if session.rounds > self.max_tool_rounds {
                return Err(ProviderFailure::unknown(format!(
                    "tool loop exceeded {} round(s)",
                    self.max_tool_rounds
                )));
            }
            debug!(
                event_name = "provider.tool_round",
                provider_id = %self.descriptor.id,
                round = session.rounds,
                calls = calls.len(),
                "executing requested tool calls"
            );

            session.messages.push(choice.message);
            let phase = self
                .execute_calls(
                    &calls,
                    None,
                    index,
                    &mut session.messages,
                    session.rounds,
                    &mut session.tools_used,
                )
                .await?;
            if let ToolPhase::Suspend(request) = phase {
                return Ok(ProviderOutcome::NeedsClarification {
                    request,
                    tools_used: mem::take(&mut session.tools_used),
                });
            }
        }
    }
}

impl ChatCompletionsAdapter<ReqwestTransport> {
    /// A provider without a credential is built as unavailable and never invoked.
    pub fn from_config(
        config: &ProviderConfig,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<Self, ApplicationError> {
        let api_key = config.api_key.clone().unwrap_or_else(|| SecretString::from(String::new()));
        let transport = ReqwestTransport::new(
            &config.base_url,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self::new(
            config.descriptor(),
            config.model.clone(),
            transport,
            executor,
            config.max_tool_rounds,
        ))
    }
}

#[async_trait]
impl<T> ProviderAdapter for ChatCompletionsAdapter<T>
where
    T: ChatTransport,
{
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        resumption: Option<&Resumption>,
    ) -> ProviderOutcome {
        self.drive(prompt, registry, resumption).await
    }

    async fn continue_from(
        &self,
        _prompt: &str,
        registry: &ToolRegistry,
        checkpoint: &str,
    ) -> ProviderOutcome {
        self.resume_checkpoint(registry, checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use nexus_core::domain::clarification::{
        ClarificationId, ClarificationOutcome, ClarificationPayload,
    };
    use nexus_core::domain::provider::ProviderDescriptor;
    use nexus_core::domain::registry::{ToolDescriptor, ToolRegistry};
    use nexus_core::errors::ErrorKind;

    use super::{
        classify_status, function_name, ChatCompletionResponse, ChatCompletionsAdapter, Role,
    };
    use crate::llm::{ProviderAdapter, ProviderFailure, ProviderOutcome, Resumption};
    use crate::testing::{ScriptedToolExecutor, ScriptedTransport};
    use crate::tools::ToolCallResult;

    const GMAIL: &str = "portia:google:gmail:send_email";

    fn registry() -> ToolRegistry {
        ToolRegistry::new(
            "default",
            vec![
                ToolDescriptor::new("search_tool", "Search", "Search the web"),
                ToolDescriptor::new("calculator_tool", "Calculator", ""),
                ToolDescriptor::new(GMAIL, "Gmail send", "Send an email"),
            ],
        )
    }

    fn adapter(
        descriptor: ProviderDescriptor,
        transport: ScriptedTransport,
        executor: Arc<ScriptedToolExecutor>,
    ) -> ChatCompletionsAdapter<ScriptedTransport> {
        ChatCompletionsAdapter::new(descriptor, "test-model", transport, executor, 3)
    }

    #[tokio::test]
    async fn direct_provider_sends_no_tools_and_returns_final_output() {
        let transport = ScriptedTransport::new(vec![Ok(ChatCompletionResponse::text("42"))]);
        let executor = Arc::new(ScriptedToolExecutor::default());
        let adapter = adapter(
            ProviderDescriptor::new("mistral-direct", 2).with_tools(false),
            transport.clone(),
            executor,
        );

        let outcome = adapter.invoke("what is 6*7?", &registry(), None).await;

        assert_eq!(
            outcome,
            ProviderOutcome::Success {
                payload: json!({"final_output": "42", "model": "test-model"}),
                tools_used: Vec::new(),
            }
        );
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tools.is_none());
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn tool_calls_run_in_order_and_feed_results_back() {
        let transport = ScriptedTransport::new(vec![
            Ok(ChatCompletionResponse::tool_calls(&[
                ("call-1", "search_tool", json!({"query": "rust"})),
                ("call-2", "calculator_tool", json!({"expression": "1+1"})),
            ])),
            Ok(ChatCompletionResponse::text("done")),
        ]);
        let executor = Arc::new(ScriptedToolExecutor::default());
        executor.respond("calculator_tool", ToolCallResult::Ok { output: json!(2) });
        let adapter = adapter(ProviderDescriptor::new("gemini", 0), transport.clone(), executor.clone());

        let outcome = adapter.invoke("search and add", &registry(), None).await;

        let ProviderOutcome::Success { tools_used, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(tools_used, vec!["search_tool", "calculator_tool"]);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let tool_names: Vec<String> = requests[0]
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(|tool| tool.function.name.clone()).collect())
            .unwrap_or_default();
        assert!(tool_names.contains(&function_name(GMAIL)));
        let followup = &requests[1].messages;
        assert_eq!(followup.last().and_then(|m| m.tool_call_id.as_deref()), Some("call-2"));
        assert_eq!(followup.last().and_then(|m| m.content.as_deref()), Some("2"));
    }

    #[tokio::test]
    async fn clarification_suspends_and_resume_skips_completed_calls() {
        let gmail_fn = function_name(GMAIL);
        let transport = ScriptedTransport::new(vec![
            Ok(ChatCompletionResponse::tool_calls(&[
                ("call-1", "search_tool", json!({})),
                ("call-2", gmail_fn.as_str(), json!({"to": "a@example.com"})),
                ("call-3", "calculator_tool", json!({})),
            ])),
            Ok(ChatCompletionResponse::text("email sent")),
        ]);
        let executor = Arc::new(ScriptedToolExecutor::default());
        executor.respond(
            GMAIL,
            ToolCallResult::ClarificationRequired {
                prompt: "Authorize Gmail".to_string(),
                payload: ClarificationPayload::OauthAuthorization {
                    auth_url: "https://auth.example.com".to_string(),
                },
            },
        );
        let adapter = adapter(ProviderDescriptor::new("gemini", 0), transport.clone(), executor.clone());

        let first = adapter.invoke("email the summary", &registry(), None).await;
        let ProviderOutcome::NeedsClarification { request, tools_used } = first else {
            panic!("expected clarification, got {first:?}");
        };
        assert_eq!(tools_used, vec!["search_tool"]);
        assert_eq!(request.prompt, "Authorize Gmail");

        executor.respond(GMAIL, ToolCallResult::Ok { output: json!({"sent": true}) });
        let resumption = Resumption {
            clarification_id: ClarificationId("clr_1".to_string()),
            outcome: ClarificationOutcome::Authorized,
            continuation: request.continuation,
        };
        let second = adapter.invoke("email the summary", &registry(), Some(&resumption)).await;

        let ProviderOutcome::Success { tools_used, payload } = second else {
            panic!("expected success, got {second:?}");
        };
        assert_eq!(tools_used, vec![GMAIL.to_string(), "calculator_tool".to_string()]);
        assert_eq!(payload["final_output"], "email sent");

        let invocations = executor.invocations();
        let ids: Vec<&str> = invocations.iter().map(|i| i.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["search_tool", GMAIL, GMAIL, "calculator_tool"]);
        assert_eq!(invocations[2].resolution, Some(ClarificationOutcome::Authorized));
        assert_eq!(invocations[3].resolution, None);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn failure_after_resumed_tool_continues_from_checkpoint() {
        let gmail_fn = function_name(GMAIL);
        let transport = ScriptedTransport::new(vec![
            Ok(ChatCompletionResponse::tool_calls(&[(
                "call-1",
                gmail_fn.as_str(),
                json!({"to": "a@example.com"}),
            )])),
            Err(ProviderFailure::rate_limited("HTTP 429")),
            Ok(ChatCompletionResponse::text("email sent")),
        ]);
        let executor = Arc::new(ScriptedToolExecutor::default());
        executor.respond(
            GMAIL,
            ToolCallResult::ClarificationRequired {
                prompt: "Authorize Gmail".to_string(),
                payload: ClarificationPayload::OauthAuthorization {
                    auth_url: "https://auth.example.com".to_string(),
                },
            },
        );
        let adapter = adapter(ProviderDescriptor::new("gemini", 0), transport.clone(), executor.clone());

        let first = adapter.invoke("email the summary", &registry(), None).await;
        let ProviderOutcome::NeedsClarification { request, .. } = first else {
            panic!("expected clarification, got {first:?}");
        };

        executor.respond(GMAIL, ToolCallResult::Ok { output: json!({"sent": true}) });
        let resumption = Resumption {
            clarification_id: ClarificationId("clr_1".to_string()),
            outcome: ClarificationOutcome::Authorized,
            continuation: request.continuation,
        };
        let failed = adapter.invoke("email the summary", &registry(), Some(&resumption)).await;
        let failure = failed.failure().cloned().expect("rate limited after sending");
        assert_eq!(failure.kind, ErrorKind::RateLimited);
        assert_eq!(failure.tools_used, vec![GMAIL.to_string()]);
        let checkpoint = failure.checkpoint.expect("checkpoint after a tool ran");

        let continued = adapter.continue_from("email the summary", &registry(), &checkpoint).await;
        let ProviderOutcome::Success { tools_used, payload } = continued else {
            panic!("expected success, got {continued:?}");
        };
        assert!(tools_used.is_empty());
        assert_eq!(payload["final_output"], "email sent");

        let sends = executor.invocations().iter().filter(|i| i.tool_id == GMAIL).count();
        assert_eq!(sends, 2, "one suspended attempt and one authorized send");
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].messages, requests[1].messages);
        assert_eq!(requests[2].messages.last().and_then(|m| m.tool_call_id.as_deref()), Some("call-1"));
    }

    #[tokio::test]
    async fn failure_before_any_tool_carries_no_checkpoint() {
        let transport = ScriptedTransport::new(vec![Err(ProviderFailure::timeout("slow"))]);
        let adapter = adapter(
            ProviderDescriptor::new("gemini", 0),
            transport,
            Arc::new(ScriptedToolExecutor::default()),
        );

        let outcome = adapter.invoke("hello", &registry(), None).await;

        let failure = outcome.failure().cloned().expect("timeout");
        assert!(failure.tools_used.is_empty());
        assert!(failure.checkpoint.is_none());
    }

    #[tokio::test]
    async fn provider_without_clarification_support_gets_a_tool_error_instead() {
        let transport = ScriptedTransport::new(vec![
            Ok(ChatCompletionResponse::tool_calls(&[("call-1", function_name(GMAIL).as_str(), json!({}))])),
            Ok(ChatCompletionResponse::text("could not send")),
        ]);
        let executor = Arc::new(ScriptedToolExecutor::default());
        executor.respond(
            GMAIL,
            ToolCallResult::ClarificationRequired {
                prompt: "Authorize Gmail".to_string(),
                payload: ClarificationPayload::Confirmation { action: None },
            },
        );
        let adapter = adapter(
            ProviderDescriptor::new("mistral", 1).with_clarification(false),
            transport.clone(),
            executor,
        );

        let outcome = adapter.invoke("email", &registry(), None).await;

        assert!(matches!(outcome, ProviderOutcome::Success { ref tools_used, .. } if tools_used.is_empty()));
        let last = transport.requests()[1].messages.last().cloned().expect("tool message");
        assert!(last.content.unwrap_or_default().contains("needs human input"));
    }

    #[tokio::test]
    async fn unknown_tool_names_are_answered_with_an_error_message() {
        let transport = ScriptedTransport::new(vec![
            Ok(ChatCompletionResponse::tool_calls(&[("call-1", "rm_rf_tool", json!({}))])),
            Ok(ChatCompletionResponse::text("ok")),
        ]);
        let executor = Arc::new(ScriptedToolExecutor::default());
        let adapter = adapter(ProviderDescriptor::new("gemini", 0), transport.clone(), executor.clone());

        let outcome = adapter.invoke("cleanup", &registry(), None).await;

        assert!(matches!(outcome, ProviderOutcome::Success { .. }));
        assert!(executor.invocations().is_empty());
        let last = transport.requests()[1].messages.last().cloned().expect("tool message");
        assert!(last.content.unwrap_or_default().contains("unknown tool"));
    }

    #[tokio::test]
    async fn tool_loop_is_bounded() {
        let looping = || -> Result<ChatCompletionResponse, ProviderFailure> {
            Ok(ChatCompletionResponse::tool_calls(&[("call", "search_tool", json!({}))]))
        };
        let transport = ScriptedTransport::new(vec![looping(), looping(), looping(), looping()]);
        let adapter = adapter(
            ProviderDescriptor::new("gemini", 0),
            transport,
            Arc::new(ScriptedToolExecutor::default()),
        );

        let outcome = adapter.invoke("loop", &registry(), None).await;

        let failure = outcome.failure().cloned().expect("bounded loop fails");
        assert_eq!(failure.kind, ErrorKind::Unknown);
        assert!(failure.message.contains("exceeded 3 round"));
    }

    #[tokio::test]
    async fn transport_failures_surface_with_their_kind() {
        let transport =
            ScriptedTransport::new(vec![Err(ProviderFailure::rate_limited("HTTP 429"))]);
        let adapter = adapter(
            ProviderDescriptor::new("gemini", 0),
            transport,
            Arc::new(ScriptedToolExecutor::default()),
        );

        let outcome = adapter.invoke("hello", &registry(), None).await;

        assert_eq!(outcome, ProviderOutcome::Failure(ProviderFailure::rate_limited("HTTP 429")));
    }

    #[test]
    fn http_statuses_map_to_failure_kinds() {
        assert_eq!(classify_status(429), ErrorKind::RateLimited);
        assert_eq!(classify_status(401), ErrorKind::AuthInvalid);
        assert_eq!(classify_status(403), ErrorKind::AuthInvalid);
        assert_eq!(classify_status(408), ErrorKind::Timeout);
        assert_eq!(classify_status(504), ErrorKind::Timeout);
        assert_eq!(classify_status(500), ErrorKind::Unknown);
        assert_eq!(classify_status(400), ErrorKind::Unknown);
    }

    #[test]
    fn function_names_are_wire_safe() {
        assert_eq!(function_name(GMAIL), "portia_google_gmail_send_email");
        assert_eq!(function_name("calculator_tool"), "calculator_tool");
    }

    #[test]
    fn provider_response_decodes_without_optional_fields() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}}]
        }))
        .expect("minimal response");

        assert_eq!(response.choices[0].message.content.as_deref(), Some("hi"));
        assert!(response.usage.is_none());
    }
}
