//! JSON API for query orchestration.
//!
//! - `POST /query`: start a run
//! - `POST /clarification`: answer a run's outstanding clarification
//! - `GET /registries`: current tool registry snapshot
//! - `POST /registries/reload`: rebuild registries from configuration
//! - `GET /runs/{run_id}`: run state
//! - `POST /runs/{run_id}/cancel`: cancel a running run
//! - `GET /conversations/{conversation_id}/latest`: most recent run of a conversation

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use nexus_agent::runtime::{Orchestrator, QueryRequest};
use nexus_agent::tools::RegistrySnapshot;
use nexus_core::config::{AppConfig, ToolCatalogEntry};
use nexus_core::domain::clarification::{
    ClarificationId, ClarificationOutcome, ClarificationPayload, ClarificationResponse,
};
use nexus_core::domain::registry::ToolRegistry;
use nexus_core::domain::run::{ConversationId, Run, RunFailure, RunId};
use nexus_core::errors::{ApplicationError, ErrorKind, InterfaceError};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<AppConfig>,
}

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub prompt: String,
    #[serde(default)]
    pub registry_name: Option<String>,
    #[serde(default)]
    pub provider_preference: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClarificationBody {
    pub clarification_id: String,
    pub response: ClarificationOutcome,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadBody {
    #[serde(default)]
    pub open_source_tools: Option<Vec<ToolCatalogEntry>>,
    #[serde(default)]
    pub cloud_tools: Option<Vec<ToolCatalogEntry>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClarificationView {
    pub clarification_id: String,
    pub prompt: String,
    #[serde(flatten)]
    pub payload: ClarificationPayload,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub conversation_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub tools_used: Vec<String>,
    pub provider_used: Option<String>,
    pub registry_used: String,
    pub elapsed_seconds: f64,
}

impl RunResponse {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.to_string(),
            conversation_id: run.conversation_id.to_string(),
            status: run.status.as_str().to_string(),
            result: run.result.clone(),
            clarification: run.pending_clarification.as_ref().map(|clarification| {
                ClarificationView {
                    clarification_id: clarification.id.to_string(),
                    prompt: clarification.prompt.clone(),
                    payload: clarification.payload.clone(),
                    created_at: clarification.created_at.to_rfc3339(),
                }
            }),
            failure: run.failure.clone(),
            tools_used: run.tools_used.clone(),
            provider_used: run.provider_id.as_ref().map(|id| id.to_string()),
            registry_used: run.registry_name.clone(),
            elapsed_seconds: run.elapsed_seconds(Utc::now()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolView {
    pub id: String,
    pub name: String,
    pub category: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryView {
    pub tool_count: usize,
    pub available: bool,
    pub tools: Vec<ToolView>,
}

impl From<&ToolRegistry> for RegistryView {
    fn from(registry: &ToolRegistry) -> Self {
        Self {
            tool_count: registry.tool_count(),
            available: registry.available,
            tools: registry
                .tools
                .iter()
                .map(|tool| ToolView {
                    id: tool.id.clone(),
                    name: tool.display_name.clone(),
                    category: tool.category.label().to_string(),
                    description: tool.description.clone(),
                })
                .collect(),
        }
    }
}

pub fn registry_views(snapshot: &RegistrySnapshot) -> BTreeMap<String, RegistryView> {
    snapshot
        .registries()
        .iter()
        .map(|registry| (registry.name.clone(), RegistryView::from(registry.as_ref())))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub generation: u64,
    pub registries: BTreeMap<String, RegistryView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: ErrorKind,
    pub message: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            error_kind: ErrorKind::Unknown,
            correlation_id: correlation_id.to_string(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(
            event_name = "api.request_failed",
            correlation_id = %self.0.correlation_id(),
            status = status.as_u16(),
            error_kind = self.0.error_kind().as_str(),
            error = %self.0,
            "request failed"
        );
        let body = ErrorBody {
            error_kind: self.0.error_kind(),
            message: self.0.message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/query", post(submit_query))
        .route("/clarification", post(submit_clarification))
        .route("/registries", get(list_registries))
        .route("/registries/reload", post(reload_registries))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/conversations/{conversation_id}/latest", get(latest_for_conversation))
        .with_state(state)
}

pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", Uuid::new_v4().simple()))
}

pub async fn submit_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text(), &correlation_id))?;

    info!(
        event_name = "api.query_received",
        correlation_id = %correlation_id,
        registry = body.registry_name.as_deref().unwrap_or("default"),
        provider_preference = body.provider_preference.as_deref().unwrap_or(""),
        "query received"
    );
    let request = QueryRequest {
        prompt: body.prompt,
        registry_name: body.registry_name,
        provider_preference: body.provider_preference,
        conversation_id: body
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .map(ConversationId),
        correlation_id: correlation_id.clone(),
    };

    let run = state
        .orchestrator
        .run_query(request)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(RunResponse::from_run(&run)))
}

pub async fn submit_clarification(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<ClarificationBody>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text(), &correlation_id))?;

    let response = ClarificationResponse {
        clarification_id: ClarificationId(body.clarification_id),
        outcome: body.response,
    };
    let run = state
        .orchestrator
        .submit_clarification(response, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(RunResponse::from_run(&run)))
}

pub async fn list_registries(State(state): State<ApiState>) -> Json<BTreeMap<String, RegistryView>> {
    Json(registry_views(&state.orchestrator.registries()))
}

pub async fn reload_registries(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Option<Json<ReloadBody>>,
) -> Json<ReloadResponse> {
    let correlation_id = correlation_id(&headers);
    let overrides = body.map(|Json(body)| body).unwrap_or_default();

    let mut config = state.config.as_ref().clone();
    if let Some(tools) = overrides.open_source_tools {
        config.registries.open_source_tools = Some(tools);
    }
    if let Some(tools) = overrides.cloud_tools {
        config.registries.cloud_tools = Some(tools);
    }

    let snapshot = state.orchestrator.reload_registries(config.registry_catalog());
    info!(
        event_name = "api.registries_reloaded",
        correlation_id = %correlation_id,
        generation = snapshot.generation,
        "registry snapshot reloaded"
    );
    Json(ReloadResponse { generation: snapshot.generation, registries: registry_views(&snapshot) })
}

pub async fn get_run(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let run = state
        .orchestrator
        .get_run(&RunId(run_id))
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(RunResponse::from_run(&run)))
}

pub async fn cancel_run(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let run = state
        .orchestrator
        .cancel_run(&RunId(run_id), &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(RunResponse::from_run(&run)))
}

pub async fn latest_for_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let run = state
        .orchestrator
        .latest_for_conversation(&ConversationId(conversation_id))
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(RunResponse::from_run(&run)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use nexus_agent::cascade::FallbackCascade;
    use nexus_agent::llm::{ProviderAdapter, ProviderOutcome};
    use nexus_agent::retry::RetryPolicy;
    use nexus_agent::runtime::Orchestrator;
    use nexus_agent::testing::{RecordingSleeper, ScriptedProvider};
    use nexus_agent::tools::ToolRegistrySelector;
    use nexus_core::audit::InMemoryAuditSink;
    use nexus_core::config::AppConfig;
    use nexus_core::domain::clarification::{ClarificationPayload, ClarificationRequest};
    use nexus_core::domain::provider::ProviderDescriptor;
    use nexus_db::InMemoryRunRepository;

    use super::{router, ApiState, CORRELATION_HEADER};

    fn app(script: Vec<ProviderOutcome>) -> Router {
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedProvider::new(ProviderDescriptor::new("gemini", 0), script));
        let config = AppConfig::default();
        let cascade = FallbackCascade::new(
            vec![provider],
            RetryPolicy::new(3, Duration::from_millis(10)),
            RetryPolicy::new(2, Duration::from_millis(10)),
            Arc::new(RecordingSleeper::default()),
        );
        let orchestrator = Orchestrator::new(
            cascade,
            Arc::new(ToolRegistrySelector::new(config.registry_catalog())),
            Arc::new(InMemoryRunRepository::default()),
            Arc::new(InMemoryAuditSink::default()),
        );
        router(ApiState { orchestrator: Arc::new(orchestrator), config: Arc::new(config) })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CORRELATION_HEADER, "req-test");
        let body = match body {
            Some(body) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json body") };
        (status, json)
    }

    fn oauth_needed() -> ProviderOutcome {
        ProviderOutcome::NeedsClarification {
            request: ClarificationRequest {
                prompt: "Authorize Gmail".to_string(),
                payload: ClarificationPayload::OauthAuthorization {
                    auth_url: "https://auth.example.com".to_string(),
                },
                continuation: "token".to_string(),
            },
            tools_used: Vec::new(),
        }
    }

    #[tokio::test]
    async fn query_returns_the_completed_run() {
        let app = app(vec![ProviderOutcome::Success {
            payload: json!({"final_output": "4"}),
            tools_used: vec!["calculator_tool".to_string()],
        }]);

        let (status, body) = send(&app, "POST", "/query", Some(json!({"prompt": "2+2?"}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["provider_used"], "gemini");
        assert_eq!(body["registry_used"], "default");
        assert_eq!(body["result"]["final_output"], "4");
        assert_eq!(body["tools_used"], json!(["calculator_tool"]));
        assert!(body.get("clarification").is_none());

        let run_id = body["run_id"].as_str().expect("run id").to_string();
        let (status, fetched) = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["run_id"], run_id.as_str());
    }

    #[tokio::test]
    async fn clarification_round_trip_over_http() {
        let app = app(vec![
            oauth_needed(),
            ProviderOutcome::Success { payload: json!({"final_output": "sent"}), tools_used: Vec::new() },
        ]);

        let (_, suspended) = send(&app, "POST", "/query", Some(json!({"prompt": "email it"}))).await;
        assert_eq!(suspended["status"], "awaiting_clarification");
        assert_eq!(suspended["clarification"]["kind"], "oauth_authorization");
        assert_eq!(suspended["clarification"]["auth_url"], "https://auth.example.com");
        let clarification_id = suspended["clarification"]["clarification_id"].clone();

        let answer = json!({"clarification_id": clarification_id, "response": {"outcome": "authorized"}});
        let (status, resumed) = send(&app, "POST", "/clarification", Some(answer.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resumed["status"], "completed");

        let (status, stale) = send(&app, "POST", "/clarification", Some(answer)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(stale["error_kind"], "stale_clarification");
        assert_eq!(stale["correlation_id"], "req-test");
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let app = app(vec![oauth_needed()]);

        let (status, body) =
            send(&app, "POST", "/query", Some(json!({"prompt": "hi", "registry_name": "partner"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "registry_not_found");

        let (status, _) = send(&app, "POST", "/query", Some(json!({"prompt": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/query", Some(json!({"registry_name": "default"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "GET", "/runs/run_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["correlation_id"], "req-test");

        let (status, _) = send(&app, "GET", "/conversations/nobody/latest", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, suspended) = send(&app, "POST", "/query", Some(json!({"prompt": "email"}))).await;
        let run_id = suspended["run_id"].as_str().expect("run id").to_string();
        let (status, _) = send(&app, "POST", &format!("/runs/{run_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let clarification_id = suspended["clarification"]["clarification_id"].clone();
        let (status, body) = send(
            &app,
            "POST",
            "/clarification",
            Some(json!({"clarification_id": clarification_id, "response": {"outcome": "confirmed"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap_or_default().contains("confirmed"));
    }

    #[tokio::test]
    async fn registries_listing_and_reload() {
        let app = app(Vec::new());

        let (status, body) = send(&app, "GET", "/registries", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["open_source"]["available"], true);
        assert_eq!(body["open_source"]["tool_count"], 10);
        assert_eq!(body["cloud"]["available"], false);
        assert_eq!(body["cloud"]["tool_count"], 0);
        assert_eq!(body["default"]["tool_count"], 10);

        let (status, reloaded) = send(
            &app,
            "POST",
            "/registries/reload",
            Some(json!({"open_source_tools": [{"id": "search_tool"}, {"id": "weather_tool", "description": "Weather"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reloaded["generation"], 2);
        assert_eq!(reloaded["registries"]["default"]["tool_count"], 2);
        assert_eq!(reloaded["registries"]["open_source"]["tools"][0]["category"], "Search & Web");

        let (status, reset) = send(&app, "POST", "/registries/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset["generation"], 3);
        assert_eq!(reset["registries"]["open_source"]["tool_count"], 10);
    }
}
