use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use nexus_agent::runtime::Orchestrator;

#[derive(Clone)]
pub struct HealthState {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub providers: BTreeMap<String, bool>,
    pub registries: BTreeMap<String, bool>,
    pub database: HealthCheck,
    pub checked_at: String,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { orchestrator })
}

/// `ready` needs a reachable ledger and at least one available provider.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = if state.orchestrator.ledger_ready().await {
        HealthCheck { status: "ready", detail: "database query succeeded".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: "database query failed".to_string() }
    };

    let providers: BTreeMap<String, bool> = state
        .orchestrator
        .providers()
        .into_iter()
        .map(|provider| (provider.id.to_string(), provider.available))
        .collect();
    let registries: BTreeMap<String, bool> = state
        .orchestrator
        .registries()
        .registries()
        .iter()
        .map(|registry| (registry.name.clone(), registry.available))
        .collect();

    let ready = database.status == "ready" && providers.values().any(|available| *available);
    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        providers,
        registries,
        database,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}
