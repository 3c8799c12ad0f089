use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use nexus_core::domain::clarification::{ClarificationOutcome, ClarificationPayload};
use nexus_core::domain::registry::{RegistryCatalog, ToolRegistry, DEFAULT_REGISTRY};
use nexus_core::errors::ApplicationError;

/// Immutable view of every registry, including the derived `default` union.
#[derive(Debug)]
pub struct RegistrySnapshot {
    pub generation: u64,
    registries: HashMap<String, Arc<ToolRegistry>>,
    order: Vec<String>,
}

impl RegistrySnapshot {
    fn build(catalog: RegistryCatalog, generation: u64) -> Self {
        let default = Arc::new(catalog.union_of_available());
        let mut registries = HashMap::new();
        let mut order = Vec::new();

        for registry in catalog.registries {
            if registry.name == DEFAULT_REGISTRY {
                warn!(
                    event_name = "registry.reserved_name_ignored",
                    registry = %registry.name,
                    "catalog entry uses the reserved default registry name"
                );
                continue;
            }
            order.push(registry.name.clone());
            registries.insert(registry.name.clone(), Arc::new(registry));
        }
        order.push(DEFAULT_REGISTRY.to_string());
        registries.insert(DEFAULT_REGISTRY.to_string(), default);

        Self { generation, registries, order }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolRegistry>> {
        self.registries.get(name).cloned()
    }

    /// Registries in catalog order, `default` last.
    pub fn registries(&self) -> Vec<Arc<ToolRegistry>> {
        self.order.iter().filter_map(|name| self.registries.get(name).cloned()).collect()
    }
}

pub struct ToolRegistrySelector {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl ToolRegistrySelector {
    pub fn new(catalog: RegistryCatalog) -> Self {
        Self { current: RwLock::new(Arc::new(RegistrySnapshot::build(catalog, 1))) }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// An unavailable registry resolves to its (empty) snapshot; only unknown names fail.
    pub fn resolve(&self, name: &str) -> Result<Arc<ToolRegistry>, ApplicationError> {
        self.snapshot()
            .get(name)
            .ok_or_else(|| ApplicationError::RegistryNotFound { name: name.to_string() })
    }

    /// Swaps in a new snapshot. Callers holding the previous one keep using it.
    pub fn reload(&self, catalog: RegistryCatalog) -> Arc<RegistrySnapshot> {
        let mut current = match self.current.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(RegistrySnapshot::build(catalog, current.generation + 1));
        *current = Arc::clone(&next);
        info!(
            event_name = "registry.reloaded",
            generation = next.generation,
            registries = next.order.len(),
            "tool registry snapshot replaced"
        );
        next
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: String,
    pub arguments: Value,
    /// Set when the call is re-executed after a human resolved its clarification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ClarificationOutcome>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallResult {
    Ok { output: Value },
    ClarificationRequired { prompt: String, payload: ClarificationPayload },
    Error { message: String },
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, invocation: &ToolInvocation) -> ToolCallResult;
}

/// Invokes tools through the gateway at `POST {base_url}/tools/{tool_id}/invoke`.
pub struct HttpToolExecutor {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpToolExecutor {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, ApplicationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        let base_url = base_url.map(|url| url.trim_end_matches('/').to_string());
        Ok(Self { client, base_url })
    }

    pub fn endpoint(&self, tool_id: &str) -> Option<String> {
        self.base_url.as_ref().map(|base| format!("{base}/tools/{tool_id}/invoke"))
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, invocation: &ToolInvocation) -> ToolCallResult {
        let Some(endpoint) = self.endpoint(&invocation.tool_id) else {
            return ToolCallResult::Error {
                message: format!(
                    "tool `{}` cannot run: no tool gateway is configured",
                    invocation.tool_id
                ),
            };
        };

        let response = match self.client.post(&endpoint).json(invocation).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    event_name = "tool.gateway_unreachable",
                    tool_id = %invocation.tool_id,
                    error = %error,
                    "tool gateway request failed"
                );
                return ToolCallResult::Error { message: format!("tool gateway error: {error}") };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return ToolCallResult::Error {
                message: format!("tool `{}` failed with HTTP {status}: {body}", invocation.tool_id),
            };
        }

        match response.json::<ToolCallResult>().await {
            Ok(result) => result,
            Err(error) => ToolCallResult::Error {
                message: format!("tool `{}` returned an unreadable body: {error}", invocation.tool_id),
            },
        }
    }
}
