use std::sync::Arc;
use std::time::Duration;

use nexus_agent::cascade::FallbackCascade;
use nexus_agent::chat::ChatCompletionsAdapter;
use nexus_agent::llm::ProviderAdapter;
use nexus_agent::retry::TokioSleeper;
use nexus_agent::runtime::Orchestrator;
use nexus_agent::tools::{HttpToolExecutor, ToolExecutor, ToolRegistrySelector};
use nexus_core::audit::TracingAuditSink;
use nexus_core::config::AppConfig;
use nexus_core::errors::ApplicationError;
use nexus_db::{connect_with_config, migrations, DbPool, SqlRunRepository};
use thiserror::Error;
use tracing::info;

const TOOL_GATEWAY_TIMEOUT_SECS: u64 = 60;

pub struct Application {
    pub config: Arc<AppConfig>,
    pub db_pool: DbPool,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider setup failed: {0}")]
    Providers(#[source] ApplicationError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.database_ready",
        correlation_id = "bootstrap",
        "database connected and migrations applied"
    );

    let executor: Arc<dyn ToolExecutor> = Arc::new(
        HttpToolExecutor::new(
            config.registries.tool_gateway_url.clone(),
            Duration::from_secs(TOOL_GATEWAY_TIMEOUT_SECS),
        )
        .map_err(BootstrapError::Providers)?,
    );

    let mut providers: Vec<Arc<dyn ProviderAdapter>> = Vec::with_capacity(config.providers.len());
    for provider in &config.providers {
        let adapter = ChatCompletionsAdapter::from_config(provider, Arc::clone(&executor))
            .map_err(BootstrapError::Providers)?;
        info!(
            event_name = "system.bootstrap.provider_registered",
            correlation_id = "bootstrap",
            provider_id = %provider.id,
            priority = provider.priority,
            available = provider.is_available(),
            "provider registered"
        );
        providers.push(Arc::new(adapter));
    }

    let cascade =
        FallbackCascade::from_retry_config(providers, &config.retry, Arc::new(TokioSleeper));
    let registries = Arc::new(ToolRegistrySelector::new(config.registry_catalog()));
    let ledger = Arc::new(SqlRunRepository::new(db_pool.clone()));
    let orchestrator =
        Orchestrator::new(cascade, registries, ledger, Arc::new(TracingAuditSink));

    Ok(Application { config: Arc::new(config), db_pool, orchestrator: Arc::new(orchestrator) })
}
