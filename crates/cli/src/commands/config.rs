use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use nexus_core::config::{resolve_config_path, AppConfig, LoadOptions, ProviderConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub source: String,
}

struct SourceResolver {
    path: Option<PathBuf>,
    doc: Option<Value>,
}

impl SourceResolver {
    fn new(explicit: Option<&Path>) -> Self {
        let path = resolve_config_path(explicit);
        let doc = path
            .as_deref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|raw| raw.parse::<Value>().ok());
        Self { path, doc }
    }

    fn file_label(&self) -> String {
        self.path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string())
    }

    fn source(&self, key_path: &str, env_keys: &[&str]) -> String {
        if let Some(env_key) = env_keys.iter().find(|key| env::var_os(**key).is_some()) {
            return format!("env ({env_key})");
        }

        match &self.doc {
            Some(doc) if contains_path(doc, key_path) => format!("file ({})", self.file_label()),
            _ => "default".to_string(),
        }
    }

    fn provider_source(&self, provider_id: &str, field: &str) -> String {
        let env_key = ProviderConfig::env_key(provider_id, &field.to_ascii_uppercase());
        if env::var_os(&env_key).is_some() {
            return format!("env ({env_key})");
        }

        let in_file = self
            .doc
            .as_ref()
            .and_then(|doc| doc.get("providers"))
            .and_then(Value::as_array)
            .and_then(|providers| {
                providers.iter().find(|entry| {
                    entry.get("id").and_then(Value::as_str) == Some(provider_id)
                })
            })
            .is_some_and(|entry| entry.get(field).is_some());

        if in_file {
            format!("file ({})", self.file_label())
        } else {
            "default".to_string()
        }
    }
}

pub fn run(options: LoadOptions) -> CommandResult {
    let resolver = SourceResolver::new(options.config_path.as_deref());
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let entries = effective_entries(&config, &resolver);
    match serde_json::to_value(&entries) {
        Ok(data) => CommandResult::success_with_data(
            "config",
            "effective config (source precedence: env > file > default)",
            data,
        ),
        Err(error) => CommandResult::failure("config", "serialization", error.to_string(), 3),
    }
}

fn effective_entries(config: &AppConfig, resolver: &SourceResolver) -> Vec<ConfigEntry> {
    let mut entries = Vec::new();
    let mut push = |key: &str, value: String, source: String| {
        entries.push(ConfigEntry { key: key.to_string(), value, source });
    };

    push(
        "database.url",
        config.database.url.clone(),
        resolver.source("database.url", &["NEXUS_DATABASE_URL"]),
    );
    push(
        "database.max_connections",
        config.database.max_connections.to_string(),
        resolver.source("database.max_connections", &["NEXUS_DATABASE_MAX_CONNECTIONS"]),
    );
    push(
        "database.timeout_secs",
        config.database.timeout_secs.to_string(),
        resolver.source("database.timeout_secs", &["NEXUS_DATABASE_TIMEOUT_SECS"]),
    );

    push(
        "server.bind_address",
        config.server.bind_address.clone(),
        resolver.source("server.bind_address", &["NEXUS_SERVER_BIND_ADDRESS"]),
    );
    push(
        "server.port",
        config.server.port.to_string(),
        resolver.source("server.port", &["NEXUS_SERVER_PORT"]),
    );
    push(
        "server.graceful_shutdown_secs",
        config.server.graceful_shutdown_secs.to_string(),
        resolver.source("server.graceful_shutdown_secs", &["NEXUS_SERVER_GRACEFUL_SHUTDOWN_SECS"]),
    );

    push(
        "logging.level",
        config.logging.level.clone(),
        resolver.source("logging.level", &["NEXUS_LOGGING_LEVEL", "NEXUS_LOG_LEVEL"]),
    );
    push(
        "logging.format",
        format!("{:?}", config.logging.format).to_ascii_lowercase(),
        resolver.source("logging.format", &["NEXUS_LOGGING_FORMAT", "NEXUS_LOG_FORMAT"]),
    );

    push(
        "retry.primary_max_attempts",
        config.retry.primary_max_attempts.to_string(),
        resolver.source("retry.primary_max_attempts", &["NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS"]),
    );
    push(
        "retry.fallback_max_attempts",
        config.retry.fallback_max_attempts.to_string(),
        resolver.source("retry.fallback_max_attempts", &["NEXUS_RETRY_FALLBACK_MAX_ATTEMPTS"]),
    );
    push(
        "retry.base_delay_ms",
        config.retry.base_delay_ms.to_string(),
        resolver.source("retry.base_delay_ms", &["NEXUS_RETRY_BASE_DELAY_MS"]),
    );

    for provider in &config.providers {
        let id = provider.id.as_str();
        push(
            &format!("providers.{id}.priority"),
            provider.priority.to_string(),
            resolver.provider_source(id, "priority"),
        );
        push(
            &format!("providers.{id}.base_url"),
            provider.base_url.clone(),
            resolver.provider_source(id, "base_url"),
        );
        push(
            &format!("providers.{id}.model"),
            provider.model.clone(),
            resolver.provider_source(id, "model"),
        );
        push(
            &format!("providers.{id}.api_key"),
            redact_secret(provider.api_key.as_ref()),
            resolver.provider_source(id, "api_key"),
        );
    }

    push(
        "registries.cloud_api_key",
        redact_secret(config.registries.cloud_api_key.as_ref()),
        resolver.source("registries.cloud_api_key", &["NEXUS_REGISTRIES_CLOUD_API_KEY"]),
    );
    push(
        "registries.tool_gateway_url",
        config.registries.tool_gateway_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        resolver.source("registries.tool_gateway_url", &["NEXUS_REGISTRIES_TOOL_GATEWAY_URL"]),
    );

    entries
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps at most a four character prefix so operators can tell keys apart.
fn redact_secret(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<unset>".to_string();
    }
    if trimmed.chars().count() <= 8 {
        return "<redacted>".to_string();
    }

    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}
