use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::provider::ProviderDescriptor;
use crate::domain::registry::{
    builtin_cloud_tools, builtin_open_source_tools, RegistryCatalog, ToolCategory,
    ToolDescriptor, ToolRegistry, CLOUD_REGISTRY, OPEN_SOURCE_REGISTRY,
};

pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["nexus.toml", "config/nexus.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub retry: RetryConfig,
    pub providers: Vec<ProviderConfig>,
    pub registries: RegistriesConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub primary_max_attempts: u32,
    pub fallback_max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub id: String,
    pub priority: u32,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub supports_tools: bool,
    pub supports_clarification: bool,
    pub timeout_secs: u64,
    pub max_tool_rounds: u32,
}

#[derive(Clone, Debug)]
pub struct RegistriesConfig {
    /// Credential for the cloud tool registry; the registry is unavailable without it.
    pub cloud_api_key: Option<SecretString>,
    pub tool_gateway_url: Option<String>,
    pub open_source_tools: Option<Vec<ToolCatalogEntry>>,
    pub cloud_tools: Option<Vec<ToolCatalogEntry>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCatalogEntry {
    pub id: String,
    pub display_name: Option<String>,
    pub category: Option<ToolCategory>,
    pub description: Option<String>,
}

impl ToolCatalogEntry {
    pub fn into_descriptor(self) -> ToolDescriptor {
        let display_name = self.display_name.unwrap_or_else(|| self.id.clone());
        let description = self.description.unwrap_or_default();
        let descriptor = ToolDescriptor::new(self.id, display_name, description);
        match self.category {
            Some(category) => descriptor.with_category(category),
            None => descriptor,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub tool_gateway_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://nexus.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8000,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            retry: RetryConfig::default(),
            providers: default_providers(),
            registries: RegistriesConfig {
                cloud_api_key: None,
                tool_gateway_url: None,
                open_source_tools: None,
                cloud_tools: None,
            },
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { primary_max_attempts: 3, fallback_max_attempts: 2, base_delay_ms: 1_000 }
    }
}

impl ProviderConfig {
    fn new(id: &str, priority: u32, base_url: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            priority,
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key: None,
            supports_tools: true,
            supports_clarification: true,
            timeout_secs: 60,
            max_tool_rounds: 8,
        }
    }

    pub fn is_available(&self) -> bool {
        has_secret(self.api_key.as_ref())
    }

    pub fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(self.id.clone(), self.priority)
            .with_tools(self.supports_tools)
            .with_clarification(self.supports_clarification)
            .with_availability(self.is_available())
    }

    /// `NEXUS_PROVIDER_<ID>_<FIELD>` with the id upper-cased and `-` mapped to `_`.
    pub fn env_key(id: &str, field: &str) -> String {
        let id = id.to_ascii_uppercase().replace('-', "_");
        format!("NEXUS_PROVIDER_{id}_{field}")
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    let gemini = ProviderConfig::new(
        "gemini",
        0,
        "https://generativelanguage.googleapis.com/v1beta/openai",
        "gemini-1.5-pro",
    );
    let mistral =
        ProviderConfig::new("mistral", 1, "https://api.mistral.ai/v1", "mistral-small-latest");
    let mut direct = ProviderConfig::new(
        "mistral-direct",
        2,
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
    );
    direct.supports_tools = false;
    direct.supports_clarification = false;

    vec![gemini, mistral, direct]
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn has_secret(value: Option<&SecretString>) -> bool {
    value.map(|secret| !secret.expose_secret().trim().is_empty()).unwrap_or(false)
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn provider_descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers.iter().map(ProviderConfig::descriptor).collect()
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    pub fn cloud_registry_available(&self) -> bool {
        has_secret(self.registries.cloud_api_key.as_ref())
    }

    /// Builds the registry snapshot described by this configuration.
    pub fn registry_catalog(&self) -> RegistryCatalog {
        let open_source = match &self.registries.open_source_tools {
            Some(entries) => {
                entries.iter().cloned().map(ToolCatalogEntry::into_descriptor).collect()
            }
            None => builtin_open_source_tools(),
        };
        let cloud = if self.cloud_registry_available() {
            let tools = match &self.registries.cloud_tools {
                Some(entries) => {
                    entries.iter().cloned().map(ToolCatalogEntry::into_descriptor).collect()
                }
                None => builtin_cloud_tools(),
            };
            ToolRegistry::new(CLOUD_REGISTRY, tools)
        } else {
            ToolRegistry::unavailable(CLOUD_REGISTRY)
        };

        RegistryCatalog::new(vec![ToolRegistry::new(OPEN_SOURCE_REGISTRY, open_source), cloud])
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(primary_max_attempts) = retry.primary_max_attempts {
                self.retry.primary_max_attempts = primary_max_attempts;
            }
            if let Some(fallback_max_attempts) = retry.fallback_max_attempts {
                self.retry.fallback_max_attempts = fallback_max_attempts;
            }
            if let Some(base_delay_ms) = retry.base_delay_ms {
                self.retry.base_delay_ms = base_delay_ms;
            }
        }

        // Provider entries merge onto an existing provider with the same id, or add a new one.
        for provider in patch.providers.unwrap_or_default() {
            self.apply_provider_patch(provider);
        }

        if let Some(registries) = patch.registries {
            if let Some(cloud_api_key_value) = registries.cloud_api_key {
                self.registries.cloud_api_key = Some(secret_value(cloud_api_key_value));
            }
            if let Some(tool_gateway_url) = registries.tool_gateway_url {
                self.registries.tool_gateway_url = Some(tool_gateway_url);
            }
            if let Some(open_source_tools) = registries.open_source_tools {
                self.registries.open_source_tools = Some(open_source_tools);
            }
            if let Some(cloud_tools) = registries.cloud_tools {
                self.registries.cloud_tools = Some(cloud_tools);
            }
        }
    }

    fn apply_provider_patch(&mut self, patch: ProviderPatch) {
        let index = match self.providers.iter().position(|provider| provider.id == patch.id) {
            Some(index) => index,
            None => {
                let priority = self.providers.iter().map(|p| p.priority + 1).max().unwrap_or(0);
                self.providers.push(ProviderConfig::new(&patch.id, priority, "", ""));
                self.providers.len() - 1
            }
        };
        let provider = &mut self.providers[index];

        if let Some(priority) = patch.priority {
            provider.priority = priority;
        }
        if let Some(base_url) = patch.base_url {
            provider.base_url = base_url;
        }
        if let Some(model) = patch.model {
            provider.model = model;
        }
        if let Some(provider_api_key_value) = patch.api_key {
            provider.api_key = Some(secret_value(provider_api_key_value));
        }
        if let Some(supports_tools) = patch.supports_tools {
            provider.supports_tools = supports_tools;
        }
        if let Some(supports_clarification) = patch.supports_clarification {
            provider.supports_clarification = supports_clarification;
        }
        if let Some(timeout_secs) = patch.timeout_secs {
            provider.timeout_secs = timeout_secs;
        }
        if let Some(max_tool_rounds) = patch.max_tool_rounds {
            provider.max_tool_rounds = max_tool_rounds;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("NEXUS_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("NEXUS_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("NEXUS_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("NEXUS_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("NEXUS_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("NEXUS_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("NEXUS_SERVER_PORT") {
            self.server.port = parse_u16("NEXUS_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("NEXUS_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("NEXUS_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("NEXUS_LOGGING_LEVEL").or_else(|| read_env("NEXUS_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("NEXUS_LOGGING_FORMAT").or_else(|| read_env("NEXUS_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS") {
            self.retry.primary_max_attempts =
                parse_u32("NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("NEXUS_RETRY_FALLBACK_MAX_ATTEMPTS") {
            self.retry.fallback_max_attempts =
                parse_u32("NEXUS_RETRY_FALLBACK_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("NEXUS_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_u64("NEXUS_RETRY_BASE_DELAY_MS", &value)?;
        }

        for provider in &mut self.providers {
            if let Some(value) = read_env(&ProviderConfig::env_key(&provider.id, "API_KEY")) {
                provider.api_key = Some(secret_value(value));
            }
            if let Some(value) = read_env(&ProviderConfig::env_key(&provider.id, "BASE_URL")) {
                provider.base_url = value;
            }
            if let Some(value) = read_env(&ProviderConfig::env_key(&provider.id, "MODEL")) {
                provider.model = value;
            }
        }

        if let Some(value) = read_env("NEXUS_REGISTRIES_CLOUD_API_KEY") {
            self.registries.cloud_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("NEXUS_REGISTRIES_TOOL_GATEWAY_URL") {
            self.registries.tool_gateway_url = Some(value);
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(tool_gateway_url) = overrides.tool_gateway_url {
            self.registries.tool_gateway_url = Some(tool_gateway_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_retry(&self.retry)?;
        validate_providers(&self.providers)?;
        validate_registries(&self.registries)?;
        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_CONFIG_FILES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_retry(retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.primary_max_attempts == 0 || retry.fallback_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "retry.primary_max_attempts and retry.fallback_max_attempts must be at least 1"
                .to_string(),
        ));
    }

    if retry.primary_max_attempts > 10 || retry.fallback_max_attempts > 10 {
        return Err(ConfigError::Validation(
            "retry attempt budgets above 10 are not supported".to_string(),
        ));
    }

    if retry.base_delay_ms > 60_000 {
        return Err(ConfigError::Validation(
            "retry.base_delay_ms must be at most 60000".to_string(),
        ));
    }

    Ok(())
}

fn validate_providers(providers: &[ProviderConfig]) -> Result<(), ConfigError> {
    let mut seen = Vec::with_capacity(providers.len());

    for provider in providers {
        let id = provider.id.trim();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(format!(
                "providers[].id `{}` must be a non-empty identifier without whitespace",
                provider.id
            )));
        }
        if seen.contains(&id) {
            return Err(ConfigError::Validation(format!(
                "providers[].id `{id}` is declared more than once"
            )));
        }
        seen.push(id);

        if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation(format!(
                "providers[{id}].base_url must start with http:// or https://"
            )));
        }
        if provider.model.trim().is_empty() {
            return Err(ConfigError::Validation(format!("providers[{id}].model is required")));
        }
        if provider.timeout_secs == 0 || provider.timeout_secs > 300 {
            return Err(ConfigError::Validation(format!(
                "providers[{id}].timeout_secs must be in range 1..=300"
            )));
        }
        if provider.max_tool_rounds == 0 {
            return Err(ConfigError::Validation(format!(
                "providers[{id}].max_tool_rounds must be greater than zero"
            )));
        }
    }

    Ok(())
}

fn validate_registries(registries: &RegistriesConfig) -> Result<(), ConfigError> {
    if let Some(url) = &registries.tool_gateway_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "registries.tool_gateway_url must start with http:// or https://".to_string(),
            ));
        }
    }

    let catalogs = [
        ("registries.open_source_tools", &registries.open_source_tools),
        ("registries.cloud_tools", &registries.cloud_tools),
    ];
    for (key, catalog) in catalogs {
        let Some(entries) = catalog else { continue };
        if entries.iter().any(|entry| entry.id.trim().is_empty()) {
            return Err(ConfigError::Validation(format!("{key} entries require a non-empty id")));
        }
    }

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    retry: Option<RetryPatch>,
    providers: Option<Vec<ProviderPatch>>,
    registries: Option<RegistriesPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    primary_max_attempts: Option<u32>,
    fallback_max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProviderPatch {
    id: String,
    priority: Option<u32>,
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    supports_tools: Option<bool>,
    supports_clarification: Option<bool>,
    timeout_secs: Option<u64>,
    max_tool_rounds: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistriesPatch {
    cloud_api_key: Option<String>,
    tool_gateway_url: Option<String>,
    open_source_tools: Option<Vec<ToolCatalogEntry>>,
    cloud_tools: Option<Vec<ToolCatalogEntry>>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, ProviderConfig};
    use crate::domain::registry::{ToolCategory, CLOUD_REGISTRY, OPEN_SOURCE_REGISTRY};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    fn missing_path(dir: &TempDir) -> LoadOptions {
        LoadOptions { config_path: Some(dir.path().join("absent.toml")), ..LoadOptions::default() }
    }

    #[test]
    fn defaults_describe_three_providers_without_credentials() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;

        let config =
            AppConfig::load(missing_path(&dir)).map_err(|err| format!("config load failed: {err}"))?;
        let descriptors = config.provider_descriptors();

        ensure(descriptors.len() == 3, "three default providers")?;
        ensure(descriptors.iter().all(|d| !d.available), "no provider has a credential")?;
        ensure(
            descriptors.iter().any(|d| d.id.as_str() == "mistral-direct" && !d.supports_tools),
            "direct fallback sends no tools",
        )?;
        ensure(config.retry.primary_max_attempts == 3, "primary budget defaults to 3")?;
        ensure(config.retry.fallback_max_attempts == 2, "fallback budget defaults to 2")?;
        ensure(config.retry.base_delay_ms == 1_000, "base delay defaults to one second")?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation_and_provider_merge() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_NEXUS_GEMINI_KEY", "gemini-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("nexus.toml");
            fs::write(
                &path,
                r#"
[[providers]]
id = "gemini"
api_key = "${TEST_NEXUS_GEMINI_KEY}"

[[providers]]
id = "local"
priority = 7
base_url = "http://localhost:11434/v1"
model = "llama3.1"
supports_tools = false
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let gemini = config.provider("gemini").ok_or("gemini provider missing")?;
            ensure(
                gemini.api_key.as_ref().map(|key| key.expose_secret() == "gemini-from-env")
                    == Some(true),
                "gemini key should be interpolated from the environment",
            )?;
            ensure(gemini.is_available(), "gemini should be available with a key")?;

            let local = config.provider("local").ok_or("local provider missing")?;
            ensure(local.priority == 7, "new provider keeps its priority")?;
            ensure(!local.supports_tools, "new provider disables tools")?;
            ensure(!local.is_available(), "new provider has no key")?;
            ensure(config.providers.len() == 4, "new provider is appended")?;
            Ok(())
        })();

        clear_vars(&["TEST_NEXUS_GEMINI_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NEXUS_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("NEXUS_RETRY_BASE_DELAY_MS", "250");
        env::set_var("NEXUS_PROVIDER_MISTRAL_DIRECT_API_KEY", "direct-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("nexus.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[retry]
base_delay_ms = 500
primary_max_attempts = 4

[logging]
level = "warn"

[[providers]]
id = "mistral-direct"
api_key = "direct-from-file"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.retry.base_delay_ms == 250, "env base delay should win over file")?;
            ensure(config.retry.primary_max_attempts == 4, "file attempts should win over default")?;
            let direct = config.provider("mistral-direct").ok_or("direct provider missing")?;
            ensure(
                direct.api_key.as_ref().map(|key| key.expose_secret() == "direct-from-env")
                    == Some(true),
                "env provider key should win over file",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "NEXUS_DATABASE_URL",
            "NEXUS_RETRY_BASE_DELAY_MS",
            "NEXUS_PROVIDER_MISTRAL_DIRECT_API_KEY",
        ]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NEXUS_LOG_LEVEL", "warn");
        env::set_var("NEXUS_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let config = AppConfig::load(missing_path(&dir))
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["NEXUS_LOG_LEVEL", "NEXUS_LOG_FORMAT"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS", "0");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let error = match AppConfig::load(missing_path(&dir)) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("retry.primary_max_attempts")
            );
            ensure(has_message, "validation failure should mention retry.primary_max_attempts")
        })();

        clear_vars(&["NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NEXUS_SERVER_PORT", "eighty");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let error = AppConfig::load(missing_path(&dir))
                .err()
                .ok_or("expected invalid override error")?;
            ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "NEXUS_SERVER_PORT"),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["NEXUS_SERVER_PORT"]);
        result
    }

    #[test]
    fn cloud_registry_requires_credential() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;

        let without_key = AppConfig::load(missing_path(&dir))
            .map_err(|err| format!("config load failed: {err}"))?;
        let catalog = without_key.registry_catalog();
        let cloud = catalog.get(CLOUD_REGISTRY).ok_or("cloud registry missing")?;
        ensure(!cloud.available && cloud.tools.is_empty(), "cloud is unavailable without a key")?;
        let open_source = catalog.get(OPEN_SOURCE_REGISTRY).ok_or("open_source missing")?;
        ensure(open_source.tool_count() == 10, "builtin open source catalog is used")?;

        env::set_var("NEXUS_REGISTRIES_CLOUD_API_KEY", "cloud-key");
        let with_key = AppConfig::load(missing_path(&dir));
        clear_vars(&["NEXUS_REGISTRIES_CLOUD_API_KEY"]);

        let with_key = with_key.map_err(|err| format!("config load failed: {err}"))?;
        let catalog = with_key.registry_catalog();
        let cloud = catalog.get(CLOUD_REGISTRY).ok_or("cloud registry missing")?;
        ensure(cloud.available && !cloud.tools.is_empty(), "cloud is available with a key")?;
        Ok(())
    }

    #[test]
    fn catalog_overrides_infer_missing_categories() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("nexus.toml");
        fs::write(
            &path,
            r#"
[registries]
tool_gateway_url = "http://localhost:9100"

[[registries.open_source_tools]]
id = "weather_tool"

[[registries.open_source_tools]]
id = "quote_lookup"
display_name = "Quote Lookup"
category = "information"
"#,
        )
        .map_err(|err| err.to_string())?;

        let config =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .map_err(|err| format!("config load failed: {err}"))?;
        let catalog = config.registry_catalog();
        let open_source = catalog.get(OPEN_SOURCE_REGISTRY).ok_or("open_source missing")?;

        ensure(open_source.tool_count() == 2, "override replaces the builtin catalog")?;
        ensure(
            open_source.tool("weather_tool").map(|tool| tool.category)
                == Some(ToolCategory::Information),
            "weather category is inferred",
        )?;
        ensure(
            open_source.tool("quote_lookup").map(|tool| tool.display_name.as_str())
                == Some("Quote Lookup"),
            "display name is kept",
        )?;
        Ok(())
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NEXUS_PROVIDER_GEMINI_API_KEY", "gemini-secret-value");
        env::set_var("NEXUS_REGISTRIES_CLOUD_API_KEY", "cloud-secret-value");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let config = AppConfig::load(missing_path(&dir))
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("gemini-secret-value"), "debug output leaks provider key")?;
            ensure(!debug.contains("cloud-secret-value"), "debug output leaks cloud key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["NEXUS_PROVIDER_GEMINI_API_KEY", "NEXUS_REGISTRIES_CLOUD_API_KEY"]);
        result
    }

    #[test]
    fn provider_env_keys_normalize_ids() {
        assert_eq!(
            ProviderConfig::env_key("mistral-direct", "API_KEY"),
            "NEXUS_PROVIDER_MISTRAL_DIRECT_API_KEY"
        );
    }
}
