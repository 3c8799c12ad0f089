use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use nexus_cli::commands::{config, doctor, migrate, registries};
use nexus_core::config::LoadOptions;
use serde_json::Value;

const GEMINI_KEY: &str = "gemini-test-credential-0001";

#[test]
fn migrate_returns_success_with_in_memory_ledger() {
    with_env(&[("NEXUS_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run(no_file());
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_override() {
    with_env(&[("NEXUS_SERVER_PORT", "eighty")], || {
        let result = migrate::run(no_file());
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or_default().contains("NEXUS_SERVER_PORT"));
    });
}

#[test]
fn doctor_reports_provider_cascade_and_registry_warning() {
    with_env(
        &[
            ("NEXUS_DATABASE_URL", "sqlite::memory:"),
            ("NEXUS_PROVIDER_GEMINI_API_KEY", GEMINI_KEY),
        ],
        || {
            let result = doctor::run(no_file(), true);
            assert_eq!(result.exit_code, 0, "warnings must not fail doctor");

            let report = parse_payload(&result.output);
            assert_eq!(report["overall_status"], "warn");
            assert_eq!(check(&report, "config_validation")["status"], "pass");
            assert_eq!(check(&report, "database_connectivity")["status"], "pass");

            let providers = check(&report, "provider_readiness");
            assert_eq!(providers["status"], "pass");
            let details = providers["details"].as_str().unwrap_or_default();
            assert!(details.contains("cascade order: gemini"));
            assert!(details.contains("missing credentials: mistral, mistral-direct"));

            let registries = check(&report, "registry_readiness");
            assert_eq!(registries["status"], "warn");
            let details = registries["details"].as_str().unwrap_or_default();
            assert!(details.contains("open_source=10 tools"));
            assert!(details.contains("cloud=unavailable"));
            assert!(details.contains("default=10 tools"));
        },
    );
}

#[test]
fn doctor_fails_without_any_provider_credential() {
    with_env(&[("NEXUS_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(no_file(), true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "fail");
        assert_eq!(check(&report, "provider_readiness")["status"], "fail");
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS", "0")], || {
        let result = doctor::run(no_file(), false);
        assert_eq!(result.exit_code, 1);

        let lines: Vec<&str> = result.output.lines().collect();
        assert_eq!(lines[0], "doctor: one or more readiness checks failed");
        assert!(lines[1].starts_with("- [fail] config_validation:"));
        assert!(lines[2].starts_with("- [skip] database_connectivity:"));
        assert!(lines[3].starts_with("- [skip] provider_readiness:"));
        assert!(lines[4].starts_with("- [skip] registry_readiness:"));
    });
}

#[test]
fn config_attributes_sources_and_redacts_secrets() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("nexus.toml");
    fs::write(
        &path,
        r#"
[server]
port = 9100

[retry]
base_delay_ms = 50

[[providers]]
id = "mistral"
model = "mistral-large-latest"
"#,
    )
    .expect("write config");

    with_env(
        &[
            ("NEXUS_DATABASE_URL", "sqlite::memory:"),
            ("NEXUS_PROVIDER_GEMINI_API_KEY", GEMINI_KEY),
        ],
        || {
            let result = config::run(with_file(path.clone()));
            assert_eq!(result.exit_code, 0);
            assert!(!result.output.contains(GEMINI_KEY), "credentials must be redacted");

            let payload = parse_payload(&result.output);
            let file_source = format!("file ({})", path.display());

            let port = entry(&payload, "server.port");
            assert_eq!(port["value"], "9100");
            assert_eq!(port["source"], file_source.as_str());

            let database = entry(&payload, "database.url");
            assert_eq!(database["value"], "sqlite::memory:");
            assert_eq!(database["source"], "env (NEXUS_DATABASE_URL)");

            let model = entry(&payload, "providers.mistral.model");
            assert_eq!(model["value"], "mistral-large-latest");
            assert_eq!(model["source"], file_source.as_str());

            let key = entry(&payload, "providers.gemini.api_key");
            assert_eq!(key["value"], "gemi***");
            assert_eq!(key["source"], "env (NEXUS_PROVIDER_GEMINI_API_KEY)");

            assert_eq!(entry(&payload, "providers.mistral.api_key")["value"], "<unset>");
            assert_eq!(entry(&payload, "server.bind_address")["source"], "default");
        },
    );
}

#[test]
fn registries_prints_the_snapshot() {
    with_env(&[], || {
        let result = registries::run(no_file(), None);
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let data = &payload["data"];
        assert_eq!(data["open_source"]["tool_count"], 10);
        assert_eq!(data["open_source"]["available"], true);
        assert_eq!(data["cloud"]["available"], false);
        assert_eq!(data["cloud"]["tool_count"], 0);
        assert_eq!(data["default"]["tool_count"], 10);
    });
}

#[test]
fn registries_includes_cloud_tools_once_credentialed() {
    with_env(&[("NEXUS_REGISTRIES_CLOUD_API_KEY", "cloud-test-credential")], || {
        let result = registries::run(no_file(), Some("cloud"));
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let data = payload["data"].as_object().expect("registry map");
        assert_eq!(data.len(), 1);
        assert_eq!(data["cloud"]["available"], true);
        assert!(data["cloud"]["tool_count"].as_u64().unwrap_or_default() > 0);
    });
}

#[test]
fn registries_rejects_unknown_names() {
    with_env(&[], || {
        let result = registries::run(no_file(), Some("partner"));
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "registry_not_found");
    });
}

fn no_file() -> LoadOptions {
    LoadOptions {
        config_path: Some(PathBuf::from("does-not-exist/nexus.toml")),
        ..LoadOptions::default()
    }
}

fn with_file(path: PathBuf) -> LoadOptions {
    LoadOptions { config_path: Some(path), require_file: true, ..LoadOptions::default() }
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn check<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .unwrap_or_else(|| panic!("missing doctor check `{name}`"))
}

fn entry<'a>(payload: &'a Value, key: &str) -> &'a Value {
    payload["data"]
        .as_array()
        .and_then(|entries| entries.iter().find(|entry| entry["key"] == key))
        .unwrap_or_else(|| panic!("missing config entry `{key}`"))
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let mut keys: Vec<String> = [
        "NEXUS_DATABASE_URL",
        "NEXUS_DATABASE_MAX_CONNECTIONS",
        "NEXUS_DATABASE_TIMEOUT_SECS",
        "NEXUS_SERVER_BIND_ADDRESS",
        "NEXUS_SERVER_PORT",
        "NEXUS_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "NEXUS_LOGGING_LEVEL",
        "NEXUS_LOGGING_FORMAT",
        "NEXUS_LOG_LEVEL",
        "NEXUS_LOG_FORMAT",
        "NEXUS_RETRY_PRIMARY_MAX_ATTEMPTS",
        "NEXUS_RETRY_FALLBACK_MAX_ATTEMPTS",
        "NEXUS_RETRY_BASE_DELAY_MS",
        "NEXUS_REGISTRIES_CLOUD_API_KEY",
        "NEXUS_REGISTRIES_TOOL_GATEWAY_URL",
    ]
    .iter()
    .map(|key| key.to_string())
    .collect();
    for provider in ["GEMINI", "MISTRAL", "MISTRAL_DIRECT"] {
        for field in ["API_KEY", "BASE_URL", "MODEL"] {
            keys.push(format!("NEXUS_PROVIDER_{provider}_{field}"));
        }
    }

    let previous_values: Vec<(String, Option<String>)> =
        keys.iter().map(|key| (key.clone(), env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(&key, value);
        } else {
            env::remove_var(&key);
        }
    }
}
