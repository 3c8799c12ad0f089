use nexus_agent::tools::ToolRegistrySelector;
use nexus_core::config::{AppConfig, LoadOptions};
use nexus_db::{connect_with_config, migrations, ping};
use serde::Serialize;

use crate::commands::{block_on, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub details: String,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub overall_status: CheckStatus,
    pub summary: String,
    pub checks: Vec<DoctorCheck>,
}

const CHECK_NAMES: [&str; 4] =
    ["config_validation", "database_connectivity", "provider_readiness", "registry_readiness"];

pub fn run(options: LoadOptions, json_output: bool) -> CommandResult {
    let report = build_report(options);
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            serde_json::json!({
                "overall_status": "fail",
                "summary": "doctor serialization failed",
                "error": error.to_string(),
            })
            .to_string()
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

pub fn build_report(options: LoadOptions) -> DoctorReport {
    let checks = match AppConfig::load(options) {
        Ok(config) => vec![
            DoctorCheck {
                name: CHECK_NAMES[0],
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            },
            check_database(&config),
            check_providers(&config),
            check_registries(&config),
        ],
        Err(error) => {
            let mut checks = vec![DoctorCheck {
                name: CHECK_NAMES[0],
                status: CheckStatus::Fail,
                details: error.to_string(),
            }];
            checks.extend(CHECK_NAMES[1..].iter().map(|&name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
            checks
        }
    };

    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);
    let (overall_status, summary) = if failed {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    } else if warned {
        (CheckStatus::Warn, "doctor: ready with warnings")
    } else {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let result = block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let probe = async {
            ping(&pool).await.map_err(|error| format!("database query failed: {error}"))?;
            migrations::run_pending(&pool)
                .await
                .map_err(|error| format!("ledger migrations failed: {error}"))
        }
        .await;
        pool.close().await;
        probe
    });

    match result {
        Ok(Ok(())) => DoctorCheck {
            name: CHECK_NAMES[1],
            status: CheckStatus::Pass,
            details: format!("connected using `{}` and ledger schema is current", config.database.url),
        },
        Ok(Err(details)) => DoctorCheck { name: CHECK_NAMES[1], status: CheckStatus::Fail, details },
        Err(error) => DoctorCheck {
            name: CHECK_NAMES[1],
            status: CheckStatus::Fail,
            details: format!("failed to initialize async runtime: {error}"),
        },
    }
}

fn check_providers(config: &AppConfig) -> DoctorCheck {
    let mut descriptors = config.provider_descriptors();
    descriptors.sort_by(|left, right| {
        left.priority.cmp(&right.priority).then_with(|| left.id.as_str().cmp(right.id.as_str()))
    });

    let (available, missing): (Vec<_>, Vec<_>) =
        descriptors.iter().partition(|descriptor| descriptor.available);
    let available: Vec<&str> = available.iter().map(|descriptor| descriptor.id.as_str()).collect();
    let missing: Vec<&str> = missing.iter().map(|descriptor| descriptor.id.as_str()).collect();

    if available.is_empty() {
        return DoctorCheck {
            name: CHECK_NAMES[2],
            status: CheckStatus::Fail,
            details: format!(
                "no provider has a credential configured (checked: {})",
                missing.join(", ")
            ),
        };
    }

    let mut details = format!("cascade order: {}", available.join(" -> "));
    if !missing.is_empty() {
        details.push_str(&format!("; missing credentials: {}", missing.join(", ")));
    }
    DoctorCheck { name: CHECK_NAMES[2], status: CheckStatus::Pass, details }
}

fn check_registries(config: &AppConfig) -> DoctorCheck {
    let snapshot = ToolRegistrySelector::new(config.registry_catalog()).snapshot();
    let registries = snapshot.registries();
    let summary: Vec<String> = registries
        .iter()
        .map(|registry| {
            if registry.available {
                format!("{}={} tools", registry.name, registry.tool_count())
            } else {
                format!("{}=unavailable", registry.name)
            }
        })
        .collect();

    let unavailable = registries.iter().any(|registry| !registry.available);
    let has_tools = registries.iter().any(|registry| registry.available && !registry.is_empty());
    let status = if !has_tools {
        CheckStatus::Fail
    } else if unavailable || config.registries.tool_gateway_url.is_none() {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };

    let mut details = summary.join(", ");
    if config.registries.tool_gateway_url.is_none() {
        details.push_str("; no tool gateway configured, tool calls will report errors");
    }
    DoctorCheck { name: CHECK_NAMES[3], status, details }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
