use nexus_agent::tools::ToolRegistrySelector;
use nexus_core::config::{AppConfig, LoadOptions};
use nexus_core::domain::registry::ToolRegistry;
use serde_json::{json, Map, Value};

use crate::commands::CommandResult;

/// Prints the registry snapshot the server would start with, optionally narrowed to one name.
pub fn run(options: LoadOptions, only: Option<&str>) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "registries",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let selector = ToolRegistrySelector::new(config.registry_catalog());
    let registries = match only {
        Some(name) => match selector.resolve(name) {
            Ok(registry) => vec![registry],
            Err(error) => {
                return CommandResult::failure("registries", "registry_not_found", error.to_string(), 6);
            }
        },
        None => selector.snapshot().registries(),
    };

    let mut data = Map::new();
    for registry in &registries {
        data.insert(registry.name.clone(), registry_json(registry));
    }

    let message = match only {
        Some(name) => format!("registry `{name}` resolved"),
        None => format!("{} registries in snapshot", registries.len()),
    };
    CommandResult::success_with_data("registries", message, Value::Object(data))
}

fn registry_json(registry: &ToolRegistry) -> Value {
    let tools: Vec<Value> = registry
        .tools
        .iter()
        .map(|tool| {
            json!({
                "id": tool.id,
                "name": tool.display_name,
                "category": tool.category.label(),
                "description": tool.description,
            })
        })
        .collect();

    json!({
        "tool_count": registry.tool_count(),
        "available": registry.available,
        "tools": tools,
    })
}
