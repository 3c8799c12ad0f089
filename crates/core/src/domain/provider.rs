use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static description of one language-model backend.
///
/// `available` is computed once from the configuration snapshot (credential present or not)
/// and never re-derived from the process environment at call time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub priority: u32,
    pub supports_tools: bool,
    pub supports_clarification: bool,
    pub available: bool,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: ProviderId::new(id),
            priority,
            supports_tools: true,
            supports_clarification: true,
            available: true,
        }
    }

    pub fn with_tools(mut self, supports_tools: bool) -> Self {
        self.supports_tools = supports_tools;
        self
    }

    pub fn with_clarification(mut self, supports_clarification: bool) -> Self {
        self.supports_clarification = supports_clarification;
        self
    }

    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }
}

/// Available descriptors in cascade order: ascending priority, id as tie-break.
pub fn priority_order(descriptors: &[ProviderDescriptor]) -> Vec<&ProviderDescriptor> {
    let mut ordered: Vec<&ProviderDescriptor> =
        descriptors.iter().filter(|descriptor| descriptor.available).collect();
    ordered.sort_by(|left, right| {
        left.priority.cmp(&right.priority).then_with(|| left.id.cmp(&right.id))
    });
    ordered
}
