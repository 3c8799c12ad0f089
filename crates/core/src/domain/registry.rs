use serde::{Deserialize, Serialize};

pub const OPEN_SOURCE_REGISTRY: &str = "open_source";
pub const CLOUD_REGISTRY: &str = "cloud";
pub const DEFAULT_REGISTRY: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    SearchWeb,
    Productivity,
    Information,
    FileManagement,
    Calculation,
    ImageVision,
    Utility,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchWeb => "search_web",
            Self::Productivity => "productivity",
            Self::Information => "information",
            Self::FileManagement => "file_management",
            Self::Calculation => "calculation",
            Self::ImageVision => "image_vision",
            Self::Utility => "utility",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SearchWeb => "Search & Web",
            Self::Productivity => "Productivity",
            Self::Information => "Information",
            Self::FileManagement => "File Management",
            Self::Calculation => "Calculation",
            Self::ImageVision => "Image & Vision",
            Self::Utility => "Utility",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "search_web" => Some(Self::SearchWeb),
            "productivity" => Some(Self::Productivity),
            "information" => Some(Self::Information),
            "file_management" => Some(Self::FileManagement),
            "calculation" => Some(Self::Calculation),
            "image_vision" => Some(Self::ImageVision),
            "utility" => Some(Self::Utility),
            _ => None,
        }
    }

    /// Keyword-based category for catalogs that do not declare one. First match wins.
    pub fn infer(tool_name: &str) -> Self {
        let name = tool_name.to_ascii_lowercase();
        let has = |keywords: &[&str]| keywords.iter().any(|keyword| name.contains(keyword));

        if has(&["search", "web", "crawl"]) {
            Self::SearchWeb
        } else if has(&["calendar", "gmail", "slack", "docs"]) {
            Self::Productivity
        } else if has(&["weather", "map"]) {
            Self::Information
        } else if has(&["file", "document", "pdf", "drive"]) {
            Self::FileManagement
        } else if has(&["calculator", "math"]) {
            Self::Calculation
        } else if has(&["image", "vision"]) {
            Self::ImageVision
        } else {
            Self::Utility
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub display_name: String,
    pub category: ToolCategory,
    pub description: String,
}

impl ToolDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let category = ToolCategory::infer(&id);
        Self { id, display_name: display_name.into(), category, description: description.into() }
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }
}

/// Named, read-only set of invocable tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRegistry {
    pub name: String,
    pub tools: Vec<ToolDescriptor>,
    pub available: bool,
}

impl ToolRegistry {
    pub fn new(name: impl Into<String>, tools: Vec<ToolDescriptor>) -> Self {
        Self { name: name.into(), tools, available: true }
    }

    /// Registry that exists but cannot be used (e.g. a missing credential).
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self { name: name.into(), tools: Vec::new(), available: false }
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.iter().any(|tool| tool.id == tool_id)
    }

    pub fn tool(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.id == tool_id)
    }
}

/// Ordered set of concrete registries. Order decides which duplicate wins in `default`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCatalog {
    pub registries: Vec<ToolRegistry>,
}

impl RegistryCatalog {
    pub fn new(registries: Vec<ToolRegistry>) -> Self {
        Self { registries }
    }

    pub fn get(&self, name: &str) -> Option<&ToolRegistry> {
        self.registries.iter().find(|registry| registry.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.registries.iter().map(|registry| registry.name.as_str()).collect()
    }

    /// Union of every available registry, deduplicated by tool id (first occurrence wins).
    pub fn union_of_available(&self) -> ToolRegistry {
        let mut tools: Vec<ToolDescriptor> = Vec::new();
        for registry in self.registries.iter().filter(|registry| registry.available) {
            for tool in &registry.tools {
                if !tools.iter().any(|existing| existing.id == tool.id) {
                    tools.push(tool.clone());
                }
            }
        }
        ToolRegistry::new(DEFAULT_REGISTRY, tools)
    }
}

pub fn builtin_open_source_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "calculator_tool",
            "Calculator",
            "Evaluates arithmetic expressions and returns the numeric result.",
        ),
        ToolDescriptor::new(
            "search_tool",
            "Web Search",
            "Searches the public web and returns ranked result snippets.",
        ),
        ToolDescriptor::new(
            "weather_tool",
            "Weather",
            "Returns current conditions and a short forecast for a city.",
        ),
        ToolDescriptor::new(
            "llm_tool",
            "Language Model",
            "Answers general questions and transforms text with a language model.",
        )
        .with_category(ToolCategory::Utility),
        ToolDescriptor::new(
            "file_reader_tool",
            "File Reader",
            "Reads the contents of a local file.",
        ),
        ToolDescriptor::new(
            "file_writer_tool",
            "File Writer",
            "Writes content to a local file, creating it when missing.",
        ),
        ToolDescriptor::new(
            "image_understanding_tool",
            "Image Understanding",
            "Describes and answers questions about an image.",
        ),
        ToolDescriptor::new(
            "crawl_tool",
            "Web Crawler",
            "Crawls a website starting from a URL and returns discovered pages.",
        ),
        ToolDescriptor::new(
            "extract_tool",
            "Content Extractor",
            "Extracts the readable content of one or more web pages.",
        )
        .with_category(ToolCategory::SearchWeb),
        ToolDescriptor::new(
            "map_tool",
            "Site Map",
            "Maps the structure of a website and lists its URLs.",
        )
        .with_category(ToolCategory::SearchWeb),
    ]
}

pub fn builtin_cloud_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "portia:google:gmail:send_email",
            "Gmail: Send Email",
            "Sends an email from the user's Gmail account. Requires OAuth consent.",
        ),
        ToolDescriptor::new(
            "portia:google:gmail:search_email",
            "Gmail: Search Email",
            "Searches the user's Gmail inbox. Requires OAuth consent.",
        ),
        ToolDescriptor::new(
            "portia:google:gcalendar:create_event",
            "Google Calendar: Create Event",
            "Creates a calendar event. Requires OAuth consent.",
        ),
        ToolDescriptor::new(
            "portia:google:gcalendar:check_availability",
            "Google Calendar: Check Availability",
            "Checks free/busy slots on the user's calendar. Requires OAuth consent.",
        ),
        ToolDescriptor::new(
            "portia:google:gdrive:search",
            "Google Drive: Search",
            "Searches files in the user's Google Drive. Requires OAuth consent.",
        ),
        ToolDescriptor::new(
            "portia:google:docs:get_document",
            "Google Docs: Get Document",
            "Fetches the content of a Google Doc. Requires OAuth consent.",
        ),
        ToolDescriptor::new(
            "portia:slack:bot:send_message",
            "Slack: Send Message",
            "Posts a message to a Slack channel or user.",
        ),
        ToolDescriptor::new(
            "portia:github:user:search_repos",
            "GitHub: Search Repositories",
            "Searches GitHub repositories visible to the user.",
        )
        .with_category(ToolCategory::SearchWeb),
    ]
}
