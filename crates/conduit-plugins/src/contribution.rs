//! Declared capabilities a unit adds to the system.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionType {
    /// A callable tool with an input schema.
    Tool,
    /// A user-facing command.
    Command,
    /// An inbound webhook.
    Webhook,
    /// A configurable setting.
    Setting,
}

/// One declared capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Kind.
    #[serde(rename = "type")]
    pub contribution_type: ContributionType,
    /// Name, unique within its unit and kind.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Kind-specific payload (an input schema for tools).
    #[serde(default)]
    pub payload: Value,
}

impl Contribution {
    /// Create a contribution of any kind.
    #[must_use]
    pub fn new(
        contribution_type: ContributionType,
        name: impl Into<String>,
        description: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            contribution_type,
            name: name.into(),
            description: description.into(),
            payload,
        }
    }

    /// Tool contribution with an input schema.
    #[must_use]
    pub fn tool(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self::new(ContributionType::Tool, name, description, schema)
    }
}
