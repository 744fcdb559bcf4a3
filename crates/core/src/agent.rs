// Agent domain types
//
// An Agent is the user-owned definition a Run executes. A Run copies the
// AgentConfig at creation, so edits never reach a run in progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Placeholder replaced by the trigger input when rendering the first user message
pub const INPUT_PLACEHOLDER: &str = "{{input}}";

/// Model parameters passed to the provider on each turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ModelParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Execution configuration of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: String,
    /// Template for the first user message; `{{input}}` is replaced by the trigger input
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    /// Tool names the model may call. Anything else is an unknown tool.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub model: ModelParams,
    /// Upper bound on model turns; falls back to the runtime default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

fn default_prompt_template() -> String {
    INPUT_PLACEHOLDER.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            prompt_template: default_prompt_template(),
            allowed_tools: Vec::new(),
            model: ModelParams::default(),
            max_iterations: None,
        }
    }
}

impl AgentConfig {
    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == name)
    }

    /// Render the first user message for a run
    pub fn render_prompt(&self, input: Option<&str>) -> String {
        self.prompt_template
            .replace(INPUT_PLACEHOLDER, input.unwrap_or_default())
    }
}

/// Agent entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: AgentConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, config: AgentConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Request to create a new agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: AgentConfig,
}

impl From<CreateAgentRequest> for Agent {
    fn from(req: CreateAgentRequest) -> Self {
        let mut agent = Agent::new(req.name, req.config);
        agent.description = req.description;
        agent
    }
}
