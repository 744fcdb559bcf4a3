// Built-in tools
//
// Small, deterministic tools registered by default. Their contracts are
// published in contracts/tools.yaml.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolExecutionResult};

// ============================================================================
// Search
// ============================================================================

/// One document of the search corpus
#[derive(Debug, Clone, Serialize)]
pub struct SearchDocument {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl SearchDocument {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
        }
    }
}

/// Keyword search over an in-process corpus
///
/// Scores are the fraction of query terms found in a document's title or
/// snippet; ties keep corpus order.
pub struct SearchTool {
    corpus: Vec<SearchDocument>,
}

impl SearchTool {
    pub const DEFAULT_LIMIT: usize = 5;

    pub fn new() -> Self {
        Self::with_corpus(default_corpus())
    }

    pub fn with_corpus(corpus: Vec<SearchDocument>) -> Self {
        Self { corpus }
    }

    fn search(&self, query: &str, limit: usize) -> Vec<Value> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, &SearchDocument)> = self
            .corpus
            .iter()
            .filter_map(|doc| {
                let haystack = format!("{} {}", doc.title, doc.snippet).to_lowercase();
                let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (hits > 0).then(|| (hits as f64 / terms.len() as f64, doc))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| {
                json!({
                    "title": doc.title,
                    "url": doc.url,
                    "snippet": doc.snippet,
                    "score": score,
                })
            })
            .collect()
    }
}

impl Default for SearchTool {
    fn default() -> Self {
        Self::new()
    }
}

fn default_corpus() -> Vec<SearchDocument> {
    vec![
        SearchDocument::new(
            "Cron expressions",
            "https://docs.runloop.dev/schedules/cron",
            "Schedules use five-field cron expressions evaluated in UTC.",
        ),
        SearchDocument::new(
            "Run lifecycle",
            "https://docs.runloop.dev/runs/lifecycle",
            "A run moves from queued to running and ends completed, failed or cancelled.",
        ),
        SearchDocument::new(
            "Tool contracts",
            "https://docs.runloop.dev/tools/contracts",
            "Every tool declares versioned JSON Schema contracts for its input and output.",
        ),
        SearchDocument::new(
            "Streaming events",
            "https://docs.runloop.dev/events/streaming",
            "Subscribe over WebSocket to receive run events in sequence order with replay.",
        ),
        SearchDocument::new(
            "Retry policy",
            "https://docs.runloop.dev/providers/retries",
            "Transient model provider errors are retried with exponential backoff and jitter.",
        ),
        SearchDocument::new(
            "Cost tracking",
            "https://docs.runloop.dev/runs/cost",
            "Token usage is priced per model; missing usage is reported as unknown cost.",
        ),
    ]
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the documentation corpus and return the best matching documents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Search terms"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 10,
                    "description": "Maximum number of results (default 5)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "url": { "type": "string" },
                            "snippet": { "type": "string" },
                            "score": { "type": "number" }
                        },
                        "required": ["title", "url", "snippet", "score"]
                    }
                },
                "total": { "type": "integer", "minimum": 0 }
            },
            "required": ["query", "results", "total"]
        })
    }

    async fn invoke(&self, input: Value) -> ToolExecutionResult {
        let Some(query) = input.get("query").and_then(Value::as_str) else {
            return ToolExecutionResult::tool_error("query is required");
        };
        let limit = input
            .get("limit")
            .and_then(Value::as_u64)
            .map_or(Self::DEFAULT_LIMIT, |l| l as usize);

        let results = self.search(query, limit);
        ToolExecutionResult::success(json!({
            "query": query,
            "total": results.len(),
            "results": results,
        }))
    }
}

// ============================================================================
// Echo
// ============================================================================

/// Returns its message unchanged
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the provided message."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Message to echo" }
            },
            "required": ["message"],
            "additionalProperties": false
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" }
            },
            "required": ["message"]
        })
    }

    async fn invoke(&self, input: Value) -> ToolExecutionResult {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        ToolExecutionResult::success(json!({ "message": message }))
    }
}

// ============================================================================
// Time
// ============================================================================

/// Current UTC time in one of three formats
pub struct GetCurrentTimeTool;

#[async_trait]
impl Tool for GetCurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "enum": ["iso8601", "unix", "human"],
                    "description": "Output format (default iso8601)"
                }
            },
            "additionalProperties": false
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "datetime": { "type": "string" },
                "timestamp": { "type": "integer" },
                "format": { "type": "string" },
                "timezone": { "type": "string" }
            },
            "required": ["format", "timezone"]
        })
    }

    async fn invoke(&self, input: Value) -> ToolExecutionResult {
        let format = input
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("iso8601");
        let now = chrono::Utc::now();

        let result = match format {
            "unix" => json!({
                "timestamp": now.timestamp(),
                "format": "unix",
                "timezone": "UTC"
            }),
            "human" => json!({
                "datetime": now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string(),
                "format": "human",
                "timezone": "UTC"
            }),
            _ => json!({
                "datetime": now.to_rfc3339(),
                "format": "iso8601",
                "timezone": "UTC"
            }),
        };
        ToolExecutionResult::success(result)
    }
}

// ============================================================================
// Math
// ============================================================================

/// Adds two numbers
pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers together and return the result."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "description": "The first number" },
                "b": { "type": "number", "description": "The second number" }
            },
            "required": ["a", "b"],
            "additionalProperties": false
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "result": { "type": "number" }
            },
            "required": ["result"]
        })
    }

    async fn invoke(&self, input: Value) -> ToolExecutionResult {
        let a = input.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = input.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        ToolExecutionResult::success(json!({ "result": a + b }))
    }
}
