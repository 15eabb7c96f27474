//! HTTP API for chat-completion serving
//!
//! OpenAI-compatible endpoints over axum:
//!
//! - `GET /` - redirect to `/index.html`
//! - `GET /health` - health check
//! - `GET /metrics` - Prometheus-formatted metrics
//! - `POST /v1/chat/completions` - chat completion (JSON or SSE stream)
//! - `GET /<path>` - static files from the configured web root
//!
//! ## Example
//!
//! ```rust,ignore
//! use servir::api::{create_router, AppState};
//!
//! let state = AppState::demo();
//! let app = create_router(state);
//! axum::serve(listener, app).await?;
//! ```

use std::sync::{Arc, Mutex};

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::{
    chat_template::{detect_template, ChatMessage, ChatTemplate},
    config::Options,
    mcp::McpState,
    metrics::MetricsCollector,
    model::LanguageModel,
    orchestrator::now_epoch_ms,
    tokenizer::UnigramTokenizer,
    tools::{make_builtin_router, make_builtin_tools, BuiltinRouter},
};

mod openai_handlers;

pub use openai_handlers::chat_completions_handler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The model behind the access gate; one request generates at a time
    pub(crate) model: Arc<Mutex<Box<dyn LanguageModel>>>,
    /// Tokenizer for usage accounting; the model tokenizes internally
    pub(crate) tokenizer: Option<Arc<UnigramTokenizer>>,
    /// Prompt renderer for the loaded model family
    pub(crate) template: Arc<dyn ChatTemplate>,
    /// Builtin tool schemas offered to the model; empty when disabled
    pub(crate) builtin_tools: Arc<Vec<Value>>,
    /// Builtin tool handlers; `None` when disabled
    pub(crate) builtin_router: Option<Arc<BuiltinRouter>>,
    /// External tool server state
    pub(crate) mcp: Arc<McpState>,
    /// Serializes external tool calls
    pub(crate) mcp_mutex: Arc<Mutex<()>>,
    /// Request metrics
    pub(crate) metrics: Arc<MetricsCollector>,
    /// Server options
    pub(crate) options: Arc<Options>,
}

impl AppState {
    /// Build state around a model and options, with no external tool
    /// server.
    #[must_use]
    pub fn new(model: Box<dyn LanguageModel>, options: Options) -> Self {
        let (builtin_tools, builtin_router) = if options.enable_builtin_tools {
            (make_builtin_tools(), Some(Arc::new(make_builtin_router())))
        } else {
            (Vec::new(), None)
        };

        Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: None,
            template: Arc::from(detect_template("qwen3")),
            builtin_tools: Arc::new(builtin_tools),
            builtin_router,
            mcp: Arc::new(McpState::default()),
            mcp_mutex: Arc::new(Mutex::new(())),
            metrics: Arc::new(MetricsCollector::new()),
            options: Arc::new(options),
        }
    }

    /// Replace the external tool server state.
    #[must_use]
    pub fn with_mcp(mut self, mcp: McpState) -> Self {
        self.mcp = Arc::new(mcp);
        self
    }

    /// Attach a tokenizer for usage accounting.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: UnigramTokenizer) -> Self {
        self.tokenizer = Some(Arc::new(tokenizer));
        self
    }

    /// Replace the prompt template.
    #[must_use]
    pub fn with_template(mut self, template: Box<dyn ChatTemplate>) -> Self {
        self.template = Arc::from(template);
        self
    }

    /// Demo state backed by the deterministic demo model.
    #[must_use]
    pub fn demo() -> Self {
        Self::new(
            Box::new(crate::model::DemoModel::new()),
            Options::default(),
        )
    }
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    let web_root = state.options.web_root.clone();
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

/// `GET /` redirects to the demo page.
async fn root_handler() -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, "/index.html")],
    )
        .into_response()
}

/// `GET /health`
async fn health_handler() -> Json<Value> {
    Json(json!({"ok": true}))
}

/// `GET /metrics` in Prometheus text format.
async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> String {
    state.metrics.to_prometheus()
}

// ============================================================================
// Error envelope
// ============================================================================

/// Structured error response: `{"error":{"code":<int>,"message":<string>}}`
/// with a matching HTTP status.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status code
    pub code: u16,
    /// Human-readable message
    pub message: String,
}

impl ApiError {
    /// Client error (400).
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            message: message.into(),
        }
    }

    /// Server error (500).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(json!({"error": {"code": self.code, "message": self.message}})),
        )
            .into_response()
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Tool handling mode for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Run tool calls locally and feed results back to the model
    #[default]
    Execute,
    /// Return tool calls to the client without executing
    Emit,
}

fn default_model_name() -> String {
    "qwen3-0.6b".to_string()
}

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model name echoed in the response
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Conversation; must be non-empty
    pub messages: Vec<ChatMessage>,
    /// Client-supplied tool catalog
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    /// Stream tokens over SSE
    #[serde(default)]
    pub stream: bool,
    /// Maximum new tokens
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling threshold
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Top-k cutoff
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Repetition penalty
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    /// Beam width
    #[serde(default)]
    pub beam_size: Option<usize>,
    /// Explicit sampling switch; derived from temperature when absent
    #[serde(default)]
    pub do_sample: Option<bool>,
    /// Let the model open a reasoning section
    #[serde(default)]
    pub enable_thinking: bool,
    /// Execute tool calls or emit them to the client
    #[serde(default)]
    pub tool_mode: ToolMode,
    /// Image delivery policy for image-generating tools
    #[serde(default)]
    pub mcp_image_delivery: Option<String>,
    /// Verbose decode logging
    #[serde(default)]
    pub debug: bool,
}

/// Assistant message in a non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Always "assistant"
    pub role: String,
    /// Generated text; empty when tool calls were emitted
    pub content: String,
    /// Emitted tool calls, OpenAI-shaped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    /// Choice index
    pub index: usize,
    /// Generated message
    pub message: ResponseMessage,
    /// "stop", "length" or "tool_calls"
    pub finish_reason: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: usize,
    /// Completion tokens
    pub completion_tokens: usize,
    /// Total tokens
    pub total_tokens: usize,
}

/// Non-streaming `chat.completion` response with servir extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Request id
    pub id: String,
    /// Always "chat.completion"
    pub object: String,
    /// Creation timestamp (Unix seconds)
    pub created: i64,
    /// Model name from the request
    pub model: String,
    /// Completion choices (always exactly one)
    pub choices: Vec<ChatChoice>,
    /// Token usage
    pub usage: Usage,
    /// Emitted tool calls (emit mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    /// Collected image artifacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    /// Names of dispatched tools, in order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_trace: Option<Value>,
    /// Full tool dispatch records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_history: Option<Value>,
}

/// Delta payload inside a streaming chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    /// Role, present in the first chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Streaming choice with delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunkChoice {
    /// Choice index
    pub index: usize,
    /// Partial message
    pub delta: ChatDelta,
    /// Set only on the terminal chunk
    pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` SSE frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Request id
    pub id: String,
    /// Always "chat.completion.chunk"
    pub object: String,
    /// Creation timestamp (Unix seconds)
    pub created: i64,
    /// Model name from the request
    pub model: String,
    /// Choices with deltas
    pub choices: Vec<ChatChunkChoice>,
    /// Tool name announced before its dependent tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_trace_line: Option<String>,
    /// Emitted tool calls, on the terminal chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    /// Collected artifacts, on the terminal chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    /// Tool dispatch records, on the terminal chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_history: Option<Value>,
}

impl ChatCompletionChunk {
    fn base(id: &str, model: &str, delta: ChatDelta, finish_reason: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: unix_timestamp(),
            model: model.to_string(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            tool_trace_line: None,
            tool_calls: None,
            artifacts: None,
            tool_history: None,
        }
    }

    /// First chunk carrying only the assistant role.
    #[must_use]
    pub fn initial(id: &str, model: &str) -> Self {
        Self::base(
            id,
            model,
            ChatDelta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        )
    }

    /// Content chunk for one token.
    #[must_use]
    pub fn content(id: &str, model: &str, text: &str) -> Self {
        Self::base(
            id,
            model,
            ChatDelta {
                role: Some("assistant".to_string()),
                content: Some(text.to_string()),
            },
            None,
        )
    }

    /// Trace-only chunk announcing a tool dispatch.
    #[must_use]
    pub fn trace(id: &str, model: &str, line: &str) -> Self {
        let mut chunk = Self::base(id, model, ChatDelta::default(), None);
        chunk.tool_trace_line = Some(line.to_string());
        chunk
    }

    /// Terminal chunk with the finish reason.
    #[must_use]
    pub fn done(id: &str, model: &str, finish_reason: &str) -> Self {
        Self::base(id, model, ChatDelta::default(), Some(finish_reason.to_string()))
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Current Unix timestamp in seconds.
#[must_use]
pub(crate) fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fresh response id.
#[must_use]
pub(crate) fn make_response_id() -> String {
    format!("chatcmpl-{}", now_epoch_ms())
}

/// Convert collected directives to the OpenAI `tool_calls` array.
#[must_use]
pub(crate) fn format_tool_calls(resp_id: &str, calls: &[Value]) -> Value {
    let out: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(i, call)| {
            json!({
                "id": format!("call-{resp_id}-{i}"),
                "type": "function",
                "function": {
                    "name": call.get("name").cloned().unwrap_or(Value::String(String::new())),
                    "arguments": call.get("arguments").cloned().unwrap_or_else(|| json!({})),
                }
            })
        })
        .collect();
    Value::Array(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_shapes() {
        let initial = ChatCompletionChunk::initial("id1", "m");
        assert_eq!(initial.choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(initial.choices[0].delta.content.is_none());
        assert!(initial.choices[0].finish_reason.is_none());

        let content = ChatCompletionChunk::content("id1", "m", "hi");
        assert_eq!(content.choices[0].delta.content.as_deref(), Some("hi"));

        let trace = ChatCompletionChunk::trace("id1", "m", "add");
        assert_eq!(trace.tool_trace_line.as_deref(), Some("add"));
        assert!(trace.choices[0].delta.content.is_none());

        let done = ChatCompletionChunk::done("id1", "m", "stop");
        assert_eq!(done.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_chunk_serialization_omits_empty_extras() {
        let chunk = ChatCompletionChunk::content("id1", "m", "x");
        let text = serde_json::to_string(&chunk).unwrap();
        assert!(!text.contains("tool_trace_line"));
        assert!(!text.contains("artifacts"));
        assert_eq!(chunk.object, "chat.completion.chunk");
    }

    #[test]
    fn test_format_tool_calls() {
        let calls = vec![json!({"name": "add", "arguments": {"a": 1}})];
        let out = format_tool_calls("r1", &calls);
        assert_eq!(out[0]["id"], "call-r1-0");
        assert_eq!(out[0]["type"], "function");
        assert_eq!(out[0]["function"]["name"], "add");
        assert_eq!(out[0]["function"]["arguments"]["a"], 1);
    }

    #[test]
    fn test_api_error_envelope() {
        let err = ApiError::bad_request("nope");
        assert_eq!(err.code, 400);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_tool_mode_parsing() {
        let req: ChatCompletionRequest =
            serde_json::from_value(json!({"messages": [], "tool_mode": "emit"})).unwrap();
        assert_eq!(req.tool_mode, ToolMode::Emit);

        let req: ChatCompletionRequest =
            serde_json::from_value(json!({"messages": []})).unwrap();
        assert_eq!(req.tool_mode, ToolMode::Execute);
        assert_eq!(req.model, "qwen3-0.6b");
        assert!(!req.stream);
    }
}
