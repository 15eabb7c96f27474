//! OpenAI-compatible chat completion handler and streaming driver
//!
//! The handler validates and normalizes the request, merges the tool
//! catalog, renders the prompt, then generates under the model access
//! gate. Generation is synchronous and runs in `spawn_blocking`; the
//! streaming path feeds tokens and tool-trace lines through a bounded
//! channel into an SSE stream.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    format_tool_calls, make_response_id, unix_timestamp, ApiError, AppState, ChatChoice,
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ResponseMessage, ToolMode,
    Usage,
};
use crate::chat_template::ChatMessage;
use crate::error::ServirError;
use crate::model::{DoSample, GenerateConfig};
use crate::orchestrator::{ImageDelivery, ToolContext, ToolOrchestrator};
use crate::tools::{merge_tools_by_name, tool_name_from_schema};
use crate::utf8::sanitize_utf8;

/// Events flowing from the generation thread to the SSE writer.
enum StreamEvent {
    /// One sanitized token of assistant text
    Token(String),
    /// A tool name, announced at dispatch start
    Trace(String),
    /// Generation failed; closes the stream after an error frame
    Failed(String),
}

/// Install the per-request tool callbacks on the generation config.
///
/// With a `trace_tx`, the callbacks first push the tool name into the
/// stream so clients see tool activity before any dependent tokens.
fn attach_tool_callbacks(
    cfg: &mut GenerateConfig,
    emit_mode: bool,
    orchestrator: Option<Arc<ToolOrchestrator>>,
    ctx: Arc<ToolContext>,
    trace_tx: Option<tokio::sync::mpsc::Sender<StreamEvent>>,
) {
    let send_trace = move |call: &Value| {
        if let Some(tx) = &trace_tx {
            if let Some(name) = call.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    let _ = tx.blocking_send(StreamEvent::Trace(name.to_string()));
                }
            }
        }
    };

    if emit_mode {
        cfg.return_tool_calls = true;
        cfg.on_tool_call = Some(Arc::new(move |call: &Value| {
            send_trace(call);
            ctx.push_tool_call(call);
        }));
    } else if let Some(orch) = orchestrator {
        cfg.tool_callback = Some(Arc::new(move |call: &Value| {
            send_trace(call);
            orch.dispatch(&ctx, call)
        }));
    }
}

/// `POST /v1/chat/completions`
pub async fn chat_completions_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let start = Instant::now();

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            state.metrics.record_failure();
            return ApiError::bad_request(format!("Invalid JSON: {e}")).into_response();
        }
    };
    if !raw.get("messages").is_some_and(Value::is_array) {
        state.metrics.record_failure();
        return ApiError::bad_request("`messages` must be an array").into_response();
    }
    let request: ChatCompletionRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            state.metrics.record_failure();
            return ApiError::bad_request(format!("Invalid request: {e}")).into_response();
        }
    };
    if request.messages.is_empty() {
        state.metrics.record_failure();
        return ApiError::bad_request("`messages` must be a non-empty array").into_response();
    }

    let mut messages = request.messages.clone();
    if messages[0].role != "system" {
        messages.insert(0, ChatMessage::system("You are a helpful assistant."));
    }

    // Merge the tool catalog: client tools first, then builtins, then the
    // external server's tools (which replace nothing, only fill gaps).
    let mut tools: Vec<Value> = request
        .tools
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(Value::is_object)
        .collect();
    if !state.builtin_tools.is_empty() {
        tools = merge_tools_by_name(tools, &state.builtin_tools);
    }
    if !state.mcp.openai_tools.is_empty() && state.options.mcp_merge_tools {
        tools = merge_tools_by_name(tools, &state.mcp.openai_tools);
    } else if !state.mcp.openai_tools.is_empty() && tools.is_empty() {
        tools = state.mcp.openai_tools.clone();
    }

    // Only names actually offered in the prompt are eligible for external
    // dispatch.
    let allowed: HashSet<String> = tools
        .iter()
        .filter_map(tool_name_from_schema)
        .filter(|name| state.mcp.tool_names.contains(*name))
        .map(str::to_string)
        .collect();

    let mut cfg = GenerateConfig::default();
    if let Some(v) = request.max_tokens {
        cfg.max_new_tokens = v;
    }
    if let Some(v) = request.temperature {
        cfg.temperature = v;
    }
    if let Some(v) = request.top_p {
        cfg.top_p = v;
    }
    if let Some(v) = request.top_k {
        cfg.top_k = v;
    }
    if let Some(v) = request.repetition_penalty {
        cfg.repetition_penalty = v;
    }
    if let Some(v) = request.beam_size {
        cfg.beam_size = v;
    }
    cfg.debug = request.debug;
    cfg.do_sample = match request.do_sample {
        Some(true) => DoSample::On,
        Some(false) => DoSample::Off,
        None if cfg.temperature <= 0.0 => DoSample::Off,
        None => DoSample::Auto,
    };

    info!(
        model = %request.model,
        stream = request.stream,
        thinking = request.enable_thinking,
        tools = tools.len(),
        allowed = allowed.len(),
        "chat completion request"
    );

    let image_delivery = request
        .mcp_image_delivery
        .as_deref()
        .map_or(ImageDelivery::File, ImageDelivery::parse);

    let ctx = ToolContext::new();
    let emit_mode = request.tool_mode == ToolMode::Emit && !tools.is_empty();
    let orchestrator = (!emit_mode && !tools.is_empty()).then(|| {
        Arc::new(ToolOrchestrator::new(
            state.builtin_router.clone(),
            state.mcp.client.clone(),
            state.mcp_mutex.clone(),
            allowed,
            image_delivery,
            state.options.image_tools.clone(),
            state.options.mcp_max_string_bytes_in_prompt,
            state.options.web_root.clone(),
        ))
    });

    let prompt = match state
        .template
        .render(&messages, &tools, true, request.enable_thinking)
    {
        Ok(p) => p,
        Err(e) => {
            state.metrics.record_failure();
            return ApiError::internal(format!("template render failed: {e}")).into_response();
        }
    };
    debug!(bytes = prompt.len(), "prompt rendered");

    let resp_id = make_response_id();
    let model_name = request.model.clone();

    if request.stream {
        stream_response(
            state, model_name, prompt, cfg, ctx, orchestrator, emit_mode, resp_id, start,
        )
    } else {
        blocking_response(
            state, model_name, prompt, cfg, ctx, orchestrator, emit_mode, resp_id, start,
        )
        .await
    }
}

/// Non-streaming path: generate to completion, then serialize one JSON
/// response.
#[allow(clippy::too_many_arguments)]
async fn blocking_response(
    state: AppState,
    model_name: String,
    prompt: String,
    mut cfg: GenerateConfig,
    ctx: Arc<ToolContext>,
    orchestrator: Option<Arc<ToolOrchestrator>>,
    emit_mode: bool,
    resp_id: String,
    start: Instant,
) -> Response {
    attach_tool_callbacks(&mut cfg, emit_mode, orchestrator, ctx.clone(), None);

    let prompt_tokens = state
        .tokenizer
        .as_ref()
        .map_or(0, |t| t.encode(&prompt, true, false, false, false).len());

    let model = state.model.clone();
    let generated = tokio::task::spawn_blocking(move || -> Result<(String, usize), ServirError> {
        let mut guard = model.lock().map_err(|_| ServirError::Internal {
            reason: "model gate poisoned".to_string(),
        })?;
        let gen_ctx = guard.prefill(&prompt)?;
        let mut text = String::new();
        let mut tokens = 0usize;
        guard.generate(gen_ctx, &cfg, &mut |tok| {
            text.push_str(&sanitize_utf8(tok));
            tokens += 1;
            true
        })?;
        Ok((text, tokens))
    })
    .await;

    let (text, completion_tokens) = match generated {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            state.metrics.record_failure();
            return ApiError::internal(e.to_string()).into_response();
        }
        Err(e) => {
            state.metrics.record_failure();
            return ApiError::internal(format!("generation task failed: {e}")).into_response();
        }
    };

    let usage = Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    };

    let tool_calls = ctx.tool_calls();
    if !tool_calls.is_empty() {
        let formatted = format_tool_calls(&resp_id, &tool_calls);
        let trace = ctx.trace();
        state.metrics.record_success(completion_tokens, start.elapsed());
        return Json(ChatCompletionResponse {
            id: resp_id,
            object: "chat.completion".to_string(),
            created: unix_timestamp(),
            model: model_name,
            choices: vec![ChatChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: String::new(),
                    tool_calls: Some(formatted.clone()),
                },
                finish_reason: "tool_calls".to_string(),
            }],
            usage,
            tool_calls: Some(formatted),
            artifacts: None,
            tool_trace: (!trace.is_empty()).then(|| json!(trace)),
            tool_history: None,
        })
        .into_response();
    }

    let artifacts = ctx.artifacts();
    let trace = ctx.trace();
    let history = ctx.history();
    state.metrics.record_success(completion_tokens, start.elapsed());

    Json(ChatCompletionResponse {
        id: resp_id,
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: model_name,
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: text,
                tool_calls: None,
            },
            finish_reason: "stop".to_string(),
        }],
        usage,
        tool_calls: None,
        artifacts: (!artifacts.is_empty()).then(|| Value::Array(artifacts)),
        tool_trace: (!trace.is_empty()).then(|| json!(trace)),
        tool_history: (!history.is_empty()).then(|| Value::Array(history)),
    })
    .into_response()
}

/// Streaming path: SSE frames in strict generation order.
///
/// Generation holds the model gate inside `spawn_blocking`; tokens and
/// trace lines flow through a bounded channel. A failed send means the
/// client is gone, which stops generation and releases the gate.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: AppState,
    model_name: String,
    prompt: String,
    mut cfg: GenerateConfig,
    ctx: Arc<ToolContext>,
    orchestrator: Option<Arc<ToolOrchestrator>>,
    emit_mode: bool,
    resp_id: String,
    start: Instant,
) -> Response {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamEvent>(16);
    attach_tool_callbacks(&mut cfg, emit_mode, orchestrator, ctx.clone(), Some(tx.clone()));

    let model = state.model.clone();
    tokio::task::spawn_blocking(move || {
        let Ok(mut guard) = model.lock() else {
            let _ = tx.blocking_send(StreamEvent::Failed("model gate poisoned".to_string()));
            return;
        };
        let gen_ctx = match guard.prefill(&prompt) {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.blocking_send(StreamEvent::Failed(e.to_string()));
                return;
            }
        };
        let result = guard.generate(gen_ctx, &cfg, &mut |tok| {
            tx.blocking_send(StreamEvent::Token(sanitize_utf8(tok))).is_ok()
        });
        if let Err(e) = result {
            let _ = tx.blocking_send(StreamEvent::Failed(e.to_string()));
        }
        // tx (and the clones inside cfg) drop here, closing the channel.
    });

    let metrics = state.metrics.clone();
    let stream = async_stream::stream! {
        let frame = |chunk: &ChatCompletionChunk| {
            Event::default().data(serde_json::to_string(chunk).unwrap_or_default())
        };

        yield Ok::<_, Infallible>(frame(&ChatCompletionChunk::initial(&resp_id, &model_name)));

        let mut completion_tokens = 0usize;
        let mut failed = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(text) => {
                    completion_tokens += 1;
                    yield Ok(frame(&ChatCompletionChunk::content(&resp_id, &model_name, &text)));
                }
                StreamEvent::Trace(line) => {
                    yield Ok(frame(&ChatCompletionChunk::trace(&resp_id, &model_name, &line)));
                }
                StreamEvent::Failed(message) => {
                    let error = json!({"error": {"code": 500, "message": message}});
                    yield Ok(Event::default().data(error.to_string()));
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            metrics.record_failure();
        } else {
            let tool_calls = ctx.tool_calls();
            let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
            let mut done = ChatCompletionChunk::done(&resp_id, &model_name, finish_reason);
            if !tool_calls.is_empty() {
                done.tool_calls = Some(format_tool_calls(&resp_id, &tool_calls));
            }
            let artifacts = ctx.artifacts();
            if !artifacts.is_empty() {
                done.artifacts = Some(Value::Array(artifacts));
            }
            let history = ctx.history();
            if !history.is_empty() {
                done.tool_history = Some(Value::Array(history));
            }
            yield Ok(frame(&done));
            metrics.record_success(completion_tokens, start.elapsed());
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        ),
    )
        .into_response()
}
