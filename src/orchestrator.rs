//! Tool orchestration for the generation loop
//!
//! The decoder hands every structured tool-call directive to
//! [`ToolOrchestrator::dispatch`], which routes it to a builtin handler or
//! the external tool client, applies the image-delivery policy, extracts
//! and dedupes image artifacts, shapes the payload fed back to the model,
//! and keeps the per-request trace and history.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::mcp::ToolClient;
use crate::tools::BuiltinRouter;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How image outputs from tools reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDelivery {
    /// Write to `<web_root>/generated` and hand back a URL
    #[default]
    File,
    /// Inline base64 in the tool result
    Base64,
    /// Both file and base64
    Both,
}

impl ImageDelivery {
    /// Parse a request value; unrecognized values normalize to `File`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "base64" => Self::Base64,
            "both" => Self::Both,
            _ => Self::File,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Base64 => "base64",
            Self::Both => "both",
        }
    }
}

/// Per-request scratch state shared between the generation callback and
/// the response emitter.
#[derive(Debug, Default)]
pub struct ToolContext {
    /// Collected image artifacts
    artifacts_out: Mutex<Vec<Value>>,
    /// Dedup keys of artifacts already collected
    artifacts_seen: Mutex<HashSet<String>>,
    /// Names of dispatched tools, in order
    tool_trace: Mutex<Vec<String>>,
    /// Full dispatch records: name, arguments, ok, result or error, cost
    tool_history: Mutex<Vec<Value>>,
    /// Directives collected in emit mode
    tool_calls_out: Mutex<Vec<Value>>,
}

impl ToolContext {
    /// Fresh per-request context.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an emitted directive (emit mode).
    pub fn push_tool_call(&self, call: &Value) {
        if let Some(name) = call.get("name").and_then(Value::as_str) {
            if !name.is_empty() {
                self.push_trace(name);
            }
        }
        if let Ok(mut calls) = self.tool_calls_out.lock() {
            calls.push(call.clone());
        }
    }

    fn push_trace(&self, name: &str) {
        if let Ok(mut trace) = self.tool_trace.lock() {
            trace.push(name.to_string());
        }
    }

    fn push_history(&self, entry: Value) {
        if let Ok(mut history) = self.tool_history.lock() {
            history.push(entry);
        }
    }

    fn amend_history<F: FnOnce(&mut Map<String, Value>)>(&self, f: F) {
        if let Ok(mut history) = self.tool_history.lock() {
            if let Some(Value::Object(last)) = history.last_mut() {
                f(last);
            }
        }
    }

    /// Snapshot of collected artifacts.
    #[must_use]
    pub fn artifacts(&self) -> Vec<Value> {
        self.artifacts_out.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Snapshot of the dispatch trace.
    #[must_use]
    pub fn trace(&self) -> Vec<String> {
        self.tool_trace.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Snapshot of the dispatch history.
    #[must_use]
    pub fn history(&self) -> Vec<Value> {
        self.tool_history.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Snapshot of emitted directives.
    #[must_use]
    pub fn tool_calls(&self) -> Vec<Value> {
        self.tool_calls_out.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

/// Dedup key for an image artifact: the URL when present, otherwise a
/// stable hash of the base64 payload. `None` means "no key, always keep".
#[must_use]
pub fn image_artifact_key(artifact: &Value) -> Option<String> {
    if let Some(url) = artifact.get("url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    if let Some(b64) = artifact.get("base64").and_then(Value::as_str) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        b64.hash(&mut hasher);
        return Some(format!("b64:{:x}", hasher.finish()));
    }
    None
}

fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}

/// Whether a JSON object looks like an image payload, by schema hint or
/// MIME sniff.
fn image_payload(obj: &Map<String, Value>) -> Option<Value> {
    let mime = obj
        .get("mimeType")
        .or_else(|| obj.get("mime_type"))
        .and_then(Value::as_str);

    // MCP image content: {"type":"image","data":<b64>,"mimeType":...}
    if obj.get("type").and_then(Value::as_str) == Some("image") {
        if let Some(data) = obj.get("data").and_then(Value::as_str) {
            return Some(json!({
                "kind": "image",
                "mime_type": mime.unwrap_or("image/png"),
                "base64": data,
            }));
        }
    }

    // Generic base64 field with an image MIME hint.
    if let Some(b64) = obj.get("base64").and_then(Value::as_str) {
        if mime.is_none() || mime.is_some_and(is_image_mime) {
            return Some(json!({
                "kind": "image",
                "mime_type": mime.unwrap_or("image/png"),
                "base64": b64,
            }));
        }
    }

    // URL with an image MIME hint.
    if let Some(url) = obj.get("url").and_then(Value::as_str) {
        if mime.is_some_and(is_image_mime) {
            return Some(json!({
                "kind": "image",
                "mime_type": mime.unwrap_or("image/png"),
                "url": url,
            }));
        }
    }

    None
}

/// Walk a tool result and collect normalized image artifacts.
#[must_use]
pub fn collect_image_artifacts(result: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    let mut stack = vec![result];
    while let Some(v) = stack.pop() {
        match v {
            Value::Object(obj) => {
                if let Some(artifact) = image_payload(obj) {
                    out.push(artifact);
                } else {
                    stack.extend(obj.values());
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    out.reverse();
    out
}

/// Remove raw image bytes from a result before it goes back to the model.
#[must_use]
pub fn strip_image_payloads(result: &Value) -> Value {
    match result {
        Value::Object(obj) => {
            let is_image = image_payload(obj).is_some();
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                if is_image && (k == "data" || k == "base64") {
                    continue;
                }
                out.insert(k.clone(), strip_image_payloads(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_image_payloads).collect()),
        other => other.clone(),
    }
}

/// Truncate every string field longer than `max_bytes`, appending an
/// ellipsis marker with the original length. Cuts on a char boundary.
#[must_use]
pub fn truncate_large_strings(result: &Value, max_bytes: usize) -> Value {
    match result {
        Value::String(s) if s.len() > max_bytes => {
            let mut end = max_bytes;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            Value::String(format!("{}...(truncated,len={})", &s[..end], s.len()))
        }
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), truncate_large_strings(v, max_bytes)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| truncate_large_strings(v, max_bytes))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Routes model-emitted tool calls in execute mode.
pub struct ToolOrchestrator {
    builtin: Option<Arc<BuiltinRouter>>,
    client: Option<Arc<dyn ToolClient>>,
    mcp_mutex: Arc<Mutex<()>>,
    allowed: HashSet<String>,
    image_delivery: ImageDelivery,
    image_tools: HashSet<String>,
    max_string_bytes: usize,
    web_root: PathBuf,
}

impl std::fmt::Debug for ToolOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOrchestrator")
            .field("builtin", &self.builtin.is_some())
            .field("external", &self.client.is_some())
            .field("allowed", &self.allowed)
            .field("image_delivery", &self.image_delivery)
            .finish_non_exhaustive()
    }
}

impl ToolOrchestrator {
    /// Assemble an orchestrator for one request.
    ///
    /// `allowed` is the intersection of the tools actually offered in the
    /// prompt with those the external server advertises; only those names
    /// are eligible for external dispatch.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builtin: Option<Arc<BuiltinRouter>>,
        client: Option<Arc<dyn ToolClient>>,
        mcp_mutex: Arc<Mutex<()>>,
        allowed: HashSet<String>,
        image_delivery: ImageDelivery,
        image_tools: HashSet<String>,
        max_string_bytes: usize,
        web_root: PathBuf,
    ) -> Self {
        Self {
            builtin,
            client,
            mcp_mutex,
            allowed,
            image_delivery,
            image_tools,
            max_string_bytes,
            web_root,
        }
    }

    /// Apply the image-delivery policy, mutating the call arguments and
    /// returning the predicted `(url, path)` for file delivery.
    fn apply_image_policy(
        &self,
        name: &str,
        args: &mut Map<String, Value>,
    ) -> (Option<String>, Option<String>) {
        if !self.image_tools.contains(name) {
            return (None, None);
        }

        match self.image_delivery {
            ImageDelivery::File | ImageDelivery::Both => {
                let outdir = self.web_root.join("generated");
                if let Err(e) = std::fs::create_dir_all(&outdir) {
                    warn!(error = %e, "failed to create generated-image directory");
                    args.insert(
                        "output".to_string(),
                        Value::String(self.image_delivery.as_str().to_string()),
                    );
                    return (None, None);
                }
                let filename = format!("{name}_{}.png", now_epoch_ms());
                let outpath = outdir.join(&filename);
                args.insert(
                    "output".to_string(),
                    Value::String(self.image_delivery.as_str().to_string()),
                );
                args.insert(
                    "out_path".to_string(),
                    Value::String(outpath.display().to_string()),
                );
                (
                    Some(format!("/generated/{filename}")),
                    Some(outpath.display().to_string()),
                )
            }
            ImageDelivery::Base64 => {
                args.insert("output".to_string(), Value::String("base64".to_string()));
                args.remove("out_path");
                (None, None)
            }
        }
    }

    /// Dedupe an artifact against the context and record it, returning the
    /// summary stub when it survived.
    fn record_artifact(ctx: &ToolContext, artifact: Value) -> Option<Value> {
        let key = image_artifact_key(&artifact);
        if let Some(key) = key {
            let mut seen = ctx.artifacts_seen.lock().ok()?;
            if !seen.insert(key) {
                return None;
            }
        }
        let mut summary = json!({"kind": "image"});
        if let Some(url) = artifact.get("url") {
            summary["url"] = url.clone();
        }
        ctx.artifacts_out.lock().ok()?.push(artifact);
        Some(summary)
    }

    /// Execute one tool-call directive and return the JSON the model sees.
    ///
    /// Errors never propagate: they are folded into the returned object so
    /// the model can react in natural language.
    pub fn dispatch(&self, ctx: &ToolContext, call: &Value) -> Value {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let args = call
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        if name.is_empty() {
            return json!({"error": "missing tool name", "call": call});
        }

        info!(tool = %name, "tool call");
        ctx.push_trace(&name);
        ctx.push_history(json!({"name": name.clone(), "arguments": args.clone()}));

        // Builtin router wins over the external server.
        if let Some(router) = &self.builtin {
            let t0 = Instant::now();
            if let Some(result) = router.dispatch(&name, &args) {
                let cost_ms = t0.elapsed().as_millis() as u64;
                info!(tool = %name, cost_ms, "tool done (builtin)");
                ctx.amend_history(|h| {
                    h.insert("ok".to_string(), Value::Bool(true));
                    h.insert("result".to_string(), result.clone());
                    h.insert("cost_ms".to_string(), json!(cost_ms));
                });
                return json!({"result": result, "call": call});
            }
        }

        let Some(client) = self
            .client
            .as_ref()
            .filter(|_| self.allowed.contains(&name))
        else {
            warn!(tool = %name, "tool rejected or unavailable");
            ctx.amend_history(|h| {
                h.insert("ok".to_string(), Value::Bool(false));
                h.insert(
                    "error".to_string(),
                    Value::String("tool not available".to_string()),
                );
            });
            return json!({"error": "tool not available", "name": name, "call": call});
        };

        let mut args_obj = match args {
            Value::Object(m) => m,
            other => {
                let mut m = Map::new();
                if !other.is_null() {
                    m.insert("value".to_string(), other);
                }
                m
            }
        };
        let (forced_url, forced_path) = self.apply_image_policy(&name, &mut args_obj);
        let args = Value::Object(args_obj);

        // One external call in flight per server.
        let call_result = {
            let _guard = self.mcp_mutex.lock();
            let t0 = Instant::now();
            let result = client.call_tool(&name, &args);
            let cost_ms = t0.elapsed().as_millis() as u64;
            ctx.amend_history(|h| {
                h.insert("cost_ms".to_string(), json!(cost_ms));
            });
            info!(tool = %name, cost_ms, ok = result.is_ok(), "tool done (external)");
            result
        };

        let result = match call_result {
            Ok(result) if !result.is_null() => {
                ctx.amend_history(|h| {
                    h.insert("ok".to_string(), Value::Bool(true));
                    h.insert("result".to_string(), result.clone());
                });
                result
            }
            Ok(_) => {
                ctx.amend_history(|h| {
                    h.insert("ok".to_string(), Value::Bool(false));
                    h.insert("error".to_string(), Value::String("null result".to_string()));
                });
                return json!({"error": "tool call failed", "detail": "null result", "call": call});
            }
            Err(e) => {
                let detail = e.to_string();
                ctx.amend_history(|h| {
                    h.insert("ok".to_string(), Value::Bool(false));
                    h.insert("error".to_string(), Value::String(detail.clone()));
                });
                return json!({"error": "tool call failed", "detail": detail, "call": call});
            }
        };

        let mut artifact_summaries = Vec::new();

        if let Some(url) = &forced_url {
            let mut artifact = json!({
                "kind": "image",
                "mime_type": "image/png",
                "tool": name.clone(),
                "url": url,
            });
            if let Some(path) = &forced_path {
                artifact["path"] = json!(path);
            }
            if let Some(summary) = Self::record_artifact(ctx, artifact) {
                artifact_summaries.push(summary);
            }
        }

        for mut img in collect_image_artifacts(&result) {
            img["tool"] = json!(name.clone());
            if img.get("url").is_none() {
                if let Some(url) = &forced_url {
                    img["url"] = json!(url);
                }
            }
            if let Some(summary) = Self::record_artifact(ctx, img) {
                artifact_summaries.push(summary);
            }
        }

        let safe_result = truncate_large_strings(
            &strip_image_payloads(&result),
            self.max_string_bytes,
        );

        let mut resp = json!({"result": safe_result, "call": call});
        if !artifact_summaries.is_empty() {
            resp["artifacts"] = Value::Array(artifact_summaries);
        }
        resp
    }
}
