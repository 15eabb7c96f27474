//! Tool catalog and builtin tool router
//!
//! Tools travel the wire in OpenAI function-call shape:
//! `{"type":"function","function":{"name","description","parameters"}}`.
//! The catalog offered to the model is a by-name merge of client-supplied
//! tools, the builtin tools below, and whatever the external tool server
//! advertises. Builtin handlers are closures dispatched by name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde_json::{json, Value};

/// Extract `function.name` from an OpenAI-shaped tool schema.
#[must_use]
pub fn tool_name_from_schema(tool: &Value) -> Option<&str> {
    tool.get("function")?.get("name")?.as_str()
}

/// Merge two tool catalogs by `function.name`.
///
/// `base` entries keep their original order; entries from `extra` are
/// appended when their name is not already present. A schema without a name
/// cannot collide and is appended unconditionally.
#[must_use]
pub fn merge_tools_by_name(base: Vec<Value>, extra: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(base.len() + extra.len());
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for tool in base {
        if let Some(name) = tool_name_from_schema(&tool) {
            seen.insert(name.to_string());
        }
        out.push(tool);
    }
    for tool in extra {
        match tool_name_from_schema(tool) {
            Some(name) => {
                if seen.insert(name.to_string()) {
                    out.push(tool.clone());
                }
            }
            None => out.push(tool.clone()),
        }
    }
    out
}

/// Handler signature for builtin tools: arguments in, result out.
pub type ToolHandler = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// Name-to-closure router for builtin tools.
pub struct BuiltinRouter {
    handlers: HashMap<String, ToolHandler>,
}

impl std::fmt::Debug for BuiltinRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinRouter")
            .field("tools", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for BuiltinRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    /// Whether a handler exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler for `name`, if registered.
    #[must_use]
    pub fn dispatch(&self, name: &str, args: &Value) -> Option<Value> {
        self.handlers.get(name).map(|h| h(args))
    }

    /// Registered tool names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

// ============================================================================
// Host accessibility bridge
// ============================================================================

/// Capability provider for the platform-accessibility UI-automation tools.
///
/// The host registers an implementation once at startup; the builtin
/// handlers route through it. With no bridge registered the handlers
/// answer `{"ok":false,"error":"tool bridge not registered"}`.
pub trait HostBridge: Send + Sync {
    /// Dump the current UI tree as text.
    ///
    /// # Errors
    ///
    /// Returns the host-side failure message.
    fn dump_ui(&self) -> std::result::Result<String, String>;

    /// Perform a named global action (back, home, ...).
    fn global_action(&self, name: &str) -> bool;

    /// Click the view with the given resource id.
    fn click_view_id(&self, view_id: &str) -> bool;

    /// Click the first view whose text equals (or contains) `text`.
    fn click_text(&self, text: &str, contains: bool) -> bool;

    /// Set the text of the view with the given resource id.
    fn set_text_view_id(&self, view_id: &str, text: &str) -> bool;
}

static HOST_BRIDGE: RwLock<Option<Arc<dyn HostBridge>>> = RwLock::new(None);

/// Replace the process-wide host bridge, dropping any prior reference.
pub fn set_host_bridge(bridge: Option<Arc<dyn HostBridge>>) {
    if let Ok(mut slot) = HOST_BRIDGE.write() {
        *slot = bridge;
    }
}

/// Current host bridge, if one is registered.
#[must_use]
pub fn host_bridge() -> Option<Arc<dyn HostBridge>> {
    HOST_BRIDGE.read().ok().and_then(|slot| slot.clone())
}

fn bridge_err(message: &str) -> Value {
    json!({"ok": false, "error": message})
}

// ============================================================================
// Builtin tools
// ============================================================================

/// OpenAI-shaped schemas for the builtin tools.
#[must_use]
pub fn make_builtin_tools() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "random",
                "description": "Generate a random integer between floor and ceiling, inclusive.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "floor": {"type": "integer", "description": "Lower bound"},
                        "ceiling": {"type": "integer", "description": "Upper bound"}
                    },
                    "required": ["floor", "ceiling"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "add",
                "description": "Add two integers and return their sum.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "a": {"type": "integer", "description": "First addend"},
                        "b": {"type": "integer", "description": "Second addend"}
                    },
                    "required": ["a", "b"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "dump_ui",
                "description": "Dump the current screen's UI hierarchy as text.",
                "parameters": {"type": "object", "properties": {}}
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "global_action",
                "description": "Perform a global navigation action such as back, home or recents.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Action name: back, home, recents, notifications, quick_settings"}
                    },
                    "required": ["name"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "click_view_id",
                "description": "Click the view with the given resource id.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "view_id": {"type": "string", "description": "Fully qualified resource id"}
                    },
                    "required": ["view_id"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "click_text",
                "description": "Click the first view matching the given text.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "Text to match"},
                        "contains": {"type": "boolean", "description": "Substring match instead of exact (default true)"}
                    },
                    "required": ["text"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "set_text_view_id",
                "description": "Set the text of the view with the given resource id.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "view_id": {"type": "string", "description": "Fully qualified resource id"},
                        "text": {"type": "string", "description": "Text to enter"}
                    },
                    "required": ["view_id", "text"]
                }
            }
        }),
    ]
}

/// Build the builtin router with every handler registered.
#[must_use]
pub fn make_builtin_router() -> BuiltinRouter {
    let mut router = BuiltinRouter::new();

    router.register("random", |args| {
        let mut lo = args.get("floor").and_then(Value::as_i64).unwrap_or(0);
        let mut hi = args.get("ceiling").and_then(Value::as_i64).unwrap_or(1);
        if lo > hi {
            std::mem::swap(&mut lo, &mut hi);
        }
        let value = rand::thread_rng().gen_range(lo..=hi);
        json!({"value": value})
    });

    router.register("add", |args| {
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
        json!({"value": a + b})
    });

    router.register("dump_ui", |_args| match host_bridge() {
        Some(bridge) => match bridge.dump_ui() {
            Ok(dump) => json!({"ok": true, "dump": dump}),
            Err(e) => bridge_err(&e),
        },
        None => bridge_err("tool bridge not registered"),
    });

    router.register("global_action", |args| {
        let Some(name) = args.get("name").and_then(Value::as_str) else {
            return bridge_err("missing name");
        };
        match host_bridge() {
            Some(bridge) => {
                let ok = bridge.global_action(name);
                json!({"ok": ok, "name": name})
            }
            None => bridge_err("tool bridge not registered"),
        }
    });

    router.register("click_view_id", |args| {
        let Some(view_id) = args.get("view_id").and_then(Value::as_str) else {
            return bridge_err("missing view_id");
        };
        match host_bridge() {
            Some(bridge) => {
                let ok = bridge.click_view_id(view_id);
                json!({"ok": ok, "view_id": view_id})
            }
            None => bridge_err("tool bridge not registered"),
        }
    });

    router.register("click_text", |args| {
        let Some(text) = args.get("text").and_then(Value::as_str) else {
            return bridge_err("missing text");
        };
        let contains = args.get("contains").and_then(Value::as_bool).unwrap_or(true);
        match host_bridge() {
            Some(bridge) => {
                let ok = bridge.click_text(text, contains);
                json!({"ok": ok, "text": text})
            }
            None => bridge_err("tool bridge not registered"),
        }
    });

    router.register("set_text_view_id", |args| {
        let Some(view_id) = args.get("view_id").and_then(Value::as_str) else {
            return bridge_err("missing view_id");
        };
        let Some(text) = args.get("text").and_then(Value::as_str) else {
            return bridge_err("missing text");
        };
        match host_bridge() {
            Some(bridge) => {
                let ok = bridge.set_text_view_id(view_id, text);
                json!({"ok": ok, "view_id": view_id})
            }
            None => bridge_err("tool bridge not registered"),
        }
    });

    router
}
