//! JSON-RPC tool client over child-process stdio
//!
//! The external tool server is a child process speaking JSON-RPC 2.0 on
//! stdin/stdout, framed either LSP-style (`Content-Length:` headers) or as
//! one JSON object per line. The orchestrator depends only on the
//! [`ToolClient`] trait; [`McpStdioClient`] is the stdio implementation.
//!
//! A dedicated reader thread parses incoming frames into a channel so
//! request/response calls can enforce a timeout. At most one call is in
//! flight at a time, enforced by the orchestrator's lock.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{Result, ServirError};

/// Wire framing for the child's stdio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// `Content-Length:` framed JSON-RPC, LSP-style
    #[default]
    Lsp,
    /// One JSON object per line
    Jsonl,
}

impl std::str::FromStr for Transport {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "jsonl" => Self::Jsonl,
            _ => Self::Lsp,
        })
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,
    /// Request id, matched against the response
    pub id: u64,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Write one message in the given framing.
fn write_frame<W: Write>(w: &mut W, transport: Transport, msg: &Value) -> std::io::Result<()> {
    let content = msg.to_string();
    match transport {
        Transport::Lsp => {
            write!(w, "Content-Length: {}\r\n\r\n{content}", content.len())?;
        }
        Transport::Jsonl => {
            writeln!(w, "{content}")?;
        }
    }
    w.flush()
}

/// Read one message in the given framing. `Ok(None)` means clean EOF.
fn read_frame<R: BufRead>(r: &mut R, transport: Transport) -> std::io::Result<Option<Value>> {
    match transport {
        Transport::Lsp => {
            let mut content_length: Option<usize> = None;
            loop {
                let mut line = String::new();
                if r.read_line(&mut line)? == 0 {
                    return Ok(None);
                }
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some(len) = line.strip_prefix("Content-Length:") {
                    content_length = len.trim().parse().ok();
                }
            }
            let len = content_length.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "missing Content-Length")
            })?;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            let value = serde_json::from_slice(&buf).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?;
            Ok(Some(value))
        }
        Transport::Jsonl => loop {
            let mut line = String::new();
            if r.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable line from tool server");
                }
            }
        },
    }
}

/// Interface the orchestrator depends on for external tools.
pub trait ToolClient: Send + Sync {
    /// List the tools the server advertises, as
    /// `{name, description, inputSchema}` objects.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::Tool`] on transport failure or timeout.
    fn list_tools(&self) -> Result<Vec<Value>>;

    /// Invoke a tool and return its result object.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::Tool`] on transport failure, a JSON-RPC
    /// error response, or timeout.
    fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value>;
}

/// JSON-RPC tool client speaking to a spawned child process.
pub struct McpStdioClient {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    incoming: Mutex<Receiver<Value>>,
    next_id: AtomicU64,
    timeout: Duration,
    transport: Transport,
    debug: bool,
}

impl std::fmt::Debug for McpStdioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpStdioClient")
            .field("transport", &self.transport)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl McpStdioClient {
    /// Spawn the tool server and perform the `initialize` handshake.
    ///
    /// The command line is split on whitespace; the first token is the
    /// program, the rest its arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::Tool`] when the process cannot be spawned or
    /// the handshake fails.
    pub fn start(
        cmdline: &str,
        timeout_ms: u64,
        transport: Transport,
        debug: bool,
    ) -> Result<Self> {
        let mut parts = cmdline.split_whitespace();
        let program = parts.next().ok_or_else(|| ServirError::Tool {
            reason: "empty tool server command line".to_string(),
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ServirError::Tool {
                reason: format!("failed to spawn tool server '{program}': {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ServirError::Tool {
            reason: "tool server stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ServirError::Tool {
            reason: "tool server stdout unavailable".to_string(),
        })?;

        let (tx, rx) = std::sync::mpsc::channel::<Value>();
        let reader_debug = debug;
        std::thread::Builder::new()
            .name("mcp-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame(&mut reader, transport) {
                        Ok(Some(value)) => {
                            if reader_debug {
                                debug!(message = %value, "mcp <-");
                            }
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "mcp reader stopped");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| ServirError::Tool {
                reason: format!("failed to spawn reader thread: {e}"),
            })?;

        let client = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            incoming: Mutex::new(rx),
            next_id: AtomicU64::new(1),
            timeout: Duration::from_millis(timeout_ms),
            transport,
            debug,
        };

        client.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "servir", "version": crate::VERSION}
            }),
        )?;
        client.notify("notifications/initialized", None)?;
        Ok(client)
    }

    fn send(&self, msg: &Value) -> Result<()> {
        if self.debug {
            debug!(message = %msg, "mcp ->");
        }
        let mut stdin = self.stdin.lock().map_err(|_| ServirError::Tool {
            reason: "tool server stdin poisoned".to_string(),
        })?;
        write_frame(&mut *stdin, self.transport, msg).map_err(|e| ServirError::Tool {
            reason: format!("tool server write failed: {e}"),
        })
    }

    fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        self.send(&serde_json::to_value(&note).unwrap_or_default())
    }

    /// Send a request and wait for the matching response.
    ///
    /// Notifications and stale responses arriving in between are drained
    /// and discarded; only one call is in flight at a time.
    fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params: Some(params),
        };
        self.send(&serde_json::to_value(&request).unwrap_or_default())?;

        let incoming = self.incoming.lock().map_err(|_| ServirError::Tool {
            reason: "tool server receiver poisoned".to_string(),
        })?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServirError::Tool {
                    reason: format!("tool server timed out after {:?} on {method}", self.timeout),
                });
            }
            match incoming.recv_timeout(remaining) {
                Ok(msg) => {
                    if msg.get("id").and_then(Value::as_u64) != Some(id) {
                        continue;
                    }
                    if let Some(err) = msg.get("error") {
                        return Err(ServirError::Tool {
                            reason: format!("tool server error: {err}"),
                        });
                    }
                    return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ServirError::Tool {
                        reason: format!("tool server timed out after {:?} on {method}", self.timeout),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ServirError::Tool {
                        reason: "tool server closed its stdout".to_string(),
                    });
                }
            }
        }
    }
}

impl ToolClient for McpStdioClient {
    fn list_tools(&self) -> Result<Vec<Value>> {
        let result = self.request("tools/list", json!({}))?;
        Ok(result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        self.request(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
        )
    }
}

impl Drop for McpStdioClient {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// External tool server state shared by the HTTP handlers.
#[derive(Default)]
pub struct McpState {
    /// Connected client; `None` when no server is configured or startup
    /// failed
    pub client: Option<Arc<dyn ToolClient>>,
    /// Names the server advertises; external dispatch is gated on these
    pub tool_names: HashSet<String>,
    /// The advertised tools converted to OpenAI schema form
    pub openai_tools: Vec<Value>,
}

impl std::fmt::Debug for McpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpState")
            .field("connected", &self.client.is_some())
            .field("tool_names", &self.tool_names)
            .finish_non_exhaustive()
    }
}

impl McpState {
    /// Build state from an already-connected client, converting the
    /// advertised tool list to OpenAI schemas.
    #[must_use]
    pub fn from_client(client: Arc<dyn ToolClient>, tools: Vec<Value>) -> Self {
        let mut state = Self {
            client: Some(client),
            ..Default::default()
        };
        for t in tools {
            let Some(name) = t.get("name").and_then(Value::as_str) else {
                continue;
            };
            state.tool_names.insert(name.to_string());
            state.openai_tools.push(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": t.get("description").and_then(Value::as_str).unwrap_or(""),
                    "parameters": t.get("inputSchema").cloned().unwrap_or_else(|| json!({}))
                }
            }));
        }
        state
    }
}

/// Spawn and interrogate the external tool server per the options.
///
/// Every failure is a warning, never fatal: the server simply runs without
/// external tools.
#[must_use]
pub fn init_mcp(opt: &Options) -> McpState {
    if opt.mcp_server_cmdline.is_empty() {
        return McpState::default();
    }

    info!(cmdline = %opt.mcp_server_cmdline, "launching stdio tool server");
    let client = match McpStdioClient::start(
        &opt.mcp_server_cmdline,
        opt.mcp_timeout_ms,
        opt.mcp_transport,
        opt.mcp_debug,
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            warn!(error = %e, "failed to initialize tool server");
            return McpState::default();
        }
    };

    let tools = match client.list_tools() {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "tools/list failed");
            return McpState {
                client: Some(client),
                ..Default::default()
            };
        }
    };

    let state = McpState::from_client(client, tools);
    info!(count = state.openai_tools.len(), "loaded tools from stdio server");
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_transport_from_str() {
        assert_eq!("jsonl".parse::<Transport>().unwrap(), Transport::Jsonl);
        assert_eq!("lsp".parse::<Transport>().unwrap(), Transport::Lsp);
        assert_eq!("anything".parse::<Transport>().unwrap(), Transport::Lsp);
    }

    #[test]
    fn test_lsp_frame_round_trip() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let mut buf = Vec::new();
        write_frame(&mut buf, Transport::Lsp, &msg).unwrap();

        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("Content-Length: "));
        assert!(text.contains("\r\n\r\n"));

        let mut reader = Cursor::new(buf);
        let parsed = read_frame(&mut reader, Transport::Lsp).unwrap().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_jsonl_frame_round_trip() {
        let msg = json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}});
        let mut buf = Vec::new();
        write_frame(&mut buf, Transport::Jsonl, &msg).unwrap();
        assert!(buf.ends_with(b"\n"));

        let mut reader = Cursor::new(buf);
        let parsed = read_frame(&mut reader, Transport::Jsonl).unwrap().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_jsonl_skips_garbage_lines() {
        let raw = b"not json\n\n{\"id\":1}\n".to_vec();
        let mut reader = Cursor::new(raw);
        let parsed = read_frame(&mut reader, Transport::Jsonl).unwrap().unwrap();
        assert_eq!(parsed, json!({"id": 1}));
    }

    #[test]
    fn test_read_frame_eof() {
        let mut reader = Cursor::new(Vec::new());
        assert!(read_frame(&mut reader, Transport::Lsp).unwrap().is_none());
        let mut reader = Cursor::new(Vec::new());
        assert!(read_frame(&mut reader, Transport::Jsonl).unwrap().is_none());
    }

    #[test]
    fn test_mcp_state_from_client_converts_schemas() {
        struct NullClient;
        impl ToolClient for NullClient {
            fn list_tools(&self) -> Result<Vec<Value>> {
                Ok(vec![])
            }
            fn call_tool(&self, _name: &str, _arguments: &Value) -> Result<Value> {
                Ok(Value::Null)
            }
        }

        let tools = vec![
            json!({"name": "sd_txt2img", "description": "draw", "inputSchema": {"type": "object"}}),
            json!({"description": "nameless, skipped"}),
        ];
        let state = McpState::from_client(Arc::new(NullClient), tools);

        assert_eq!(state.openai_tools.len(), 1);
        assert!(state.tool_names.contains("sd_txt2img"));
        let f = &state.openai_tools[0]["function"];
        assert_eq!(f["name"], "sd_txt2img");
        assert_eq!(f["description"], "draw");
        assert_eq!(f["parameters"]["type"], "object");
    }

    #[test]
    fn test_init_mcp_disabled_without_cmdline() {
        let state = init_mcp(&Options::default());
        assert!(state.client.is_none());
        assert!(state.openai_tools.is_empty());
    }

    #[test]
    fn test_init_mcp_survives_spawn_failure() {
        let opts = Options {
            mcp_server_cmdline: "/nonexistent/tool-server --flag".to_string(),
            ..Default::default()
        };
        let state = init_mcp(&opts);
        assert!(state.client.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_stdio_client_against_shell_server() {
        // A minimal jsonl JSON-RPC responder. Request ids are allocated in
        // order (initialize=1, tools/list=2, tools/call=3).
        let script = r#"
while read line; do
  case "$line" in
    *'"initialize"'*) echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}' ;;
    *'tools/list'*) echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echo back","inputSchema":{"type":"object"}}]}}' ;;
    *'tools/call'*) echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}' ;;
    *) ;;
  esac
done
"#;
        let script_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(script_file.path(), script).unwrap();

        let cmdline = format!("sh {}", script_file.path().display());
        let client =
            McpStdioClient::start(&cmdline, 5_000, Transport::Jsonl, false).expect("start");

        let tools = client.list_tools().expect("list_tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");

        let result = client.call_tool("echo", &json!({"x": 1})).expect("call_tool");
        assert_eq!(result["content"][0]["text"], "hi");
    }
}
