//! Model abstraction and generation configuration
//!
//! The neural network itself is an external collaborator behind the
//! [`LanguageModel`] trait: `prefill` turns a prompt into an opaque
//! context, `generate` pushes token text through a synchronous callback.
//! [`DemoModel`] is the deterministic implementation used by `--demo`
//! serving and the integration tests; it understands a small directive
//! convention that drives the tool-orchestration loop end to end.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, ServirError};
use crate::tokenizer::{SpecialTokens, UnigramTokenizer};

/// Tool dispatch callback: a tool-call directive in, the result object
/// fed back to the model out.
pub type ToolDispatchFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Tool emission callback for `tool_mode = "emit"`.
pub type ToolEmitFn = dyn Fn(&Value) + Send + Sync;

/// Sampling switch: explicit on/off, or derived from temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoSample {
    /// Greedy decoding
    Off,
    /// Sampled decoding
    On,
    /// Decided by the request handler from `temperature`
    #[default]
    Auto,
}

/// Decoding configuration for one generation run.
#[derive(Clone)]
pub struct GenerateConfig {
    /// Maximum number of new tokens
    pub max_new_tokens: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Top-k cutoff
    pub top_k: usize,
    /// Repetition penalty
    pub repetition_penalty: f32,
    /// Beam width; 1 disables beam search
    pub beam_size: usize,
    /// Sampling switch
    pub do_sample: DoSample,
    /// Verbose decode logging
    pub debug: bool,
    /// Collect tool-call directives instead of executing them
    pub return_tool_calls: bool,
    /// Invoked for each directive in emit mode
    pub on_tool_call: Option<Arc<ToolEmitFn>>,
    /// Executes a directive and returns the result object in execute mode
    pub tool_callback: Option<Arc<ToolDispatchFn>>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            beam_size: 1,
            do_sample: DoSample::Auto,
            debug: false,
            return_tool_calls: false,
            on_tool_call: None,
            tool_callback: None,
        }
    }
}

impl std::fmt::Debug for GenerateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateConfig")
            .field("max_new_tokens", &self.max_new_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("top_k", &self.top_k)
            .field("repetition_penalty", &self.repetition_penalty)
            .field("beam_size", &self.beam_size)
            .field("do_sample", &self.do_sample)
            .field("return_tool_calls", &self.return_tool_calls)
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("tool_callback", &self.tool_callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Opaque prefilled state handed from [`LanguageModel::prefill`] to
/// [`LanguageModel::generate`].
#[derive(Debug)]
pub struct GenerationContext {
    /// The rendered prompt; backends keep their KV state keyed off it
    pub prompt: String,
}

/// A locally loaded language model.
///
/// `generate` invokes `on_token` synchronously on the generator thread
/// with raw token bytes; returning `false` stops generation cleanly.
/// Implementations observe tool-call directives in their decode stream and
/// route them through the config's callbacks.
pub trait LanguageModel: Send {
    /// Prefill the prompt and return the generation context.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::Model`] when the backend rejects the prompt.
    fn prefill(&mut self, prompt: &str) -> Result<GenerationContext>;

    /// Generate tokens until EOS, the token budget, or an `on_token`
    /// abort.
    ///
    /// # Errors
    ///
    /// Returns [`ServirError::Model`] on backend failure.
    fn generate(
        &mut self,
        ctx: GenerationContext,
        cfg: &GenerateConfig,
        on_token: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()>;
}

// ============================================================================
// Demo model
// ============================================================================

/// Deterministic model for demo serving and tests.
///
/// Echoes the last user turn. A user turn of the form
/// `call:<name> <json-arguments>` is treated as a tool-call directive: in
/// emit mode it is reported through `on_tool_call`; in execute mode it is
/// dispatched through `tool_callback` and the result is narrated back as
/// text.
#[derive(Debug, Default)]
pub struct DemoModel {
    _private: (),
}

impl DemoModel {
    /// Create a demo model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the content of the last user turn from a ChatML prompt.
    fn last_user_text(prompt: &str) -> Option<&str> {
        let start = prompt.rfind("<|im_start|>user\n")?;
        let rest = &prompt[start + "<|im_start|>user\n".len()..];
        let end = rest.find("<|im_end|>").unwrap_or(rest.len());
        Some(rest[..end].trim())
    }

    /// Parse a `call:<name> <json>` directive.
    fn parse_directive(text: &str) -> Option<(String, Value)> {
        let rest = text.strip_prefix("call:")?;
        let (name, args_text) = match rest.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a.trim()),
            None => (rest, ""),
        };
        if name.is_empty() {
            return None;
        }
        let args = if args_text.is_empty() {
            json!({})
        } else {
            serde_json::from_str(args_text).unwrap_or_else(|_| json!({}))
        };
        Some((name.to_string(), args))
    }

    /// Emit `text` word by word through the callback, honoring the token
    /// budget and the abort signal.
    fn emit_text(text: &str, cfg: &GenerateConfig, on_token: &mut dyn FnMut(&[u8]) -> bool) {
        for (i, word) in text.split_whitespace().enumerate() {
            if i >= cfg.max_new_tokens {
                break;
            }
            let token = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            if !on_token(token.as_bytes()) {
                break;
            }
        }
    }
}

impl LanguageModel for DemoModel {
    fn prefill(&mut self, prompt: &str) -> Result<GenerationContext> {
        if prompt.is_empty() {
            return Err(ServirError::Model {
                reason: "empty prompt".to_string(),
            });
        }
        Ok(GenerationContext {
            prompt: prompt.to_string(),
        })
    }

    fn generate(
        &mut self,
        ctx: GenerationContext,
        cfg: &GenerateConfig,
        on_token: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        let user_text = Self::last_user_text(&ctx.prompt).unwrap_or("").to_string();

        if let Some((name, args)) = Self::parse_directive(&user_text) {
            let call = json!({"name": name.clone(), "arguments": args});

            if cfg.return_tool_calls {
                if let Some(cb) = &cfg.on_tool_call {
                    cb(&call);
                }
                // Emit mode stops at the emission boundary.
                return Ok(());
            }

            if let Some(dispatch) = &cfg.tool_callback {
                let response = dispatch(&call);
                let narration = match response.get("result") {
                    Some(result) => format!("Tool {name} returned {result}."),
                    None => {
                        let err = response
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error");
                        format!("Tool {name} failed: {err}.")
                    }
                };
                Self::emit_text(&narration, cfg, on_token);
                return Ok(());
            }
        }

        let reply = if user_text.is_empty() {
            "Hello! How can I help you today?".to_string()
        } else {
            format!("You said: {user_text}")
        };
        Self::emit_text(&reply, cfg, on_token);
        Ok(())
    }
}

// ============================================================================
// Model directory inspection
// ============================================================================

/// Metadata read from `model.json`.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    /// Model family used for template selection
    pub family: String,
    /// Human-readable model name
    pub name: String,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            family: "qwen3".to_string(),
            name: "qwen3-0.6b".to_string(),
        }
    }
}

/// Validate a model directory and read its metadata.
///
/// The directory must exist. A missing or unreadable `model.json` and
/// non-regular directory entries are warnings, not errors.
///
/// # Errors
///
/// Returns [`ServirError::Config`] when `path` is not a directory.
pub fn inspect_model_dir(path: impl AsRef<Path>) -> Result<ModelMetadata> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Err(ServirError::Config {
            reason: format!("model path is not a directory: {}", path.display()),
        });
    }

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let ft = entry.file_type();
            if !ft.map(|t| t.is_file() || t.is_dir()).unwrap_or(false) {
                warn!(entry = %entry.path().display(), "ignoring non-regular file in model directory");
            }
        }
    }

    let manifest = path.join("model.json");
    let contents = match std::fs::read_to_string(&manifest) {
        Ok(c) if !c.trim().is_empty() => c,
        Ok(_) => {
            warn!(path = %manifest.display(), "model.json is empty, using defaults");
            return Ok(ModelMetadata::default());
        }
        Err(e) => {
            warn!(path = %manifest.display(), error = %e, "model.json missing, using defaults");
            return Ok(ModelMetadata::default());
        }
    };

    match serde_json::from_str::<Value>(&contents) {
        Ok(v) => {
            let defaults = ModelMetadata::default();
            let meta = ModelMetadata {
                family: v
                    .get("family")
                    .and_then(Value::as_str)
                    .unwrap_or(&defaults.family)
                    .to_string(),
                name: v
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&defaults.name)
                    .to_string(),
            };
            debug!(family = %meta.family, name = %meta.name, "model metadata loaded");
            Ok(meta)
        }
        Err(e) => {
            warn!(path = %manifest.display(), error = %e, "model.json invalid, using defaults");
            Ok(ModelMetadata::default())
        }
    }
}

/// Side files probed for the unigram vocabulary, in order.
const TOKENIZER_FILES: &[&str] = &["unigram.txt", "tokenizer.txt"];

/// Load the unigram tokenizer from a model directory, if it ships one.
///
/// Probes the conventional side-file names and loads the first hit with
/// the standard special tokens. `Ok(None)` when the directory carries no
/// vocabulary file.
///
/// # Errors
///
/// Returns [`ServirError::ModelFile`] when a vocabulary file exists but
/// cannot be loaded.
pub fn load_tokenizer(dir: impl AsRef<Path>) -> Result<Option<UnigramTokenizer>> {
    let dir = dir.as_ref();
    for name in TOKENIZER_FILES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let special = SpecialTokens {
            bos: Some("<s>".to_string()),
            eos: Some("</s>".to_string()),
            unk: Some("<unk>".to_string()),
            ..Default::default()
        };
        let tokenizer = UnigramTokenizer::from_file(&path, &special, true, true, -10.0)?;
        debug!(path = %path.display(), vocab = tokenizer.vocab_size(), "tokenizer loaded");
        return Ok(Some(tokenizer));
    }
    debug!(dir = %dir.display(), "no tokenizer file in model directory");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect(model: &mut DemoModel, prompt: &str, cfg: &GenerateConfig) -> String {
        let ctx = model.prefill(prompt).unwrap();
        let mut out = String::new();
        model
            .generate(ctx, cfg, &mut |tok| {
                out.push_str(std::str::from_utf8(tok).unwrap());
                true
            })
            .unwrap();
        out
    }

    #[test]
    fn test_demo_echoes_user_turn() {
        let mut model = DemoModel::new();
        let prompt = "<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n";
        let out = collect(&mut model, prompt, &GenerateConfig::default());
        assert_eq!(out, "You said: Hello");
    }

    #[test]
    fn test_demo_without_user_turn() {
        let mut model = DemoModel::new();
        let out = collect(&mut model, "bare prompt", &GenerateConfig::default());
        assert!(!out.is_empty());
    }

    #[test]
    fn test_demo_empty_prompt_is_model_error() {
        let mut model = DemoModel::new();
        assert!(model.prefill("").is_err());
    }

    #[test]
    fn test_demo_respects_token_budget() {
        let mut model = DemoModel::new();
        let prompt = "<|im_start|>user\none two three four five<|im_end|>\n";
        let cfg = GenerateConfig {
            max_new_tokens: 3,
            ..Default::default()
        };
        let out = collect(&mut model, prompt, &cfg);
        assert_eq!(out, "You said: one");
    }

    #[test]
    fn test_demo_stops_on_abort() {
        let mut model = DemoModel::new();
        let ctx = model
            .prefill("<|im_start|>user\na b c d e<|im_end|>\n")
            .unwrap();
        let mut count = 0;
        model
            .generate(ctx, &GenerateConfig::default(), &mut |_tok| {
                count += 1;
                count < 2
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_demo_emit_mode_reports_directive() {
        let mut model = DemoModel::new();
        let captured = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = captured.clone();
        let cfg = GenerateConfig {
            return_tool_calls: true,
            on_tool_call: Some(Arc::new(move |call: &Value| {
                sink.lock().unwrap().push(call.clone());
            })),
            ..Default::default()
        };

        let prompt = "<|im_start|>user\ncall:add {\"a\": 1, \"b\": 2}<|im_end|>\n";
        let out = collect(&mut model, prompt, &cfg);

        assert!(out.is_empty());
        let calls = captured.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["name"], "add");
        assert_eq!(calls[0]["arguments"]["a"], 1);
    }

    #[test]
    fn test_demo_execute_mode_narrates_result() {
        let mut model = DemoModel::new();
        let cfg = GenerateConfig {
            tool_callback: Some(Arc::new(|call: &Value| {
                assert_eq!(call["name"], "add");
                json!({"result": {"value": 3}, "call": call})
            })),
            ..Default::default()
        };

        let prompt = "<|im_start|>user\ncall:add {\"a\": 1, \"b\": 2}<|im_end|>\n";
        let out = collect(&mut model, prompt, &cfg);
        assert!(out.contains("Tool add returned"));
        assert!(out.contains('3'));
    }

    #[test]
    fn test_demo_execute_mode_narrates_error() {
        let mut model = DemoModel::new();
        let cfg = GenerateConfig {
            tool_callback: Some(Arc::new(|call: &Value| {
                json!({"error": "tool not available", "call": call})
            })),
            ..Default::default()
        };

        let prompt = "<|im_start|>user\ncall:nope {}<|im_end|>\n";
        let out = collect(&mut model, prompt, &cfg);
        assert!(out.contains("failed"));
        assert!(out.contains("tool not available"));
    }

    #[test]
    fn test_directive_parsing() {
        let (name, args) = DemoModel::parse_directive("call:add {\"a\":1}").unwrap();
        assert_eq!(name, "add");
        assert_eq!(args["a"], 1);

        let (name, args) = DemoModel::parse_directive("call:dump_ui").unwrap();
        assert_eq!(name, "dump_ui");
        assert_eq!(args, json!({}));

        assert!(DemoModel::parse_directive("just text").is_none());
        assert!(DemoModel::parse_directive("call: ").is_none());
    }

    #[test]
    fn test_inspect_model_dir_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("model.json"),
            r#"{"family": "qwen3", "name": "qwen3-0.6b-demo"}"#,
        )
        .unwrap();

        let meta = inspect_model_dir(dir.path()).unwrap();
        assert_eq!(meta.family, "qwen3");
        assert_eq!(meta.name, "qwen3-0.6b-demo");
    }

    #[test]
    fn test_inspect_model_dir_missing_manifest_warns_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let meta = inspect_model_dir(dir.path()).unwrap();
        assert_eq!(meta.family, "qwen3");
    }

    #[test]
    fn test_inspect_model_dir_invalid_manifest_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.json"), "{not json").unwrap();
        let meta = inspect_model_dir(dir.path()).unwrap();
        assert_eq!(meta.name, "qwen3-0.6b");
    }

    #[test]
    fn test_inspect_model_dir_requires_directory() {
        assert!(inspect_model_dir("/nonexistent/model/dir").is_err());
    }

    #[test]
    fn test_load_tokenizer_from_side_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unigram.txt"), "▁hello -1.0\n▁world -2.0\n").unwrap();

        let tok = load_tokenizer(dir.path()).unwrap().expect("tokenizer");
        // Vocabulary plus the three appended special tokens.
        assert_eq!(tok.vocab_size(), 5);
        assert!(tok.special_ids().bos_id.is_some());
    }

    #[test]
    fn test_load_tokenizer_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tokenizer(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_tokenizer_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unigram.txt"), "no scores here\n").unwrap();
        assert!(load_tokenizer(dir.path()).is_err());
    }
}
