//! Server configuration
//!
//! All knobs the serving core reads, with their defaults. The CLI maps its
//! flags onto [`Options`] one to one.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::mcp::Transport;

/// Canonical server port. Legacy entry points used 8080; 18080 is
/// canonical and `0` maps back to it.
pub const DEFAULT_PORT: u16 = 18080;

/// Default cap on string fields fed back to the model from tool results.
pub const DEFAULT_MAX_TOOL_STRING_BYTES: usize = 4096;

/// Runtime options for the serving core.
#[derive(Debug, Clone)]
pub struct Options {
    /// Model directory containing `model.json` and weight files
    pub model_path: PathBuf,
    /// Listen port; `0` means [`DEFAULT_PORT`]
    pub port: u16,
    /// Prefer the Vulkan backend when the model supports it
    pub use_vulkan: bool,
    /// Offer the builtin tools to the model
    pub enable_builtin_tools: bool,
    /// Command line of the external tool server; empty disables it
    pub mcp_server_cmdline: String,
    /// Timeout for external tool calls, in milliseconds
    pub mcp_timeout_ms: u64,
    /// Log external tool traffic
    pub mcp_debug: bool,
    /// Wire framing for the external tool server
    pub mcp_transport: Transport,
    /// Merge external tools into client-supplied catalogs instead of only
    /// using them when the client offered none
    pub mcp_merge_tools: bool,
    /// Cap on string fields in tool results fed back to the model
    pub mcp_max_string_bytes_in_prompt: usize,
    /// Static asset root; image tools write under `<web_root>/generated`
    pub web_root: PathBuf,
    /// Tools treated as image generators by the delivery policy
    pub image_tools: HashSet<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            port: DEFAULT_PORT,
            use_vulkan: false,
            enable_builtin_tools: true,
            mcp_server_cmdline: String::new(),
            mcp_timeout_ms: 15_000,
            mcp_debug: false,
            mcp_transport: Transport::Lsp,
            mcp_merge_tools: false,
            mcp_max_string_bytes_in_prompt: DEFAULT_MAX_TOOL_STRING_BYTES,
            web_root: PathBuf::from("./examples/web"),
            image_tools: [String::from("sd_txt2img")].into_iter().collect(),
        }
    }
}

impl Options {
    /// Resolve the listen port, mapping `0` to the default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.port, 18080);
        assert_eq!(opts.effective_port(), 18080);
        assert!(opts.enable_builtin_tools);
        assert_eq!(opts.web_root, PathBuf::from("./examples/web"));
        assert!(opts.image_tools.contains("sd_txt2img"));
    }

    #[test]
    fn test_port_zero_maps_to_default() {
        let opts = Options {
            port: 0,
            ..Default::default()
        };
        assert_eq!(opts.effective_port(), DEFAULT_PORT);
    }

    #[test]
    fn test_explicit_port_kept() {
        let opts = Options {
            port: 8080,
            ..Default::default()
        };
        assert_eq!(opts.effective_port(), 8080);
    }
}
