//! Servir CLI - on-device chat-completion server
//!
//! Serve an OpenAI-compatible chat API over a locally loaded model.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use servir::{
    api::{create_router, AppState},
    config::Options,
    error::{Result, ServirError},
    mcp::{init_mcp, Transport},
    model::{inspect_model_dir, load_tokenizer, DemoModel},
    tokenizer::UnigramTokenizer,
};

/// Servir - on-device chat-completion serving core
#[derive(Parser)]
#[command(name = "servir")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat-completion server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        host: String,

        /// Port to bind to; 0 means the default 18080
        #[arg(short, long, default_value_t = 18080)]
        port: u16,

        /// Model directory containing model.json and weight files
        #[arg(long)]
        model_path: Option<PathBuf>,

        /// Serve the deterministic demo model
        #[arg(long)]
        demo: bool,

        /// Prefer the Vulkan backend
        #[arg(long)]
        use_vulkan: bool,

        /// Do not offer the builtin tools
        #[arg(long)]
        no_builtin_tools: bool,

        /// Command line for an external stdio tool server
        #[arg(long, default_value = "")]
        mcp_server_cmdline: String,

        /// Timeout for external tool calls in milliseconds
        #[arg(long, default_value_t = 15_000)]
        mcp_timeout_ms: u64,

        /// Log external tool traffic
        #[arg(long)]
        mcp_debug: bool,

        /// Tool server framing: lsp or jsonl
        #[arg(long, default_value = "lsp")]
        mcp_transport: String,

        /// Merge external tools into client catalogs
        #[arg(long)]
        mcp_merge_tools: bool,

        /// Cap on tool-result string fields fed back to the model
        #[arg(long, default_value_t = 4096)]
        mcp_max_string_bytes: usize,

        /// Static asset root
        #[arg(long, default_value = "./examples/web")]
        web_root: PathBuf,
    },
    /// Show version and configuration info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            model_path,
            demo,
            use_vulkan,
            no_builtin_tools,
            mcp_server_cmdline,
            mcp_timeout_ms,
            mcp_debug,
            mcp_transport,
            mcp_merge_tools,
            mcp_max_string_bytes,
            web_root,
        } => {
            let options = Options {
                model_path: model_path.clone().unwrap_or_default(),
                port,
                use_vulkan,
                enable_builtin_tools: !no_builtin_tools,
                mcp_server_cmdline,
                mcp_timeout_ms,
                mcp_debug,
                mcp_transport: mcp_transport.parse::<Transport>().unwrap_or_default(),
                mcp_merge_tools,
                mcp_max_string_bytes_in_prompt: mcp_max_string_bytes,
                web_root,
                ..Default::default()
            };
            serve(&host, options, model_path, demo).await
        }
        Commands::Info => {
            println!("Servir v{}", servir::VERSION);
            println!("On-device chat-completion serving core");
            println!();
            println!("Features:");
            println!("  - OpenAI-compatible /v1/chat/completions (JSON and SSE)");
            println!("  - Unigram (SentencePiece-style) tokenizer");
            println!("  - Builtin and external (JSON-RPC stdio) tool calling");
            println!("  - Static asset serving for the bundled web demo");
            Ok(())
        }
    }
}

async fn serve(
    host: &str,
    options: Options,
    model_path: Option<PathBuf>,
    demo: bool,
) -> Result<()> {
    let mut tokenizer: Option<UnigramTokenizer> = None;
    if let Some(path) = &model_path {
        let meta = inspect_model_dir(path)?;
        info!(family = %meta.family, name = %meta.name, "model directory inspected");
        tokenizer = load_tokenizer(path)?;
    }

    if !demo {
        eprintln!("Error: no model backend linked into this build. Use --demo for testing.");
        std::process::exit(1);
    }

    let mcp = init_mcp(&options);
    let mcp_names: HashSet<String> = mcp.tool_names.clone();
    if !mcp_names.is_empty() {
        info!(tools = ?mcp_names, "external tools available");
    }

    let port = options.effective_port();
    let mut state = AppState::new(Box::new(DemoModel::new()), options).with_mcp(mcp);
    if let Some(tok) = tokenizer {
        state = state.with_tokenizer(tok);
    }
    let app = create_router(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| ServirError::Config {
            reason: format!("invalid listen address: {e}"),
        })?;

    info!(%addr, "chat-completion server listening");
    println!("servir OpenAI-style API server listening on http://{addr}");
    println!("POST /v1/chat/completions with OpenAI-format payloads.");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServirError::Config {
            reason: format!("failed to bind {addr}: {e}"),
        })?;

    axum::serve(listener, app)
        .await
        .map_err(|e| ServirError::Internal {
            reason: format!("server error: {e}"),
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_serve_demo() {
        let cli = Cli::parse_from(["servir", "serve", "--demo"]);
        match cli.command {
            Commands::Serve { demo, port, .. } => {
                assert!(demo);
                assert_eq!(port, 18080);
            }
            Commands::Info => panic!("expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parsing_serve_flags() {
        let cli = Cli::parse_from([
            "servir",
            "serve",
            "--demo",
            "--port",
            "9090",
            "--mcp-transport",
            "jsonl",
            "--mcp-merge-tools",
            "--web-root",
            "/tmp/web",
        ]);
        match cli.command {
            Commands::Serve {
                port,
                mcp_transport,
                mcp_merge_tools,
                web_root,
                ..
            } => {
                assert_eq!(port, 9090);
                assert_eq!(mcp_transport, "jsonl");
                assert!(mcp_merge_tools);
                assert_eq!(web_root, PathBuf::from("/tmp/web"));
            }
            Commands::Info => panic!("expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parsing_info() {
        let cli = Cli::parse_from(["servir", "info"]);
        assert!(matches!(cli.command, Commands::Info));
    }
}
