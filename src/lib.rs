//! # Servir
//!
//! On-device chat-completion serving core: an OpenAI-compatible HTTP API
//! backed by a locally loaded language model.
//!
//! Servir (Spanish: "to serve") couples two subsystems:
//!
//! - A **unigram subword tokenizer**: SentencePiece-style Viterbi
//!   segmentation over a scored vocabulary, with a byte-level trie, UTF-8
//!   pretokenization, a piece cache and character-level fallback.
//! - A **chat-completion pipeline**: chat-template prompt assembly, model
//!   generation under an exclusive gate, and a tool-orchestration loop
//!   dispatching model-emitted function calls to builtin handlers or an
//!   external JSON-RPC tool server, with optional SSE token streaming.
//!
//! ## Example
//!
//! ```rust,ignore
//! use servir::api::{create_router, AppState};
//! use servir::config::Options;
//! use servir::model::DemoModel;
//!
//! let state = AppState::new(Box::new(DemoModel::new()), Options::default());
//! let app = create_router(state);
//! axum::serve(listener, app).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod chat_template;
pub mod config;
pub mod error;
pub mod mcp;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod tokenizer;
pub mod tools;
pub mod trie;
pub mod utf8;

// Re-exports for convenience
pub use error::{Result, ServirError};
pub use tokenizer::UnigramTokenizer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
