//! # docthread: Document Conversation Server
//!
//! Ingests a document into ordered chunks and hosts AI conversations about
//! it: one main conversation per document plus highlight conversations scoped
//! to a character range of a chunk. Highlight conversations can be merged back
//! into the main conversation, and replies stream to clients token by token.
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration loading and validation
//! - **[`db`]**: SQLite record store (documents, chunks, conversations, messages)
//! - **[`ingest`]**: Text/markdown/PDF extraction and paragraph-aware chunking
//! - **[`generation`]**: Streaming generation client (OpenAI-compatible SSE, scripted mock), prompts
//! - **[`documents`]**, **[`graph`]**, **[`message_log`]**, **[`merge`]**, **[`navigation`]**: Domain operations over the store
//! - **[`session`]**: Event protocol, per-connection router, chat turns
//! - **[`server`]**: axum HTTP routes and the WebSocket stream
//! - **[`context`]**: Shared handles passed to the server and sessions

pub mod config;
pub mod context;
pub mod db;
pub mod documents;
pub mod error;
pub mod generation;
pub mod graph;
pub mod identity;
pub mod ingest;
pub mod merge;
pub mod message_log;
pub mod navigation;
pub mod server;
pub mod session;

pub use context::AppContext;
pub use error::{AppError, Result};
