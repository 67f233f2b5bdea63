//! # docintel — local document intelligence server
//!
//! Indexes a directory tree of documents into a SQLite vector store and serves
//! file, AI and retrieval-augmented tools to a client over line-delimited JSON.
//!
//! ## Architecture
//!
//! - **[`config`]** — Configuration loading, defaults and validation
//! - **[`change`]** — Content hashing and change detection for incremental runs
//! - **[`extract`]** — Text extraction for plain text, HTML and PDF
//! - **[`embedder`]** — Text embedding (hashed features or Ollama)
//! - **[`ai`]** — Generation providers and the retry/rate-limit middleware
//! - **[`db`]** — SQLite + sqlite-vec document and chunk store
//! - **[`indexer`]** — Walk, skip, chunk, embed and store; run reports
//! - **[`mcp`]** — MCP server: tool catalogue, dispatcher and stdio transport via rmcp

pub mod ai;
pub mod change;
pub mod config;
pub mod db;
pub mod embedder;
pub mod extract;
pub mod indexer;
pub mod mcp;
