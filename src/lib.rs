//! # pdfchat
//!
//! Session-scoped retrieval-augmented question answering over uploaded
//! PDFs. Each upload gets an isolated, time-bounded session directory
//! holding the raw file, its chunked text, and a flat vector index;
//! questions are answered by embedding the query, retrieving the nearest
//! chunks, and streaming a grounded answer from the language model.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌──────────────────────────────┐   ┌───────────────┐
//! │ upload │──▶│ extract → chunk → embed       │──▶│ session dir    │
//! └────────┘   │ → build index → persist       │   │ files/ chunks/ │
//!              └──────────────────────────────┘   │ indices/       │
//! ┌────────┐   ┌──────────────────────────────┐   └──────┬────────┘
//! │ query  │──▶│ validate → load → embed query │◀─────────┘
//! └────────┘   │ → search → prompt → stream    │
//!              └──────────────────────────────┘
//! ```
//!
//! Sessions expire after one hour idle; an hourly background sweep removes
//! stale session directories.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`chunker`] | Overlapping token-window chunking |
//! | [`embedder`] | Embedding model adapter (batch + single) |
//! | [`index`] | Flat nearest-neighbor index, persisted per document |
//! | [`session`] | Session registry: identity, expiry, directory layout |
//! | [`history`] | Session-scoped conversation log and query enhancement |
//! | [`ingest`] | Upload pipeline orchestration |
//! | [`query`] | Retrieval-augmented streaming query pipeline |
//! | [`generate`] | Streaming LLM adapter |
//! | [`server`] | Axum HTTP boundary |
//! | [`error`] | Error taxonomy |

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod generate;
pub mod history;
pub mod index;
pub mod ingest;
pub mod query;
pub mod server;
pub mod session;
