//! Error taxonomy for the RAG pipelines.
//!
//! Components below the HTTP layer return [`RagError`] variants; the server
//! module is the single place these become responses (JSON for upload,
//! a streamed `"Error: ..."` line for query). Nothing lower in the stack
//! talks HTTP.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed or rejected input (non-PDF upload, empty message).
    #[error("{0}")]
    Validation(String),

    /// The session id is unknown, malformed, or past the idle timeout.
    #[error("Session expired or invalid")]
    SessionExpiredOrInvalid,

    /// A hard pipeline step produced no usable output.
    #[error("{stage} failed: {reason}")]
    PipelineStage { stage: &'static str, reason: String },

    /// Embedding or generation backend failure.
    #[error("upstream model error: {0}")]
    UpstreamModel(String),

    /// Index/chunks artifacts unreadable or mutually inconsistent.
    /// Treated as not-found by callers, never retried.
    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// A requested session or document artifact does not exist.
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    pub fn stage(stage: &'static str, reason: impl Into<String>) -> Self {
        RagError::PipelineStage {
            stage,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
