//! Retrieval-augmented query pipeline.
//!
//! Per request: validate/touch the session, load its index and chunks,
//! embed the (possibly enhanced) query, search top-k, assemble retrieved
//! chunk texts into a grounding prompt with recent conversation turns, and
//! stream the generated answer increment by increment. The completed answer
//! is appended to the session's conversation log only when the stream ends
//! cleanly.
//!
//! Pre-stream failures return a typed error; the HTTP layer turns both
//! those and mid-stream failures into the uniform streamed error line.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::RetrievalConfig;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::generate::{Generator, TokenStream};
use crate::history::{self, Message};
use crate::index::FlatIndex;
use crate::session::{is_safe_id, SessionRegistry};

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub message: String,
    pub session_id: String,
    pub document_id: String,
    /// Client-supplied turns, used only when the session has no persisted
    /// conversation log yet.
    pub history: Vec<Message>,
}

pub async fn stream_answer(
    registry: &SessionRegistry,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    retrieval: &RetrievalConfig,
    request: QueryRequest,
) -> Result<TokenStream> {
    if request.message.trim().is_empty() {
        return Err(RagError::Validation("message must not be empty".to_string()));
    }
    if !registry.validate(&request.session_id) {
        return Err(RagError::SessionExpiredOrInvalid);
    }
    if !is_safe_id(&request.document_id) {
        return Err(RagError::NotFound("document".to_string()));
    }

    // Loaded fresh per query, read-only. An artifact that vanished since
    // validation (a cleanup racing this query) surfaces as NotFound.
    let (index, chunks) = FlatIndex::load(
        &registry.index_path(&request.session_id, &request.document_id),
        &registry.chunks_path(&request.session_id, &request.document_id),
    )?;

    let history_path = registry.history_path(&request.session_id);
    let mut conversation = history::load(&history_path);
    if conversation.is_empty() {
        conversation = request.history.clone();
    }

    let enhanced = history::enhance_query(&request.message, &conversation);
    let query_vector = embedder.embed(&enhanced).await?;

    let top_k = retrieval.top_k;
    let hits = tokio::task::spawn_blocking(move || index.search(&query_vector, top_k))
        .await
        .map_err(|e| RagError::stage("search", e.to_string()))?;
    if hits.is_empty() {
        return Err(RagError::stage("retrieval", "no relevant content found"));
    }

    let context = hits
        .iter()
        .filter_map(|&i| chunks.get(i).map(String::as_str))
        .collect::<Vec<_>>()
        .join("\n\n");

    let recent = recent_window(&conversation, retrieval.history_window);
    let prompt = build_prompt(&context, &request.message, recent);

    let upstream = generator.stream(&prompt).await?;
    Ok(relay_and_record(upstream, history_path, request.message))
}

/// Forward increments to the caller while accumulating the full answer.
/// On clean completion the user turn and answer are appended to the
/// conversation log; an error item or a dropped receiver (client
/// disconnect) skips the append and stops consuming upstream tokens.
fn relay_and_record(
    mut upstream: TokenStream,
    history_path: std::path::PathBuf,
    user_message: String,
) -> TokenStream {
    let (tx, rx) = mpsc::channel::<Result<String>>(32);

    tokio::spawn(async move {
        let mut full_answer = String::new();
        while let Some(item) = upstream.next().await {
            match item {
                Ok(text) => {
                    full_answer.push_str(&text);
                    if tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        let turns = [Message::user(user_message), Message::assistant(full_answer)];
        if let Err(e) = history::append(&history_path, &turns) {
            tracing::warn!(error = %e, "failed to append conversation history");
        }
    });

    ReceiverStream::new(rx).boxed()
}

fn recent_window(conversation: &[Message], window: usize) -> &[Message] {
    let start = conversation.len().saturating_sub(window);
    &conversation[start..]
}

/// Grounding prompt: retrieved context, recent conversation, current
/// question.
fn build_prompt(context: &str, question: &str, recent: &[Message]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant. Use the provided context to answer questions accurately.\n\
         If the context doesn't contain enough information to answer the question, say so.\n\
         Don't make up information that's not in the context.\n\n",
    );

    prompt.push_str("Context:\n");
    prompt.push_str(context);
    prompt.push('\n');

    if !recent.is_empty() {
        prompt.push_str("\nPrevious conversation:\n");
        for msg in recent {
            let prefix = if msg.role == "user" { "User" } else { "Assistant" };
            prompt.push_str(&format!("{}: {}\n", prefix, msg.content));
        }
    }

    prompt.push_str(&format!("\nQuestion: {}", question));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use async_trait::async_trait;
    use futures::stream;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32 / 255.0;
            }
            Ok(v)
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
        fn dims(&self) -> usize {
            4
        }
    }

    struct StubGenerator {
        parts: Vec<&'static str>,
    }

    #[async_trait]
    impl Generator for StubGenerator {
        async fn stream(&self, _prompt: &str) -> Result<TokenStream> {
            let items: Vec<Result<String>> =
                self.parts.iter().map(|p| Ok(p.to_string())).collect();
            Ok(stream::iter(items).boxed())
        }
    }

    struct ErroringGenerator;

    #[async_trait]
    impl Generator for ErroringGenerator {
        async fn stream(&self, _prompt: &str) -> Result<TokenStream> {
            let items: Vec<Result<String>> = vec![
                Ok("partial".to_string()),
                Err(RagError::UpstreamModel("connection reset".to_string())),
            ];
            Ok(stream::iter(items).boxed())
        }
    }

    async fn seed_document(registry: &SessionRegistry, chunks: &[&str]) -> (String, String) {
        let session_id = registry.create().unwrap();
        let document_id = uuid::Uuid::new_v4().to_string();
        let texts: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
        let vectors = StubEmbedder.embed_batch(&texts).await.unwrap();
        let index = FlatIndex::build(&vectors).unwrap();
        index
            .persist(
                &texts,
                &registry.index_path(&session_id, &document_id),
                &registry.chunks_path(&session_id, &document_id),
            )
            .unwrap();
        (session_id, document_id)
    }

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(tmp.path()).unwrap();
        (tmp, reg)
    }

    async fn collect(stream: TokenStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn streams_answer_and_records_history() {
        let (_tmp, reg) = registry();
        let (session_id, document_id) =
            seed_document(&reg, &["Alpha is a Greek letter.", "Beta follows alpha."]).await;

        let request = QueryRequest {
            message: "What is Alpha?".to_string(),
            session_id: session_id.clone(),
            document_id,
            history: Vec::new(),
        };
        let stream = stream_answer(
            &reg,
            Arc::new(StubEmbedder),
            Arc::new(StubGenerator {
                parts: vec!["Alpha ", "is ", "a letter."],
            }),
            &RetrievalConfig::default(),
            request,
        )
        .await
        .unwrap();

        let parts = collect(stream).await;
        let answer: String = parts.into_iter().map(|p| p.unwrap()).collect();
        assert_eq!(answer, "Alpha is a letter.");

        // Clean completion appends both turns.
        let log = history::load(&reg.history_path(&session_id));
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], Message::user("What is Alpha?"));
        assert_eq!(log[1], Message::assistant("Alpha is a letter."));
    }

    #[tokio::test]
    async fn invalid_session_is_typed_error() {
        let (_tmp, reg) = registry();
        let request = QueryRequest {
            message: "hello".to_string(),
            session_id: "not-a-real-session".to_string(),
            document_id: "doc".to_string(),
            history: Vec::new(),
        };
        let err = stream_answer(
            &reg,
            Arc::new(StubEmbedder),
            Arc::new(StubGenerator { parts: vec![] }),
            &RetrievalConfig::default(),
            request,
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, RagError::SessionExpiredOrInvalid));
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let (_tmp, reg) = registry();
        let session_id = reg.create().unwrap();
        let request = QueryRequest {
            message: "hello".to_string(),
            session_id,
            document_id: "missing-doc".to_string(),
            history: Vec::new(),
        };
        let err = stream_answer(
            &reg,
            Arc::new(StubEmbedder),
            Arc::new(StubGenerator { parts: vec![] }),
            &RetrievalConfig::default(),
            request,
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn mid_stream_error_skips_history_append() {
        let (_tmp, reg) = registry();
        let (session_id, document_id) = seed_document(&reg, &["Some content."]).await;

        let request = QueryRequest {
            message: "question".to_string(),
            session_id: session_id.clone(),
            document_id,
            history: Vec::new(),
        };
        let stream = stream_answer(
            &reg,
            Arc::new(StubEmbedder),
            Arc::new(ErroringGenerator),
            &RetrievalConfig::default(),
            request,
        )
        .await
        .unwrap();

        let parts = collect(stream).await;
        assert!(parts.last().unwrap().is_err());
        assert!(history::load(&reg.history_path(&session_id)).is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_validation_error() {
        let (_tmp, reg) = registry();
        let (session_id, document_id) = seed_document(&reg, &["content"]).await;
        let request = QueryRequest {
            message: "   ".to_string(),
            session_id,
            document_id,
            history: Vec::new(),
        };
        let err = stream_answer(
            &reg,
            Arc::new(StubEmbedder),
            Arc::new(StubGenerator { parts: vec![] }),
            &RetrievalConfig::default(),
            request,
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
    }

    #[test]
    fn prompt_contains_context_history_and_question() {
        let recent = [Message::user("earlier question")];
        let prompt = build_prompt("chunk one\n\nchunk two", "What now?", &recent);
        assert!(prompt.contains("chunk one\n\nchunk two"));
        assert!(prompt.contains("User: earlier question"));
        assert!(prompt.ends_with("Question: What now?"));
    }

    #[test]
    fn recent_window_is_bounded() {
        let conversation: Vec<Message> =
            (0..10).map(|i| Message::user(format!("m{}", i))).collect();
        let recent = recent_window(&conversation, 4);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, "m6");
    }
}
