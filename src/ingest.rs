//! Document ingestion pipeline.
//!
//! Upload flow: save raw PDF → extract text → chunk → embed (batch) →
//! build index → persist index + chunks, all under a fresh document id in
//! the caller's session. Every step is a hard dependency on the previous
//! one succeeding; empty output aborts the pipeline. A session created just
//! for this upload is torn down on failure, while a pre-existing session
//! survives one bad document.

use crate::chunker::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedder::{embed_chunks, Embedder};
use crate::error::{RagError, Result};
use crate::index::FlatIndex;
use crate::session::SessionRegistry;

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub session_id: String,
    pub document_id: String,
    pub chunk_count: usize,
}

pub async fn ingest_document(
    registry: &SessionRegistry,
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
    session_id: Option<&str>,
    pdf_bytes: Vec<u8>,
) -> Result<UploadOutcome> {
    // Reuse a valid session (validate doubles as the access-time bump) or
    // start a fresh one.
    let (session_id, fresh) = match session_id {
        Some(id) if registry.validate(id) => {
            tracing::info!(session_id = %id, "reusing existing session");
            (id.to_string(), false)
        }
        _ => (registry.create()?, true),
    };

    match run_pipeline(registry, embedder, chunking, &session_id, pdf_bytes).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if fresh {
                tracing::warn!(session_id = %session_id, error = %e, "ingestion failed, removing fresh session");
                registry.delete(&session_id);
            } else {
                tracing::warn!(session_id = %session_id, error = %e, "ingestion failed");
            }
            Err(e)
        }
    }
}

async fn run_pipeline(
    registry: &SessionRegistry,
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
    session_id: &str,
    pdf_bytes: Vec<u8>,
) -> Result<UploadOutcome> {
    let document_id = uuid::Uuid::new_v4().to_string();

    std::fs::write(registry.file_path(session_id, &document_id), &pdf_bytes)?;

    let text = extract_text(pdf_bytes).await?;
    if text.trim().is_empty() {
        return Err(RagError::stage("text extraction", "PDF contains no text"));
    }

    let chunks = chunk_text(&text, chunking.max_tokens, chunking.overlap_tokens);
    if chunks.is_empty() {
        return Err(RagError::stage("chunking", "no chunks produced"));
    }

    let (chunks, vectors) = embed_chunks(embedder, chunks).await?;

    let index = FlatIndex::build(&vectors)?;
    index.persist(
        &chunks,
        &registry.index_path(session_id, &document_id),
        &registry.chunks_path(session_id, &document_id),
    )?;

    tracing::info!(
        session_id = %session_id,
        document_id = %document_id,
        chunks = chunks.len(),
        "document ingested"
    );

    Ok(UploadOutcome {
        session_id: session_id.to_string(),
        document_id,
        chunk_count: chunks.len(),
    })
}

/// Extract text from PDF bytes. Parsing is CPU-bound, so it runs on the
/// blocking pool instead of stalling the request task.
async fn extract_text(pdf_bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem(&pdf_bytes)
            .map_err(|e| RagError::stage("text extraction", e.to_string()))
    })
    .await
    .map_err(|e| RagError::stage("text extraction", e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

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

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>> {
            Err(RagError::UpstreamModel("down".to_string()))
        }
        async fn embed_batch(&self, _: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(RagError::UpstreamModel("down".to_string()))
        }
        fn dims(&self) -> usize {
            4
        }
    }

    fn test_pdf(text: &str) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![100.into(), 600.into()]),
                Operation::new("Tj", vec![Object::string_literal(text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(tmp.path()).unwrap();
        (tmp, reg)
    }

    #[tokio::test]
    async fn successful_ingest_writes_all_artifacts() {
        let (_tmp, reg) = registry();
        let pdf = test_pdf("Alpha Beta. Gamma Delta.");
        let outcome = ingest_document(&reg, &StubEmbedder, &ChunkingConfig::default(), None, pdf)
            .await
            .unwrap();

        assert!(outcome.chunk_count > 0);
        assert!(reg
            .file_path(&outcome.session_id, &outcome.document_id)
            .exists());
        assert!(reg
            .chunks_path(&outcome.session_id, &outcome.document_id)
            .exists());
        assert!(reg
            .index_path(&outcome.session_id, &outcome.document_id)
            .exists());
        assert!(reg.validate(&outcome.session_id));
    }

    #[tokio::test]
    async fn reuses_valid_existing_session() {
        let (_tmp, reg) = registry();
        let existing = reg.create().unwrap();
        let pdf = test_pdf("Some document text here.");
        let outcome = ingest_document(
            &reg,
            &StubEmbedder,
            &ChunkingConfig::default(),
            Some(&existing),
            pdf,
        )
        .await
        .unwrap();
        assert_eq!(outcome.session_id, existing);
    }

    #[tokio::test]
    async fn invalid_session_id_gets_fresh_session() {
        let (_tmp, reg) = registry();
        let pdf = test_pdf("Some document text here.");
        let outcome = ingest_document(
            &reg,
            &StubEmbedder,
            &ChunkingConfig::default(),
            Some("not-a-real-session"),
            pdf,
        )
        .await
        .unwrap();
        assert_ne!(outcome.session_id, "not-a-real-session");
        assert!(reg.validate(&outcome.session_id));
    }

    #[tokio::test]
    async fn garbage_bytes_abort_and_remove_fresh_session() {
        let (tmp, reg) = registry();
        let err = ingest_document(
            &reg,
            &StubEmbedder,
            &ChunkingConfig::default(),
            None,
            b"not a pdf at all".to_vec(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::PipelineStage { .. }));

        // No session directory left behind.
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_keeps_preexisting_session() {
        let (_tmp, reg) = registry();
        let existing = reg.create().unwrap();
        let pdf = test_pdf("Some document text here.");
        let err = ingest_document(
            &reg,
            &FailingEmbedder,
            &ChunkingConfig::default(),
            Some(&existing),
            pdf,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::UpstreamModel(_)));
        assert!(reg.session_dir(&existing).exists());
    }
}
