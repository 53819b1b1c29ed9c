//! Vector Store Backends
//!
//! Two [`KnowledgeIndex`] implementations over the same embedder:
//! `PgVectorStore` reads the seeded `rag_documents` table with pgvector's
//! cosine distance, `InMemoryVectorStore` does a linear cosine scan for
//! local runs and tests.

use crate::schema_rag::embedder::HashEmbedder;
use crate::schema_rag::retriever::{KnowledgeIndex, RetrievalError};
use crate::types::RetrievedDocument;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::RwLock;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// Document in the in-memory store
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub doc_type: String,
    pub source: String,
    pub content: String,
    pub embedding: Embedding,
}

pub struct InMemoryVectorStore {
    embedder: HashEmbedder,
    documents: RwLock<Vec<Document>>,
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new(HashEmbedder::default())
    }
}

impl InMemoryVectorStore {
    pub fn new(embedder: HashEmbedder) -> Self {
        Self {
            embedder,
            documents: RwLock::new(Vec::new()),
        }
    }

    /// Embeds `content` and adds it to the store. Returns the assigned id.
    pub fn add_document(&self, doc_type: &str, source: &str, content: &str) -> i64 {
        let embedding = self.embedder.embed_text(content);
        let mut documents = match self.documents.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = documents.len() as i64 + 1;
        documents.push(Document {
            id,
            doc_type: doc_type.to_string(),
            source: source.to_string(),
            content: content.to_string(),
            embedding,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn search_sync(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let query_embedding = self.embedder.embed_text(query);
        let documents = self
            .documents
            .read()
            .map_err(|_| RetrievalError::Unavailable("in-memory store lock poisoned".to_string()))?;

        let mut results: Vec<RetrievedDocument> = documents
            .iter()
            .map(|doc| RetrievedDocument {
                id: Some(doc.id),
                doc_type: doc.doc_type.clone(),
                source: doc.source.clone(),
                content: doc.content.clone(),
                relevance_score: cosine_similarity(&query_embedding, &doc.embedding),
            })
            .collect();

        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);
        Ok(results)
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryVectorStore {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        self.search_sync(query, top_k)
    }
}

/// pgvector-backed index over `rag_documents(id, doc_type, source, content, embedding)`.
pub struct PgVectorStore {
    pool: PgPool,
    embedder: HashEmbedder,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            embedder: HashEmbedder::default(),
        }
    }
}

#[async_trait]
impl KnowledgeIndex for PgVectorStore {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let literal = HashEmbedder::to_pgvector_literal(&self.embedder.embed_text(query));
        let rows = sqlx::query(
            "SELECT id::bigint AS id, doc_type, source, content, \
                    (1 - (embedding <=> $1::vector))::float8 AS score \
             FROM rag_documents \
             ORDER BY embedding <=> $1::vector \
             LIMIT $2",
        )
        .bind(literal)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(RetrievedDocument {
                    id: row.try_get::<Option<i64>, _>("id")?,
                    doc_type: row.try_get::<Option<String>, _>("doc_type")?.unwrap_or_default(),
                    source: row.try_get::<Option<String>, _>("source")?.unwrap_or_default(),
                    content: row.try_get::<Option<String>, _>("content")?.unwrap_or_default(),
                    relevance_score: row.try_get::<Option<f64>, _>("score")?.unwrap_or(0.0) as f32,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| RetrievalError::Malformed(e.to_string()))
    }
}

/// Compute cosine similarity between two vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_search_ranks_by_similarity() {
        let store = InMemoryVectorStore::default();
        store.add_document("schema", "v_payment_scoped", "payment amount payment_date store_id");
        store.add_document("metric", "glossary", "rental count per category");

        let results = store.search("payment amount", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "v_payment_scoped");
        assert!(results[0].relevance_score > 0.0);
    }
}
