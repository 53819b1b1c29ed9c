//! Question Embedder
//!
//! Deterministic token-hash embedding. It has to match the embedding the
//! `rag_documents` seed job wrote, so the dimension and the hashing scheme
//! are fixed.

use crate::schema_rag::vector_store::Embedding;
use sha2::{Digest, Sha256};

pub const EMBEDDING_DIMS: usize = 1536;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMS)
    }
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Each whitespace token adds one count per digest byte at
    /// `(byte + i * 31) % dims`; the result is L2-normalised.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut values = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            for (i, byte) in digest.iter().enumerate() {
                values[(*byte as usize + i * 31) % self.dims] += 1.0;
            }
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm = if norm == 0.0 { 1.0 } else { norm };
        values.iter_mut().for_each(|v| *v /= norm);
        values
    }

    /// pgvector text literal, e.g. `[0.000000,0.125000]`.
    pub fn to_pgvector_literal(values: &[f32]) -> String {
        let parts: Vec<String> = values.iter().map(|v| format!("{:.6}", v)).collect();
        format!("[{}]", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_is_normalised_and_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_text("Revenue by store");
        let b = embedder.embed_text("revenue   BY store");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMS);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedding = HashEmbedder::new(8).embed_text("   ");
        assert!(embedding.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_pgvector_literal() {
        assert_eq!(HashEmbedder::to_pgvector_literal(&[0.5, 0.0]), "[0.500000,0.000000]");
    }
}
