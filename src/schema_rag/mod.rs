//! Retrieval of reference snippets for SQL generation.

pub mod embedder;
pub mod retriever;
pub mod vector_store;

pub use embedder::HashEmbedder;
pub use retriever::{KnowledgeIndex, RetrievalError, RetrievalStage, RetrievedContext};
pub use vector_store::{InMemoryVectorStore, PgVectorStore};
