//! Schema RAG Retriever
//!
//! Retrieves reference snippets (schema hints, metric definitions, widget
//! rules, governance notes) for a question and scopes them to the caller's
//! allowed views.

use crate::types::{RetrievedDocument, SecurityContext, ViewCatalog};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("knowledge index unavailable: {0}")]
    Unavailable(String),

    #[error("knowledge index returned an unreadable row: {0}")]
    Malformed(String),
}

/// Read-only vector-indexed knowledge store.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError>;
}

/// Ordered retrieval result, most relevant first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub documents: Vec<RetrievedDocument>,
    /// Documents dropped because they describe a view outside the scope.
    pub filtered_out: usize,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Source ids for the audit trail; content is never persisted.
    pub fn sources(&self) -> Vec<String> {
        self.documents
            .iter()
            .map(|d| match d.id {
                Some(id) => format!("{}:{}", d.source, id),
                None => d.source.clone(),
            })
            .collect()
    }
}

pub struct RetrievalStage {
    index: Arc<dyn KnowledgeIndex>,
    catalog: ViewCatalog,
    top_k: usize,
}

impl RetrievalStage {
    pub fn new(index: Arc<dyn KnowledgeIndex>, catalog: ViewCatalog, top_k: usize) -> Self {
        Self { index, catalog, top_k }
    }

    pub async fn retrieve(
        &self,
        question: &str,
        security: &SecurityContext,
    ) -> Result<RetrievedContext, RetrievalError> {
        let hits = self.index.search(question, self.top_k).await?;
        let total = hits.len();
        let documents: Vec<RetrievedDocument> = hits
            .into_iter()
            .filter(|doc| self.in_scope(doc, security))
            .collect();

        debug!(total, kept = documents.len(), "retrieved knowledge documents");
        Ok(RetrievedContext {
            filtered_out: total - documents.len(),
            documents,
        })
    }

    /// A document is out of scope when its source names a catalog view the
    /// caller may not query.
    fn in_scope(&self, doc: &RetrievedDocument, security: &SecurityContext) -> bool {
        doc.source
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|token| self.catalog.contains(token))
            .all(|view| security.allows_view(view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::scope::ScopePolicy;
    use crate::schema_rag::vector_store::InMemoryVectorStore;

    fn security() -> SecurityContext {
        let catalog = ViewCatalog::new(["v_payment_scoped", "v_customer_masked"]);
        ScopePolicy::new(catalog, vec![])
            .resolve("store_manager", 1, &["v_payment_scoped".to_string()])
            .unwrap()
    }

    #[tokio::test]
    async fn test_drops_documents_for_disallowed_views() {
        let store = InMemoryVectorStore::default();
        store.add_document("schema", "v_payment_scoped", "payment amount by store");
        store.add_document("schema", "views/v_customer_masked", "customer email masked payment");
        store.add_document("governance", "policy", "never expose raw payment card data");

        let stage = RetrievalStage::new(
            Arc::new(store),
            ViewCatalog::new(["v_payment_scoped", "v_customer_masked"]),
            5,
        );
        let context = stage.retrieve("payment amount", &security()).await.unwrap();

        assert_eq!(context.documents.len(), 2);
        assert_eq!(context.filtered_out, 1);
        assert!(context.documents.iter().all(|d| d.source != "views/v_customer_masked"));
        assert!(context.sources().iter().any(|s| s.starts_with("v_payment_scoped:")));
    }
}
