//! Search index collaborator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::IndexError;

/// The search subsystem as the relay sees it.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates or replaces a document.
    async fn index_document(
        &self,
        index: &str,
        document_id: &str,
        document: &Value,
    ) -> Result<(), IndexError>;

    /// Removes a document. Removing a missing document succeeds.
    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), IndexError>;
}

#[derive(Debug, Default)]
struct InMemoryIndexState {
    documents: HashMap<(String, String), Value>,
    fail_on_write: bool,
    failing_documents: HashSet<String>,
    writes: usize,
}

impl InMemoryIndexState {
    fn check(&self, document_id: &str) -> Result<(), IndexError> {
        if self.fail_on_write {
            return Err(IndexError::Unavailable("index offline".to_string()));
        }
        if self.failing_documents.contains(document_id) {
            return Err(IndexError::Rejected(format!("document {document_id}")));
        }
        Ok(())
    }
}

/// In-memory search index for testing and for running without a search
/// backend.
#[derive(Debug, Clone, Default)]
pub struct InMemorySearchIndex {
    state: Arc<RwLock<InMemoryIndexState>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail as unavailable.
    pub fn set_fail_on_write(&self, fail: bool) {
        self.state.write().unwrap().fail_on_write = fail;
    }

    /// Makes writes for one document id fail as rejected.
    pub fn set_fail_for_document(&self, document_id: impl Into<String>, fail: bool) {
        let document_id = document_id.into();
        let mut state = self.state.write().unwrap();
        if fail {
            state.failing_documents.insert(document_id);
        } else {
            state.failing_documents.remove(&document_id);
        }
    }

    pub fn document(&self, index: &str, document_id: &str) -> Option<Value> {
        self.state
            .read()
            .unwrap()
            .documents
            .get(&(index.to_string(), document_id.to_string()))
            .cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .documents
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.state.read().unwrap().writes
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index_document(
        &self,
        index: &str,
        document_id: &str,
        document: &Value,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write().unwrap();
        state.check(document_id)?;
        state
            .documents
            .insert((index.to_string(), document_id.to_string()), document.clone());
        state.writes += 1;
        tracing::debug!(index, document_id, "document indexed");
        Ok(())
    }

    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), IndexError> {
        let mut state = self.state.write().unwrap();
        state.check(document_id)?;
        state
            .documents
            .remove(&(index.to_string(), document_id.to_string()));
        state.writes += 1;
        tracing::debug!(index, document_id, "document deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_index_then_delete() {
        let index = InMemorySearchIndex::new();
        index
            .index_document("products", "v1", &json!({"available": 3}))
            .await
            .unwrap();
        assert_eq!(index.document("products", "v1"), Some(json!({"available": 3})));

        index.delete_document("products", "v1").await.unwrap();
        index.delete_document("products", "v1").await.unwrap();
        assert_eq!(index.document_count("products"), 0);
        assert_eq!(index.write_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let index = InMemorySearchIndex::new();
        index.set_fail_for_document("v1", true);

        let err = index
            .index_document("products", "v1", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Rejected(_)));
        index
            .index_document("products", "v2", &json!({}))
            .await
            .unwrap();

        index.set_fail_on_write(true);
        let err = index.delete_document("products", "v2").await.unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_)));
    }
}
