use crate::error::{SweepError, SweepResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use std::sync::Arc;

/// Per-key result of one bulk delete call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub deleted: Vec<String>,
    /// (key, error) for keys the store refused to delete.
    pub rejected: Vec<(String, String)>,
}

/// Object store bulk deletion.
#[async_trait]
pub trait BulkDeleter: Send + Sync {
    /// Delete up to one batch of keys in a single call.
    ///
    /// An `Err` means the call as a whole failed and no key is known to be
    /// deleted.
    async fn delete_batch(&self, keys: &[String]) -> SweepResult<BatchReport>;
}

pub struct ObjectStoreDeleter {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreDeleter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BulkDeleter for ObjectStoreDeleter {
    async fn delete_batch(&self, keys: &[String]) -> SweepResult<BatchReport> {
        let locations = keys
            .iter()
            .map(|key| Ok(ObjectPath::from(key.as_str())))
            .collect::<Vec<_>>();
        let results: Vec<object_store::Result<ObjectPath>> = self
            .store
            .delete_stream(stream::iter(locations).boxed())
            .collect()
            .await;

        // results come back in request order
        let mut report = BatchReport::default();
        let mut first_error = None;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(_) => report.deleted.push(key.clone()),
                Err(object_store::Error::NotFound { .. }) => {
                    tracing::debug!(key = %key, "Blob already absent from the object store");
                    report.deleted.push(key.clone());
                }
                Err(e) => {
                    report.rejected.push((key.clone(), e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }

        if report.deleted.is_empty() {
            if let Some(e) = first_error {
                return Err(SweepError::ObjectStore(e));
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::PutPayload;
    use object_store::memory::InMemory;

    async fn store_with(keys: &[&str]) -> Arc<InMemory> {
        let store = Arc::new(InMemory::new());
        for key in keys {
            store
                .put(&ObjectPath::from(*key), PutPayload::from_static(b"blob"))
                .await
                .expect("Failed to put blob");
        }
        store
    }

    #[tokio::test]
    async fn test_delete_batch_removes_objects() {
        let store = store_with(&["aa", "bb", "cc"]).await;
        let deleter = ObjectStoreDeleter::new(store.clone());

        let keys = vec!["aa".to_string(), "bb".to_string()];
        let report = deleter.delete_batch(&keys).await.unwrap();

        assert_eq!(report.deleted, keys);
        assert!(report.rejected.is_empty());
        assert!(store.head(&ObjectPath::from("aa")).await.is_err());
        assert!(store.head(&ObjectPath::from("cc")).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_object_counts_as_deleted() {
        let store = store_with(&["aa"]).await;
        let deleter = ObjectStoreDeleter::new(store);

        let keys = vec!["aa".to_string(), "never-stored".to_string()];
        let report = deleter.delete_batch(&keys).await.unwrap();

        assert_eq!(report.deleted, keys);
    }
}
