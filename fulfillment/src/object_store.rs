use async_trait::async_trait;
use url::Url;

use crate::error::MarketError;

/// Bucket-scoped blob store with public URLs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), MarketError>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, bucket: &str, path: &str) -> Result<bool, MarketError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Object path of a public URL previously returned by `public_url`.
    fn object_path(&self, bucket: &str, url: &str) -> Result<String, MarketError> {
        let prefix = Url::parse(&self.public_url(bucket, ""))?;
        let target = Url::parse(url)?;

        if prefix.origin() != target.origin() {
            return Err(MarketError::Validation(format!(
                "{} is not served by this object store",
                url
            )));
        }

        match target.path().strip_prefix(prefix.path()) {
            Some(path) if !path.is_empty() => Ok(path.to_string()),
            _ => Err(MarketError::Validation(format!(
                "{} does not point into bucket {}",
                url, bucket
            ))),
        }
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use memory::MemoryObjectStorage;

#[cfg(any(test, feature = "test-helpers"))]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub struct StoredObject {
        pub content_type: String,
        pub bytes: Vec<u8>,
    }

    /// In-process object store for tests.
    #[derive(Default)]
    pub struct MemoryObjectStorage {
        objects: Mutex<HashMap<(String, String), StoredObject>>,
        fail_puts: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl MemoryObjectStorage {
        pub const BASE_URL: &'static str = "http://objects.test/storage/v1/object/public";

        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_puts(&self, fail: bool) {
            self.fail_puts.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_deletes(&self, fail: bool) {
            self.fail_deletes.store(fail, Ordering::SeqCst);
        }

        pub fn get(&self, bucket: &str, path: &str) -> Option<StoredObject> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), path.to_string()))
                .cloned()
        }

        pub fn contains_url(&self, bucket: &str, url: &str) -> bool {
            self.object_path(bucket, url)
                .map(|path| self.get(bucket, &path).is_some())
                .unwrap_or(false)
        }

        pub fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl ObjectStorage for MemoryObjectStorage {
        async fn put(
            &self,
            bucket: &str,
            path: &str,
            content_type: &str,
            bytes: Vec<u8>,
        ) -> Result<(), MarketError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(MarketError::ObjectStore("upload rejected".to_string()));
            }
            self.objects.lock().unwrap().insert(
                (bucket.to_string(), path.to_string()),
                StoredObject {
                    content_type: content_type.to_string(),
                    bytes,
                },
            );
            Ok(())
        }

        async fn delete(&self, bucket: &str, path: &str) -> Result<bool, MarketError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(MarketError::ObjectStore("delete rejected".to_string()));
            }
            Ok(self
                .objects
                .lock()
                .unwrap()
                .remove(&(bucket.to_string(), path.to_string()))
                .is_some())
        }

        fn public_url(&self, bucket: &str, path: &str) -> String {
            format!("{}/{}/{}", Self::BASE_URL, bucket, path)
        }
    }
}
