//! The external object-store capability (spec §1 OUT OF SCOPE / §4.9).
//!
//! The object store's on-disk layout, quarantine, and replication are
//! explicitly out of scope; this module only defines the boundary this
//! crate consumes, the way the teacher isolates `Pod`/`Container` behind a
//! trait in `src/sandbox/mod.rs` / `src/oci/container/mod.rs` and provides
//! an in-memory stand-in (`crates/storage/src/memory_key_value_storage.rs`)
//! for tests.

use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectHandleError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store backend error: {0}")]
    Backend(String),
}

/// Metadata read back for an existing object (spec §3/§4.9).
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct ObjectMeta {
    #[getset(get_copy = "pub")]
    pub size: u64,
    #[getset(get = "pub")]
    pub content_type: String,
    #[getset(get = "pub")]
    pub etag: String,
    #[getset(get = "pub")]
    pub meta: HashMap<String, String>,
    /// The validation tag last written by §4.9 validate; `Some(etag)` when
    /// the stored object has been validated at its current `etag`.
    #[getset(get = "pub")]
    pub validated: Option<String>,
}

/// Metadata to publish for a freshly finalized writable channel (spec §4.9
/// step 4).
#[derive(Clone, Debug)]
pub struct PublishMetadata {
    pub timestamp: String,
    pub content_type: String,
    pub content_length: u64,
    pub etag: String,
    pub object_meta: HashMap<String, String>,
}

/// The four operations the core needs from the object store: open,
/// read-metadata, atomic-create-with-metadata, and new-timestamp (spec §1).
#[async_trait]
pub trait ObjectHandle: Send + Sync {
    /// Opens `url` for reading, staging its bytes at `local_path` and
    /// returning its metadata (used for READABLE/CDR channel staging,
    /// spec §4.3 step 2).
    async fn open(&self, url: &str, local_path: &Path) -> Result<ObjectMeta, ObjectHandleError>;

    /// Reads metadata without staging bytes (used by the validation
    /// pre-check and `GET ?x-zerovm-valid`, spec §6).
    async fn read_metadata(&self, url: &str) -> Result<ObjectMeta, ObjectHandleError>;

    /// Atomically publishes `local_path`'s contents as the new version of
    /// `url` with `metadata`, renaming the staged file into place
    /// (spec §4.9 step 5). Single-writer semantics per
    /// `(account, container, object, timestamp)`; a higher timestamp
    /// supersedes a lower one.
    async fn create_with_metadata(
        &self,
        url: &str,
        local_path: &Path,
        metadata: PublishMetadata,
    ) -> Result<(), ObjectHandleError>;

    /// Writes the `Validated` tag onto an existing object's metadata
    /// (spec §4.9 validation mode).
    async fn mark_validated(&self, url: &str, etag: &str) -> Result<(), ObjectHandleError>;

    /// Issues a fresh version timestamp for an object about to be
    /// overwritten without one supplied by the request.
    async fn new_timestamp(&self, url: &str) -> Result<String, ObjectHandleError>;
}

struct StoredObject {
    bytes: Vec<u8>,
    meta: ObjectMeta,
}

/// An in-memory `ObjectHandle`, the stand-in used by tests for the real
/// (externally owned) object store.
#[derive(Default)]
pub struct MemoryObjectHandle {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryObjectHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seeds an object directly, bypassing `create_with_metadata`.
    pub fn seed(&self, url: &str, bytes: Vec<u8>, content_type: &str, etag: &str) {
        let meta = ObjectMeta {
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            etag: etag.to_string(),
            meta: HashMap::new(),
            validated: None,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(url.to_string(), StoredObject { bytes, meta });
    }
}

#[async_trait]
impl ObjectHandle for MemoryObjectHandle {
    async fn open(&self, url: &str, local_path: &Path) -> Result<ObjectMeta, ObjectHandleError> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(url)
            .ok_or_else(|| ObjectHandleError::NotFound(url.to_string()))?;
        tokio::fs::write(local_path, &obj.bytes)
            .await
            .map_err(ObjectHandleError::from)?;
        Ok(obj.meta.clone())
    }

    async fn read_metadata(&self, url: &str) -> Result<ObjectMeta, ObjectHandleError> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .map(|o| o.meta.clone())
            .ok_or_else(|| ObjectHandleError::NotFound(url.to_string()))
    }

    async fn create_with_metadata(
        &self,
        url: &str,
        local_path: &Path,
        metadata: PublishMetadata,
    ) -> Result<(), ObjectHandleError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(ObjectHandleError::from)?;
        let meta = ObjectMeta {
            size: metadata.content_length,
            content_type: metadata.content_type,
            etag: metadata.etag,
            meta: metadata.object_meta,
            validated: None,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(url.to_string(), StoredObject { bytes, meta });
        Ok(())
    }

    async fn mark_validated(&self, url: &str, etag: &str) -> Result<(), ObjectHandleError> {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(url)
            .ok_or_else(|| ObjectHandleError::NotFound(url.to_string()))?;
        obj.meta.validated = Some(etag.to_string());
        Ok(())
    }

    async fn new_timestamp(&self, _url: &str) -> Result<String, ObjectHandleError> {
        let objects = self.objects.lock().unwrap();
        let next = objects.len() as u64 + 1;
        Ok(format!("{}.000000", 1_700_000_000 + next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn open_stages_bytes_and_returns_metadata() {
        let store = MemoryObjectHandle::new();
        store.seed("swift://a/c/o", b"hello".to_vec(), "text/plain", "abc123");

        let dest = NamedTempFile::new().unwrap();
        let meta = store.open("swift://a/c/o", dest.path()).await.unwrap();

        assert_eq!(meta.size(), 5);
        assert_eq!(meta.etag(), "abc123");
        assert_eq!(tokio::fs::read(dest.path()).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn open_missing_object_is_not_found() {
        let store = MemoryObjectHandle::new();
        let dest = NamedTempFile::new().unwrap();
        let err = store.open("swift://a/c/missing", dest.path()).await;
        assert!(matches!(err, Err(ObjectHandleError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_with_metadata_then_read_back() {
        let store = MemoryObjectHandle::new();
        let src = NamedTempFile::new().unwrap();
        tokio::fs::write(src.path(), b"new bytes").await.unwrap();

        store
            .create_with_metadata(
                "swift://a/c/o",
                src.path(),
                PublishMetadata {
                    timestamp: "1700000000.000".to_string(),
                    content_type: "image/png".to_string(),
                    content_length: 9,
                    etag: "deadbeef".to_string(),
                    object_meta: HashMap::new(),
                },
            )
            .await
            .unwrap();

        let meta = store.read_metadata("swift://a/c/o").await.unwrap();
        assert_eq!(meta.content_type(), "image/png");
        assert_eq!(meta.etag(), "deadbeef");
    }

    #[tokio::test]
    async fn mark_validated_is_visible_on_read_metadata() {
        let store = MemoryObjectHandle::new();
        store.seed("swift://a/c/o", b"x".to_vec(), "text/plain", "etag1");
        store.mark_validated("swift://a/c/o", "etag1").await.unwrap();

        let meta = store.read_metadata("swift://a/c/o").await.unwrap();
        assert_eq!(meta.validated(), &Some("etag1".to_string()));
    }
}
