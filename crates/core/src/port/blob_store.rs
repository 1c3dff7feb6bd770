// Blob Store Port
// Object storage for uploaded files, addressed by (container, name)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::AsyncRead;

pub type BlobMetadata = BTreeMap<String, String>;

/// Readable blob content
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob '{name}' was not found in container '{container}'")]
    NotFound { container: String, name: String },

    #[error("File extension '{extension}' is not allowed. Allowed extensions: {allowed}")]
    ExtensionNotAllowed { extension: String, allowed: String },

    #[error("{0}")]
    Storage(String),
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `content` under a generated name and return that name
    async fn upload(
        &self,
        content: &mut (dyn AsyncRead + Unpin + Send),
        file_name: &str,
        container: &str,
        metadata: BlobMetadata,
    ) -> Result<String, BlobError>;

    async fn download(&self, name: &str, container: &str) -> Result<BlobReader, BlobError>;

    /// `false` when the blob did not exist
    async fn delete(&self, name: &str, container: &str) -> Result<bool, BlobError>;

    async fn get_metadata(&self, name: &str, container: &str) -> Result<BlobMetadata, BlobError>;

    async fn list(&self, container: &str) -> Result<Vec<BlobInfo>, BlobError>;

    /// Remove leftovers of uploads that never finished, last touched before `older_than`
    ///
    /// Returns how many were removed. Finished blobs are never touched.
    async fn purge_incomplete(
        &self,
        container: &str,
        older_than: DateTime<Utc>,
    ) -> Result<usize, BlobError>;
}

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Clone)]
    pub struct StoredBlob {
        pub content: Vec<u8>,
        pub metadata: BlobMetadata,
        pub last_modified: DateTime<Utc>,
    }

    /// In-memory blob store that counts upload calls
    #[derive(Default)]
    pub struct InMemoryBlobStore {
        blobs: Mutex<HashMap<(String, String), StoredBlob>>,
        incomplete: Mutex<HashMap<(String, String), DateTime<Utc>>>,
        upload_calls: AtomicUsize,
        fail_uploads: AtomicBool,
        fail_downloads: AtomicBool,
    }

    impl InMemoryBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn upload_count(&self) -> usize {
            self.upload_calls.load(Ordering::SeqCst)
        }

        pub fn blob_count(&self) -> usize {
            self.blobs.lock().unwrap().len()
        }

        pub fn fail_uploads(&self, fail: bool) {
            self.fail_uploads.store(fail, Ordering::SeqCst);
        }

        pub fn fail_downloads(&self, fail: bool) {
            self.fail_downloads.store(fail, Ordering::SeqCst);
        }

        pub fn get(&self, container: &str, name: &str) -> Option<StoredBlob> {
            self.blobs
                .lock()
                .unwrap()
                .get(&(container.to_string(), name.to_string()))
                .cloned()
        }

        /// Seed a blob directly, bypassing upload counting
        pub fn put(&self, container: &str, name: &str, content: &[u8], last_modified: DateTime<Utc>) {
            self.blobs.lock().unwrap().insert(
                (container.to_string(), name.to_string()),
                StoredBlob {
                    content: content.to_vec(),
                    metadata: BlobMetadata::new(),
                    last_modified,
                },
            );
        }

        /// Seed the leftover of an upload that never finished
        pub fn put_incomplete(&self, container: &str, name: &str, last_modified: DateTime<Utc>) {
            self.incomplete
                .lock()
                .unwrap()
                .insert((container.to_string(), name.to_string()), last_modified);
        }

        pub fn incomplete_count(&self) -> usize {
            self.incomplete.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BlobStore for InMemoryBlobStore {
        async fn upload(
            &self,
            content: &mut (dyn AsyncRead + Unpin + Send),
            file_name: &str,
            container: &str,
            metadata: BlobMetadata,
        ) -> Result<String, BlobError> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(BlobError::Storage("upload rejected".to_string()));
            }

            let mut bytes = Vec::new();
            content.read_to_end(&mut bytes).await?;

            let extension = std::path::Path::new(file_name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            let name = format!("{}{}", uuid::Uuid::new_v4().simple(), extension);

            self.blobs.lock().unwrap().insert(
                (container.to_string(), name.clone()),
                StoredBlob {
                    content: bytes,
                    metadata,
                    last_modified: Utc::now(),
                },
            );
            Ok(name)
        }

        async fn download(&self, name: &str, container: &str) -> Result<BlobReader, BlobError> {
            if self.fail_downloads.load(Ordering::SeqCst) {
                return Err(BlobError::Storage("download rejected".to_string()));
            }
            let blob = self.get(container, name).ok_or_else(|| BlobError::NotFound {
                container: container.to_string(),
                name: name.to_string(),
            })?;
            Ok(Box::new(std::io::Cursor::new(blob.content)))
        }

        async fn delete(&self, name: &str, container: &str) -> Result<bool, BlobError> {
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .remove(&(container.to_string(), name.to_string()))
                .is_some())
        }

        async fn get_metadata(&self, name: &str, container: &str) -> Result<BlobMetadata, BlobError> {
            self.get(container, name)
                .map(|b| b.metadata)
                .ok_or_else(|| BlobError::NotFound {
                    container: container.to_string(),
                    name: name.to_string(),
                })
        }

        async fn list(&self, container: &str) -> Result<Vec<BlobInfo>, BlobError> {
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .iter()
                .filter(|((c, _), _)| c == container)
                .map(|((_, name), blob)| BlobInfo {
                    name: name.clone(),
                    size: blob.content.len() as u64,
                    last_modified: blob.last_modified,
                })
                .collect())
        }

        async fn purge_incomplete(
            &self,
            container: &str,
            older_than: DateTime<Utc>,
        ) -> Result<usize, BlobError> {
            let mut incomplete = self.incomplete.lock().unwrap();
            let before = incomplete.len();
            incomplete.retain(|(c, _), touched| c != container || *touched >= older_than);
            Ok(before - incomplete.len())
        }
    }
}
