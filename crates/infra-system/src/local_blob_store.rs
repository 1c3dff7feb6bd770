// Local filesystem BlobStore
// Containers are directories under the root; metadata lives in a JSON sidecar

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};
use transit_core::port::{BlobError, BlobInfo, BlobMetadata, BlobReader, BlobStore, TimeProvider};
use uuid::Uuid;

const METADATA_SUFFIX: &str = ".meta.json";
const PARTIAL_SUFFIX: &str = ".partial";

pub const ORIGINAL_FILENAME_KEY: &str = "original-filename";
pub const UPLOAD_TIMESTAMP_KEY: &str = "upload-timestamp";
pub const CONTENT_TYPE_KEY: &str = "content-type";

/// MIME type for a lowercased extension such as `.csv`
pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        ".csv" => "text/csv",
        ".json" => "application/json",
        ".txt" => "text/plain",
        ".pdf" => "application/pdf",
        ".xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn normalize_extension(extension: &str) -> String {
    let lower = extension.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Reject anything that could escape the root directory
fn check_segment(value: &str, what: &str) -> Result<(), BlobError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BlobError::Storage(format!("Invalid {} '{}'", what, value)));
    }
    Ok(())
}

fn not_found(container: &str, name: &str) -> BlobError {
    BlobError::NotFound {
        container: container.to_string(),
        name: name.to_string(),
    }
}

pub struct LocalBlobStore {
    root: PathBuf,
    allowed_extensions: Vec<String>,
    time_provider: Arc<dyn TimeProvider>,
}

impl LocalBlobStore {
    /// `allowed_extensions` accepts `csv` or `.csv`, case-insensitive
    pub fn new(
        root: impl Into<PathBuf>,
        allowed_extensions: &[String],
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            root: root.into(),
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
            time_provider,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf, BlobError> {
        check_segment(container, "container")?;
        Ok(self.root.join(container))
    }

    fn blob_path(&self, container: &str, name: &str) -> Result<PathBuf, BlobError> {
        check_segment(name, "blob name")?;
        Ok(self.container_dir(container)?.join(name))
    }

    fn metadata_path(blob_path: &Path) -> PathBuf {
        let mut path = blob_path.as_os_str().to_owned();
        path.push(METADATA_SUFFIX);
        PathBuf::from(path)
    }

    fn check_extension(&self, extension: &str) -> Result<(), BlobError> {
        if self.allowed_extensions.iter().any(|e| e == extension) {
            return Ok(());
        }
        Err(BlobError::ExtensionNotAllowed {
            extension: extension.to_string(),
            allowed: self.allowed_extensions.join(", "),
        })
    }

    async fn write_content(
        path: &Path,
        content: &mut (dyn AsyncRead + Unpin + Send),
    ) -> std::io::Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        content: &mut (dyn AsyncRead + Unpin + Send),
        file_name: &str,
        container: &str,
        mut metadata: BlobMetadata,
    ) -> Result<String, BlobError> {
        let extension = extension_of(file_name);
        self.check_extension(&extension)?;

        let dir = self.container_dir(container)?;
        tokio::fs::create_dir_all(&dir).await?;

        let name = format!("{}{}", Uuid::new_v4().simple(), extension);
        let path = dir.join(&name);
        let partial = dir.join(format!("{}{}", name, PARTIAL_SUFFIX));

        // Readers never see a half-written blob
        let size = match Self::write_content(&partial, content).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };

        metadata.insert(ORIGINAL_FILENAME_KEY.to_string(), file_name.to_string());
        metadata.insert(
            UPLOAD_TIMESTAMP_KEY.to_string(),
            self.time_provider.now().to_rfc3339(),
        );
        metadata
            .entry(CONTENT_TYPE_KEY.to_string())
            .or_insert_with(|| content_type_for(&extension).to_string());

        let sidecar = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| BlobError::Storage(format!("Cannot encode metadata: {}", e)))?;
        tokio::fs::write(Self::metadata_path(&path), sidecar).await?;
        tokio::fs::rename(&partial, &path).await?;

        debug!(container = %container, blob = %name, size = size, "Blob uploaded");
        Ok(name)
    }

    async fn download(&self, name: &str, container: &str) -> Result<BlobReader, BlobError> {
        let path = self.blob_path(container, name)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(container, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str, container: &str) -> Result<bool, BlobError> {
        let path = self.blob_path(container, name)?;
        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = tokio::fs::remove_file(Self::metadata_path(&path)).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(container = %container, blob = %name, error = %e, "Failed to remove metadata sidecar");
            }
        }
        Ok(existed)
    }

    async fn get_metadata(&self, name: &str, container: &str) -> Result<BlobMetadata, BlobError> {
        let path = self.blob_path(container, name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(not_found(container, name));
        }

        match tokio::fs::read(Self::metadata_path(&path)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| BlobError::Storage(format!("Corrupt metadata for {}: {}", name, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BlobMetadata::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, container: &str) -> Result<Vec<BlobInfo>, BlobError> {
        let dir = self.container_dir(container)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(METADATA_SUFFIX) || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            blobs.push(BlobInfo {
                name,
                size: meta.len(),
                last_modified: DateTime::<Utc>::from(meta.modified()?),
            });
        }
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    /// Removes `.partial` files and sidecars whose blob never landed
    async fn purge_incomplete(
        &self,
        container: &str,
        older_than: DateTime<Utc>,
    ) -> Result<usize, BlobError> {
        let dir = self.container_dir(container)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let incomplete = if name.ends_with(PARTIAL_SUFFIX) {
                true
            } else if let Some(blob) = name.strip_suffix(METADATA_SUFFIX) {
                !tokio::fs::try_exists(dir.join(blob)).await?
            } else {
                false
            };
            if !incomplete {
                continue;
            }

            let meta = entry.metadata().await?;
            if !meta.is_file() || DateTime::<Utc>::from(meta.modified()?) >= older_than {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(container = %container, file = %name, "Removed unfinished upload");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use transit_core::port::time_provider::SystemTimeProvider;

    fn store(root: &Path) -> LocalBlobStore {
        LocalBlobStore::new(root, &["CSV".to_string()], Arc::new(SystemTimeProvider))
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut content: &[u8] = b"Sequence Number,Site\n1,Sandton\n";
        let mut metadata = BlobMetadata::new();
        metadata.insert("cardId".to_string(), "abc".to_string());

        let name = store
            .upload(&mut content, "History.CSV", "transport-import", metadata)
            .await
            .unwrap();
        assert!(name.ends_with(".csv"));
        assert!(!name.contains('-'));
        assert_eq!(name.len(), 32 + ".csv".len());

        let mut reader = store.download(&name, "transport-import").await.unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"Sequence Number,Site\n1,Sandton\n");

        let meta = store.get_metadata(&name, "transport-import").await.unwrap();
        assert_eq!(meta["cardId"], "abc");
        assert_eq!(meta[ORIGINAL_FILENAME_KEY], "History.CSV");
        assert_eq!(meta[CONTENT_TYPE_KEY], "text/csv");
        assert!(meta.contains_key(UPLOAD_TIMESTAMP_KEY));

        let listed = store.list("transport-import").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, name);
        assert_eq!(listed[0].size, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_extension_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut content: &[u8] = b"MZ";
        let err = store
            .upload(&mut content, "payload.exe", "transport-import", BlobMetadata::new())
            .await
            .unwrap_err();
        match err {
            BlobError::ExtensionNotAllowed { extension, allowed } => {
                assert_eq!(extension, ".exe");
                assert_eq!(allowed, ".csv");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(store.list("transport-import").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(matches!(
            store.download("nope.csv", "transport-import").await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_metadata("nope.csv", "transport-import").await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(!store.delete("nope.csv", "transport-import").await.unwrap());
        assert!(store.list("never-created").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_blob_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut content: &[u8] = b"a,b\n";
        let name = store
            .upload(&mut content, "h.csv", "transport-import", BlobMetadata::new())
            .await
            .unwrap();

        assert!(store.delete(&name, "transport-import").await.unwrap());
        let remaining = std::fs::read_dir(dir.path().join("transport-import"))
            .unwrap()
            .count();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_purge_incomplete_removes_stale_leftovers_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let container = "transport-import";

        let mut content: &[u8] = b"a,b\n";
        let kept = store
            .upload(&mut content, "h.csv", container, BlobMetadata::new())
            .await
            .unwrap();
        let container_dir = dir.path().join(container);
        std::fs::write(container_dir.join("cancelled.csv.partial"), b"a,").unwrap();
        std::fs::write(container_dir.join("lost.csv.meta.json"), b"{}").unwrap();

        // Still inside the grace period
        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.purge_incomplete(container, an_hour_ago).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.purge_incomplete(container, later).await.unwrap(), 2);

        let mut remaining: Vec<String> = std::fs::read_dir(&container_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![kept.clone(), format!("{}{}", kept, METADATA_SUFFIX)]);
        assert_eq!(store.purge_incomplete("never-created", later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(matches!(
            store.download("../secret.csv", "transport-import").await,
            Err(BlobError::Storage(_))
        ));
        assert!(matches!(store.list("..").await, Err(BlobError::Storage(_))));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(".csv"), "text/csv");
        assert_eq!(content_type_for(".pdf"), "application/pdf");
        assert_eq!(content_type_for(".bin"), "application/octet-stream");
    }
}
