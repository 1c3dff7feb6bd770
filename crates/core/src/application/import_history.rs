// Import History Use Case
// Card check -> materialize -> hash -> dedupe -> upload -> insert batch

use crate::application::events::DomainEventDispatcher;
use crate::domain::{Card, ImportBatch};
use crate::error::{AppError, Result};
use crate::port::entity_store::fields;
use crate::port::{BlobMetadata, BlobStore, EntityStore, IdProvider, IdentityContext, TimeProvider};
use crate::repository::{Persist, ProtectionRegistry, SecureCommandRepo, SecureQueryRepo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Cursor, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Container that receives every uploaded history file
pub const IMPORT_CONTAINER: &str = "transport-import";

/// Largest forward-only upload kept in memory (16 MiB)
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 16 * 1024 * 1024;

pub const DUPLICATE_UPLOAD_MESSAGE: &str = "This file has already been uploaded.";

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub container: String,
    pub max_buffer_bytes: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            container: IMPORT_CONTAINER.to_string(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Readable and rewindable content
pub trait SeekableSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> SeekableSource for T {}

/// Uploaded file body as handed over by the transport
pub enum ImportContent {
    /// Rewound and read in place
    Seekable(Box<dyn SeekableSource>),
    /// Forward-only; buffered in memory up to the configured cap
    Stream(Box<dyn AsyncRead + Unpin + Send>),
}

pub struct ImportHistoryRequest {
    pub card_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub content: ImportContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportHistoryResponse {
    pub import_batch_id: Uuid,
    pub blob_name: String,
    pub sha256: String,
}

pub struct ImportHistoryService {
    store: Arc<dyn EntityStore>,
    dispatcher: Arc<DomainEventDispatcher>,
    protections: Arc<ProtectionRegistry>,
    blobs: Arc<dyn BlobStore>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    settings: ImportSettings,
}

impl ImportHistoryService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        dispatcher: Arc<DomainEventDispatcher>,
        protections: Arc<ProtectionRegistry>,
        blobs: Arc<dyn BlobStore>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            protections,
            blobs,
            id_provider,
            time_provider,
            settings,
        }
    }

    /// Import one history file for a card owned by `identity`
    ///
    /// Steps run strictly in order. A duplicate is rejected before anything is
    /// uploaded, and the batch row is only written once the blob exists.
    ///
    /// Domain events are dispatched after the commit. If that dispatch fails the
    /// import still succeeds: the batch stays `Uploaded` until the stalled batch
    /// sweep queues it, and a retry by the caller would only hit the duplicate check.
    ///
    /// # Errors
    /// - `Validation` for a blank file name, an empty file or an oversized stream
    /// - `NotFound` when the card is absent or not visible to the caller
    /// - `Conflict` when the same content was imported before
    /// - `Cancelled` when `cancel` fires before the batch is committed
    pub async fn import(
        &self,
        identity: Arc<dyn IdentityContext>,
        request: ImportHistoryRequest,
        cancel: &CancellationToken,
    ) -> Result<ImportHistoryResponse> {
        validate_request(&request)?;
        let ImportHistoryRequest {
            card_id,
            file_name,
            content_type,
            content,
        } = request;

        let queries = SecureQueryRepo::new(
            self.store.clone(),
            identity.clone(),
            self.protections.clone(),
        );

        let card = queries.secure::<Card>()?.by_id(card_id);
        if !queries.exists(&card).await? {
            return Err(AppError::NotFound(format!(
                "Card with ID {} does not exist.",
                card_id
            )));
        }

        let mut source = materialize(content, self.settings.max_buffer_bytes, cancel).await?;
        let (sha256, size) = hash_content(&mut source, cancel).await?;
        if size == 0 {
            return Err(AppError::Validation("The uploaded file is empty.".to_string()));
        }

        // Global lookup: the same file may not be imported twice, whoever owns it
        let duplicate = queries
            .queryable::<ImportBatch>()
            .filter_eq(fields::import_batch::SHA256, sha256.clone());
        if queries.exists(&duplicate).await? {
            info!(card_id = %card_id, sha256 = %sha256, "Rejected duplicate history upload");
            return Err(AppError::Conflict(DUPLICATE_UPLOAD_MESSAGE.to_string()));
        }

        source.seek(SeekFrom::Start(0)).await?;

        let now = self.time_provider.now();
        let mut metadata = BlobMetadata::new();
        metadata.insert("fileName".to_string(), file_name.clone());
        metadata.insert("contentType".to_string(), content_type);
        metadata.insert("fileSize".to_string(), size.to_string());
        metadata.insert("cardId".to_string(), card_id.to_string());
        metadata.insert("uploadedAt".to_string(), now.to_rfc3339());

        let container = self.settings.container.as_str();
        let blob_name = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            uploaded = self.blobs.upload(&mut source, &file_name, container, metadata) => uploaded?,
        };

        if cancel.is_cancelled() {
            self.discard_blob(&blob_name).await;
            return Err(AppError::Cancelled);
        }

        let batch = ImportBatch::create(
            self.id_provider.generate_id(),
            card_id,
            container,
            blob_name.clone(),
            sha256.clone(),
            now,
        )?;
        let batch_id = batch.id();

        let mut commands = SecureCommandRepo::new(
            self.store.clone(),
            self.dispatcher.clone(),
            identity,
            self.protections.clone(),
        );
        if let Err(e) = commands.insert(batch, Persist::Deferred).await {
            self.discard_blob(&blob_name).await;
            return Err(e);
        }
        if let Err(e) = commands.save().await {
            // Staged changes survive only a failed commit; otherwise the row exists
            if commands.pending() > 0 {
                self.discard_blob(&blob_name).await;
                return Err(match e {
                    AppError::Conflict(_) => AppError::Conflict(DUPLICATE_UPLOAD_MESSAGE.to_string()),
                    other => other,
                });
            }
            warn!(
                batch_id = %batch_id,
                error = %e,
                "Batch committed but its created event was not dispatched; the stalled batch sweep will queue it"
            );
        }

        info!(
            batch_id = %batch_id,
            card_id = %card_id,
            blob_name = %blob_name,
            size_bytes = size,
            "Imported transaction history"
        );

        Ok(ImportHistoryResponse {
            import_batch_id: batch_id,
            blob_name,
            sha256,
        })
    }

    async fn discard_blob(&self, blob_name: &str) {
        match self.blobs.delete(blob_name, &self.settings.container).await {
            Ok(_) => info!(blob_name = %blob_name, "Discarded uploaded blob"),
            Err(e) => warn!(
                blob_name = %blob_name,
                error = %e,
                "Failed to discard uploaded blob; the orphan sweep will remove it"
            ),
        }
    }
}

fn validate_request(request: &ImportHistoryRequest) -> Result<()> {
    if request.card_id.is_nil() {
        return Err(AppError::Validation("Card ID cannot be empty.".to_string()));
    }
    if request.file_name.trim().is_empty() {
        return Err(AppError::Validation("File name cannot be empty.".to_string()));
    }
    Ok(())
}

async fn materialize(
    content: ImportContent,
    max_bytes: usize,
    cancel: &CancellationToken,
) -> Result<Box<dyn SeekableSource>> {
    match content {
        ImportContent::Seekable(source) => Ok(source),
        ImportContent::Stream(mut stream) => {
            let mut buffer = Vec::with_capacity(READ_CHUNK_BYTES.min(max_bytes));
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            loop {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                let read = stream.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                if buffer.len() + read > max_bytes {
                    return Err(AppError::Validation(format!(
                        "The uploaded file exceeds the {} byte limit.",
                        max_bytes
                    )));
                }
                buffer.extend_from_slice(&chunk[..read]);
            }
            Ok(Box::new(Cursor::new(buffer)))
        }
    }
}

/// Uppercase hex SHA-256 of the whole source, plus its length
async fn hash_content(
    source: &mut Box<dyn SeekableSource>,
    cancel: &CancellationToken,
) -> Result<(String, u64)> {
    source.seek(SeekFrom::Start(0)).await?;

    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut size = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let read = source.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
        size += read as u64;
    }

    Ok((hex::encode_upper(hasher.finalize()), size))
}
