//! Chunked file transfers.
//!
//! Two event types on two related streams: `file:metadata` on
//! `files:main` announces the transfer and carries a fresh per-file
//! AES-256 key; `file:chunk` events on `files:main:<file_id>` carry the
//! data, doubly enveloped — chunk bytes under the per-file key, the
//! whole payload under the shared key like every other event.
//!
//! A hash mismatch during reassembly is fatal to the transfer, never to
//! the session; intact chunks and the offending event are all retained
//! for diagnosis.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::{stream, StreamExt};
use tracing::{debug, info, warn};

use pb_crypto::{aead, hash};
use pb_proto::{
    event::streams,
    payload::{FileChunkPayload, FileMetadataPayload},
    Event, EventKind, EventPayload,
};

use crate::{context::Shared, error::SyncError, subscribers::Subscription};

/// Rough ciphertext expansion of the double envelope (two AEAD passes,
/// two base64 passes) — used only for the capacity pre-check.
const ENVELOPE_OVERHEAD_NUM: u64 = 2;

#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
}

pub struct Files {
    shared: Arc<Shared>,
}

impl Files {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Upload a file: one metadata event, then every chunk, at most
    /// `parallel_chunks` in flight. Failed chunks are retried once; a
    /// chunk that fails twice aborts the transfer.
    pub async fn send_file(
        &self,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<FileTransfer, SyncError> {
        let config = &self.shared.config;
        if bytes.is_empty() {
            return Err(SyncError::Validation("empty file".into()));
        }
        if bytes.len() as u64 > config.max_file_bytes {
            return Err(SyncError::Validation(format!(
                "file exceeds {} byte ceiling",
                config.max_file_bytes
            )));
        }

        let chunk_size = config.chunk_size_bytes.max(1);
        let total_chunks = bytes.len().div_ceil(chunk_size) as u32;
        self.check_capacity(bytes.len() as u64, total_chunks).await?;

        let file_id = uuid::Uuid::new_v4().to_string();
        let file_key = aead::generate_key();

        let metadata = EventPayload::FileMetadata(FileMetadataPayload {
            file_id: file_id.clone(),
            name: name.to_string(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
            total_chunks,
            encryption_key_b64: STANDARD.encode(file_key),
        });
        self.shared
            .publish(streams::FILES.to_string(), metadata, None)
            .await?;

        info!(file_id, total_chunks, size = bytes.len(), "file transfer started");

        let chunk_stream = streams::file_chunks(&file_id);
        let send_chunk = |index: u32| {
            let shared = self.shared.clone();
            let stream_id = chunk_stream.clone();
            let file_id = file_id.clone();
            let chunk = &bytes[index as usize * chunk_size
                ..((index as usize + 1) * chunk_size).min(bytes.len())];
            async move {
                let result =
                    Self::publish_chunk(&shared, &stream_id, &file_id, &file_key, index, total_chunks, chunk)
                        .await;
                (index, result)
            }
        };

        let results: Vec<(u32, Result<Event, SyncError>)> = stream::iter(0..total_chunks)
            .map(send_chunk)
            .buffer_unordered(config.parallel_chunks.max(1))
            .collect()
            .await;

        // One retry per failed chunk; any chunk failing twice aborts.
        for (index, result) in results {
            if let Err(first) = result {
                warn!(index, error = %first, "chunk failed — retrying once");
                let chunk = &bytes[index as usize * chunk_size
                    ..((index as usize + 1) * chunk_size).min(bytes.len())];
                Self::publish_chunk(
                    &self.shared,
                    &chunk_stream,
                    &file_id,
                    &file_key,
                    index,
                    total_chunks,
                    chunk,
                )
                .await?;
            }
        }

        Ok(FileTransfer {
            file_id,
            name: name.to_string(),
            size: bytes.len() as u64,
            total_chunks,
        })
    }

    async fn publish_chunk(
        shared: &Arc<Shared>,
        stream_id: &str,
        file_id: &str,
        file_key: &[u8; 32],
        index: u32,
        total_chunks: u32,
        chunk: &[u8],
    ) -> Result<Event, SyncError> {
        let data = aead::encrypt_b64(file_key, chunk)?;
        let payload = EventPayload::FileChunk(FileChunkPayload {
            file_id: file_id.to_string(),
            chunk_index: index,
            total_chunks,
            data,
            hash: hash::chunk_hash(chunk),
        });
        shared.publish(stream_id.to_string(), payload, None).await
    }

    async fn check_capacity(&self, file_bytes: u64, total_chunks: u32) -> Result<(), SyncError> {
        let user_id = self.shared.user_id()?;
        let device = self.shared.device();
        let last_ack = self.shared.settings.last_ack_device_seq().await?;
        let stats = self
            .shared
            .log
            .pending_stats(&user_id, &device.device_id, last_ack)
            .await?;

        let projected_count = stats.count + total_chunks as u64 + 1;
        let projected_bytes = stats.bytes + file_bytes * ENVELOPE_OVERHEAD_NUM;
        if projected_count > self.shared.config.queue_max_count
            || projected_bytes > self.shared.config.queue_max_bytes
        {
            return Err(SyncError::QueueBounded);
        }
        Ok(())
    }

    /// Every announced transfer visible in the local log.
    pub async fn list(&self) -> Result<Vec<FileMetadataPayload>, SyncError> {
        let mut out = Vec::new();
        for stored in self.shared.log.stream_events(streams::FILES).await? {
            if stored.payload_deleted || stored.event.kind != EventKind::FileMetadata {
                continue;
            }
            match self.shared.open_payload(&stored.event).await {
                Ok(EventPayload::FileMetadata(meta)) => out.push(meta),
                Ok(_) => continue,
                Err(SyncError::DecryptFailed) => {
                    debug!(event_id = %stored.event.event_id, "undecryptable file metadata skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn metadata_for(&self, file_id: &str) -> Result<FileMetadataPayload, SyncError> {
        self.list()
            .await?
            .into_iter()
            .find(|meta| meta.file_id == file_id)
            .ok_or_else(|| SyncError::Validation(format!("unknown file {file_id}")))
    }

    /// Reassemble a received file: collect chunks, verify every per-chunk
    /// hash, decrypt under the per-file key, concatenate in index order.
    pub async fn reassemble(&self, file_id: &str) -> Result<Vec<u8>, SyncError> {
        let meta = self.metadata_for(file_id).await?;
        let file_key: [u8; 32] = STANDARD
            .decode(&meta.encryption_key_b64)
            .map_err(|_| SyncError::IntegrityFailed("bad file key encoding".into()))?
            .try_into()
            .map_err(|_| SyncError::IntegrityFailed("bad file key length".into()))?;

        let mut chunks: HashMap<u32, FileChunkPayload> = HashMap::new();
        for stored in self
            .shared
            .log
            .stream_events(&streams::file_chunks(file_id))
            .await?
        {
            if stored.payload_deleted || stored.event.kind != EventKind::FileChunk {
                continue;
            }
            match self.shared.open_payload(&stored.event).await {
                Ok(EventPayload::FileChunk(chunk)) => {
                    // First copy wins; replays never overwrite.
                    chunks.entry(chunk.chunk_index).or_insert(chunk);
                }
                Ok(_) => continue,
                Err(SyncError::DecryptFailed) => {
                    debug!(event_id = %stored.event.event_id, "undecryptable chunk skipped");
                }
                Err(e) => return Err(e),
            }
        }

        let mut out = Vec::with_capacity(meta.size as usize);
        for index in 0..meta.total_chunks {
            let chunk = chunks.get(&index).ok_or_else(|| {
                SyncError::Validation(format!("missing chunk {index} of {}", meta.total_chunks))
            })?;
            let ciphertext = STANDARD
                .decode(&chunk.data)
                .map_err(|_| SyncError::IntegrityFailed(format!("chunk {index}: bad encoding")))?;
            let plaintext = aead::decrypt(&file_key, &ciphertext)
                .map_err(|_| SyncError::IntegrityFailed(format!("chunk {index}: decrypt failed")))?;
            if hash::chunk_hash(&plaintext) != chunk.hash {
                return Err(SyncError::IntegrityFailed(format!(
                    "chunk {index}: hash mismatch"
                )));
            }
            out.extend_from_slice(&plaintext);
        }

        if out.len() as u64 != meta.size {
            return Err(SyncError::IntegrityFailed(format!(
                "reassembled {} bytes, metadata says {}",
                out.len(),
                meta.size
            )));
        }
        Ok(out)
    }

    pub fn observe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.shared
            .subscribers
            .subscribe_events(Some(streams::FILES.to_string()), handler)
    }
}
