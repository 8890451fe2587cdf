use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::cloud::CloudStoreRegistry;
use crate::crypto::EncryptionService;
use crate::erasure::ErasureCodec;
use crate::error::StorageError;
use crate::metastore::{DataObject, GenerationRecord, MetaStore, SliceDescriptor, SliceKind};
use crate::metrics::SharedMetrics;
use crate::placement::{slice_checksum, SlicePlacementStrategy};

/// Turns whole objects into committed generations of encrypted slices spread
/// over the registry, and back.
///
/// Commits for one data id must be serialized by the caller; different ids
/// can be committed and fetched concurrently.
#[derive(Debug)]
pub struct DistributedStore {
    codec: ErasureCodec,
    encryption: EncryptionService,
    placement: SlicePlacementStrategy,
    registry: Arc<CloudStoreRegistry>,
    meta: MetaStore,
    metrics: SharedMetrics,
    extra_reads: usize,
}

impl DistributedStore {
    pub fn new(
        codec: ErasureCodec,
        registry: Arc<CloudStoreRegistry>,
        meta: MetaStore,
        metrics: SharedMetrics,
        extra_reads: usize,
    ) -> Self {
        Self {
            codec,
            encryption: EncryptionService::new(meta.clone()),
            placement: SlicePlacementStrategy::new(Arc::clone(&registry)),
            registry,
            meta,
            metrics,
            extra_reads,
        }
    }

    pub fn registry(&self) -> &Arc<CloudStoreRegistry> {
        &self.registry
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn data_object(&self, data_id: &str) -> Result<Option<DataObject>, StorageError> {
        self.meta.find_data_object(data_id)
    }

    /// Encrypts, encodes and uploads `plaintext` as a new generation of
    /// `data_id`.
    ///
    /// The generation's descriptors and key are persisted before the first
    /// upload and only flagged committed once all k + m uploads succeeded.
    /// On failure the partial generation is removed again and the previous
    /// generation stays current. Superseded generations are removed after the
    /// commit.
    pub async fn commit(&self, data_id: &str, plaintext: &[u8]) -> Result<DataObject, StorageError> {
        let generation = self.next_generation(data_id)?;
        let (key, ciphertext) = self.encryption.encrypt(data_id, generation, plaintext)?;
        let slices = self.codec.encode(&ciphertext)?.into_ordered();
        let descriptors = self
            .placement
            .place(data_id, generation, self.codec.k(), &slices)?;

        let record = GenerationRecord {
            data_id: data_id.to_string(),
            generation,
            committed: false,
            slices: descriptors,
        };
        self.meta.insert_pending_generation(&record, &key)?;

        let uploads = record.slices.iter().zip(slices).map(|(desc, slice)| async move {
            let size = slice.len() as u64;
            let result = self
                .registry
                .upload(&desc.store_id, &desc.remote_object_id, slice)
                .await;
            match &result {
                Ok(()) => {
                    self.metrics.slice_uploaded(size);
                    debug!(data_id, generation, store_id = %desc.store_id, slice = desc.slice_index, "Uploaded slice");
                }
                Err(e) => {
                    self.metrics.slice_upload_error();
                    warn!(data_id, generation, store_id = %desc.store_id, slice = desc.slice_index, "Slice upload failed: {}", e);
                }
            }
            result
        });
        let failure = join_all(uploads).await.into_iter().find_map(Result::err);

        if let Some(err) = failure {
            if let Err(e) = self.discard_generation(&record).await {
                warn!(data_id, generation, "Failed to clean up uncommitted generation: {}", e);
            }
            return Err(err);
        }

        let object = DataObject {
            data_id: data_id.to_string(),
            size: plaintext.len() as u64,
            encoded_size: ciphertext.len() as u64,
            generation,
            k: self.codec.k() as u32,
            m: self.codec.m() as u32,
            committed_at: Utc::now().timestamp_millis(),
        };
        self.meta.commit_generation(&object)?;
        self.metrics.generation_committed();
        info!(data_id, generation, size = object.size, "Committed generation");

        for old in self.meta.generations(data_id)? {
            if old.generation != generation {
                if let Err(e) = self.discard_generation(&old).await {
                    warn!(data_id, generation = old.generation, "Failed to remove superseded generation: {}", e);
                }
            }
        }

        Ok(object)
    }

    /// Downloads at least k slices of the current generation and returns the
    /// decrypted content.
    ///
    /// Downloads race: `k + extra_reads` start at once and every failure
    /// starts a download of a remaining slice. Once k slices arrived the
    /// others are dropped.
    pub async fn fetch(&self, data_id: &str) -> Result<(DataObject, Vec<u8>), StorageError> {
        let object = self
            .meta
            .find_data_object(data_id)?
            .ok_or_else(|| StorageError::NotFound(format!("data '{}'", data_id)))?;
        let record = self
            .meta
            .find_generation(data_id, object.generation)?
            .ok_or_else(|| {
                StorageError::Metadata(format!(
                    "No slice descriptors for data '{}' generation {}",
                    data_id, object.generation
                ))
            })?;

        let k = object.k as usize;
        let m = object.m as usize;
        let codec = if k == self.codec.k() && m == self.codec.m() {
            self.codec.clone()
        } else {
            ErasureCodec::new(k, m, crate::erasure::DEFAULT_ALIGNMENT)?
        };

        // Data slices on reachable stores first: they avoid a matrix inversion.
        let mut ordered: Vec<&SliceDescriptor> = record.slices.iter().collect();
        ordered.sort_by_key(|d| {
            (
                !self.registry.is_reachable(&d.store_id),
                d.kind == SliceKind::Coding,
                d.slice_index,
            )
        });
        let mut remaining = ordered.into_iter();

        let mut in_flight = FuturesUnordered::new();
        for desc in remaining.by_ref().take(k + self.extra_reads) {
            in_flight.push(self.fetch_slice(desc));
        }

        let mut data: Vec<Option<Bytes>> = vec![None; k];
        let mut coding: Vec<Option<Bytes>> = vec![None; m];
        let mut received = 0;
        while let Some((desc, result)) = in_flight.next().await {
            match result {
                Ok(slice) => {
                    let index = desc.slice_index as usize;
                    if index < k {
                        data[index] = Some(slice);
                    } else if index < k + m {
                        coding[index - k] = Some(slice);
                    }
                    received += 1;
                    if received == k {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.slice_download_error();
                    warn!(data_id, generation = desc.generation, store_id = %desc.store_id, slice = desc.slice_index, "Slice unavailable: {}", e);
                    if let Some(next) = remaining.next() {
                        in_flight.push(self.fetch_slice(next));
                    }
                }
            }
        }
        drop(in_flight);

        if received < k {
            return Err(StorageError::Decoding(format!(
                "only {} of the {} slices needed for data '{}' are retrievable",
                received, k, data_id
            )));
        }

        let ciphertext = codec.decode(object.encoded_size as usize, &data, &coding)?;
        let plaintext = self
            .encryption
            .decrypt(data_id, object.generation, &ciphertext)?;
        if plaintext.len() as u64 != object.size {
            return Err(StorageError::Decoding(format!(
                "data '{}' decoded to {} bytes, expected {}",
                data_id,
                plaintext.len(),
                object.size
            )));
        }
        debug!(data_id, generation = object.generation, "Reconstructed data");
        Ok((object, plaintext))
    }

    /// Deletes every slice, descriptor and key of `data_id`. Slice deletes
    /// are best effort. Returns whether anything was stored.
    pub async fn delete(&self, data_id: &str) -> Result<bool, StorageError> {
        let generations = self.meta.generations(data_id)?;
        let existed = self.meta.find_data_object(data_id)?.is_some() || !generations.is_empty();
        for record in &generations {
            self.discard_generation(record).await?;
        }
        self.meta.delete_data_object(data_id)?;
        if existed {
            info!(data_id, "Deleted data");
        }
        Ok(existed)
    }

    /// Removes generations that were persisted but never committed, left over
    /// by an interrupted commit. Must run before any commit starts.
    pub async fn recover_pending(&self) -> Result<usize, StorageError> {
        let pending = self.meta.pending_generations()?;
        for record in &pending {
            info!(data_id = %record.data_id, generation = record.generation, "Removing uncommitted generation");
            self.discard_generation(record).await?;
        }
        Ok(pending.len())
    }

    fn next_generation(&self, data_id: &str) -> Result<u64, StorageError> {
        let current = self
            .meta
            .find_data_object(data_id)?
            .map(|o| o.generation)
            .unwrap_or(0);
        let recorded = self
            .meta
            .generations(data_id)?
            .iter()
            .map(|g| g.generation)
            .max()
            .unwrap_or(0);
        Ok(current.max(recorded) + 1)
    }

    // Best-effort delete of the slices, then drop descriptors and key.
    async fn discard_generation(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        let deletes = record.slices.iter().map(|desc| async move {
            let result = self
                .registry
                .delete(&desc.store_id, &desc.remote_object_id)
                .await;
            if let Err(e) = result {
                warn!(
                    data_id = %desc.data_id,
                    generation = desc.generation,
                    store_id = %desc.store_id,
                    "Failed to delete slice, it is orphaned: {}",
                    e
                );
            }
        });
        join_all(deletes).await;
        self.meta.remove_generation(&record.data_id, record.generation)
    }

    async fn fetch_slice<'a>(
        &self,
        desc: &'a SliceDescriptor,
    ) -> (&'a SliceDescriptor, Result<Bytes, StorageError>) {
        let result = self
            .registry
            .download(&desc.store_id, &desc.remote_object_id)
            .await
            .and_then(|slice| {
                if slice.len() as u64 != desc.size || slice_checksum(&slice) != desc.checksum {
                    Err(StorageError::Decoding(format!(
                        "slice {} of data '{}' failed its checksum",
                        desc.slice_index, desc.data_id
                    )))
                } else {
                    Ok(slice)
                }
            });
        if let Ok(slice) = &result {
            self.metrics.slice_downloaded(slice.len() as u64);
        }
        (desc, result)
    }
}
