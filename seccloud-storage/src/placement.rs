use std::cmp::Reverse;
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::debug;
use uuid::Uuid;

use crate::cloud::CloudStoreRegistry;
use crate::error::StorageError;
use crate::metastore::{SliceDescriptor, SliceKind};

/// Hex MD5 of a slice, as stored in its descriptor.
pub fn slice_checksum(slice: &[u8]) -> String {
    faster_hex::hex_string(&Md5::digest(slice))
}

/// Assigns every slice of a generation to its own reachable store.
#[derive(Debug, Clone)]
pub struct SlicePlacementStrategy {
    registry: Arc<CloudStoreRegistry>,
}

impl SlicePlacementStrategy {
    pub fn new(registry: Arc<CloudStoreRegistry>) -> Self {
        Self { registry }
    }

    /// Builds one descriptor per slice (`k` data slices first, then coding
    /// slices), each on a distinct store.
    ///
    /// Stores with fewer recent assignments come first, then those with the
    /// most free space, then the least recently written to.
    pub fn place(
        &self,
        data_id: &str,
        generation: u64,
        k: usize,
        slices: &[Bytes],
    ) -> Result<Vec<SliceDescriptor>, StorageError> {
        let required = slices.len();
        let slice_size = slices.first().map(|s| s.len() as u64).unwrap_or(0);

        let mut candidates: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|h| h.reachable && h.available_space >= slice_size)
            .collect();
        if candidates.len() < required {
            return Err(StorageError::InsufficientStores {
                required,
                available: candidates.len(),
            });
        }

        candidates.sort_by(|a, b| {
            (a.assignments, Reverse(a.available_space), a.last_upload, &a.id).cmp(&(
                b.assignments,
                Reverse(b.available_space),
                b.last_upload,
                &b.id,
            ))
        });

        let descriptors: Vec<_> = slices
            .iter()
            .zip(candidates)
            .enumerate()
            .map(|(index, (slice, store))| {
                self.registry.record_assignment(&store.id);
                SliceDescriptor {
                    data_id: data_id.to_string(),
                    generation,
                    slice_index: index as u32,
                    kind: if index < k {
                        SliceKind::Data
                    } else {
                        SliceKind::Coding
                    },
                    store_id: store.id,
                    remote_object_id: Uuid::new_v4().to_string(),
                    size: slice.len() as u64,
                    checksum: slice_checksum(slice),
                }
            })
            .collect();

        debug!(
            data_id,
            generation,
            stores = ?descriptors.iter().map(|d| d.store_id.as_str()).collect::<Vec<_>>(),
            "Placed slices"
        );
        Ok(descriptors)
    }
}
