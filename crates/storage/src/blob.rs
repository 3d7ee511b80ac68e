//! In-memory blob store.

use dashmap::DashMap;
use sop_core::{BlobStore, BlobsIds, BlobsPayload, Result, Uid};
use std::collections::HashMap;

/// Content-addressed in-memory blob storage.
///
/// Writes are idempotent overwrites for the same ID; removes tolerate
/// missing IDs. Both properties are required by the commit protocol's
/// rollback paths, which may re-run.
#[derive(Default)]
pub struct MemoryBlobStore {
    tables: DashMap<String, HashMap<Uid, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty blob store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs across all tables. Test observability.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.value().len()).sum()
    }

    /// Whether no blob is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a specific blob exists. Test observability.
    pub fn contains(&self, blob_table: &str, blob_id: Uid) -> bool {
        self.tables
            .get(blob_table)
            .map(|t| t.contains_key(&blob_id))
            .unwrap_or(false)
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_one(&self, blob_table: &str, blob_id: Uid) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .get(blob_table)
            .and_then(|t| t.get(&blob_id).cloned()))
    }

    fn add(&self, blobs: Vec<BlobsPayload>) -> Result<()> {
        for payload in blobs {
            let mut table = self.tables.entry(payload.blob_table).or_default();
            for (id, bytes) in payload.blobs {
                table.insert(id, bytes);
            }
        }
        Ok(())
    }

    fn update(&self, blobs: Vec<BlobsPayload>) -> Result<()> {
        // Same semantics as add: overwrite by ID.
        self.add(blobs)
    }

    fn remove(&self, blobs: Vec<BlobsIds>) -> Result<()> {
        for payload in blobs {
            if let Some(mut table) = self.tables.get_mut(&payload.blob_table) {
                for id in payload.ids {
                    table.remove(&id);
                }
            }
        }
        Ok(())
    }
}
