//! Persistent storage using sled
//!
//! Write-through mirror of the in-memory document store. The in-memory map
//! stays authoritative while the process runs; sled only matters at startup.

use dds_core::types::*;
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Metadata key: highest version issued by the local clock
pub const META_CLOCK_FLOOR: &str = "clock_floor";
/// Metadata key: Ed25519 seed of the node signing key
pub const META_SIGNING_SEED: &str = "signing_seed";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Corrupt metadata value for {0}")]
    CorruptMetadata(String),
}

/// Storage backend for ddsd
pub struct Storage {
    db: Db,
    /// Document tree: key digest -> Document
    documents: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway storage that never touches the data directory
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let documents = db.open_tree("documents")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            documents,
            metadata,
        })
    }

    /// Store a document, replacing any previous version
    pub fn put_document(&self, document: &Document) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(document)?;
        self.documents.insert(document.key.digest(), value)?;
        Ok(())
    }

    /// Remove a document
    pub fn remove_document(&self, key: &DocumentKey) -> Result<(), StorageError> {
        self.documents.remove(key.digest())?;
        Ok(())
    }

    /// Get a document by key
    pub fn get_document(&self, key: &DocumentKey) -> Result<Option<Document>, StorageError> {
        match self.documents.get(key.digest())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get all documents (for iteration)
    pub fn all_documents(&self) -> impl Iterator<Item = Result<Document, StorageError>> + '_ {
        self.documents.iter().map(|result| {
            let (_, bytes) = result?;
            let document: Document = postcard::from_bytes(&bytes)?;
            Ok(document)
        })
    }

    /// Count documents
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Store a u64 metadata value
    pub fn put_u64(&self, key: &str, value: u64) -> Result<(), StorageError> {
        self.put_metadata(key, &value.to_le_bytes())
    }

    /// Get a u64 metadata value
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, StorageError> {
        match self.get_metadata(key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::CorruptMetadata(key.to_string()))?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
