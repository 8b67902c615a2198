//! Durable artifact store for a fitted model and its index.
//!
//! One redb file holds the latest [`EmbeddingModel`] and the latest
//! [`VectorIndex`] generation. Vectors are stored already normalised, as raw
//! little-endian `f32` bytes keyed by index position, so a reload restores
//! the exact same index without re-embedding anything.

use crate::pipeline::EmbeddingModel;
use crate::vector::VectorIndex;
use crate::{EmbedRecError, ItemId, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;

impl From<redb::DatabaseError> for EmbedRecError {
    fn from(e: redb::DatabaseError) -> Self {
        EmbedRecError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for EmbedRecError {
    fn from(e: redb::TransactionError) -> Self {
        EmbedRecError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for EmbedRecError {
    fn from(e: redb::TableError) -> Self {
        EmbedRecError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for EmbedRecError {
    fn from(e: redb::StorageError) -> Self {
        EmbedRecError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for EmbedRecError {
    fn from(e: redb::CommitError) -> Self {
        EmbedRecError::Storage(e.to_string())
    }
}

/// Fitted model as JSON. Single row under [`MODEL_KEY`].
const MODEL: TableDefinition<&str, &str> = TableDefinition::new("model");
const MODEL_KEY: &str = "current";

/// Item id at each index position.
const INDEX_IDS: TableDefinition<u64, &str> = TableDefinition::new("index_ids");

/// Normalised vector bytes (little-endian f32) at each index position.
const INDEX_VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("index_vectors");

/// Key `"dim"` holds the embedding dimension of the stored generation.
const INDEX_META: TableDefinition<&str, u64> = TableDefinition::new("index_meta");

/// redb-backed store for the fitted model and the latest index generation.
pub struct ModelStore {
    db: Database,
}

impl ModelStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create a store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(MODEL)?;
        write_txn.open_table(INDEX_IDS)?;
        write_txn.open_table(INDEX_VECTORS)?;
        write_txn.open_table(INDEX_META)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Persist `model`, replacing any stored model.
    pub fn save_model(&self, model: &EmbeddingModel) -> Result<()> {
        let json = serde_json::to_string(model)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MODEL)?;
            table.insert(MODEL_KEY, json.as_str())?;
        }
        write_txn.commit()?;
        tracing::info!(dim = model.dim(), bytes = json.len(), "saved model");
        Ok(())
    }

    /// Load the stored model.
    ///
    /// # Errors
    /// [`EmbedRecError::NotFitted`] if no model has been saved.
    pub fn load_model(&self) -> Result<EmbeddingModel> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MODEL)?;
        let Some(guard) = table.get(MODEL_KEY)? else {
            return Err(EmbedRecError::NotFitted("store holds no model".into()));
        };
        Ok(serde_json::from_str(guard.value())?)
    }

    /// Replace the stored index generation with `index`.
    ///
    /// Ids, vectors and dimension are written in one transaction: a reader
    /// sees either the previous generation or this one, never a mix.
    pub fn save_index(&self, index: &VectorIndex) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(INDEX_IDS)?;
        write_txn.delete_table(INDEX_VECTORS)?;
        {
            let mut ids = write_txn.open_table(INDEX_IDS)?;
            let mut vectors = write_txn.open_table(INDEX_VECTORS)?;
            for (pos, id) in index.ids().iter().enumerate() {
                let Some(vector) = index.vector_at(pos) else {
                    return Err(EmbedRecError::Internal(format!(
                        "index has no vector at position {pos}"
                    )));
                };
                let bytes: Vec<u8> = vector.iter().flat_map(|x| x.to_le_bytes()).collect();
                ids.insert(pos as u64, id.as_str())?;
                vectors.insert(pos as u64, bytes.as_slice())?;
            }
            let mut meta = write_txn.open_table(INDEX_META)?;
            meta.insert("dim", index.dim() as u64)?;
        }
        write_txn.commit()?;
        tracing::info!(items = index.len(), dim = index.dim(), "saved index generation");
        Ok(())
    }

    /// Load the stored index generation.
    ///
    /// # Errors
    /// - [`EmbedRecError::NotFitted`] if no index has been saved.
    /// - [`EmbedRecError::Storage`] if rows are missing or malformed.
    pub fn load_index(&self) -> Result<VectorIndex> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(INDEX_META)?;
        let Some(dim) = meta.get("dim")?.map(|g| g.value() as usize) else {
            return Err(EmbedRecError::NotFitted("store holds no index".into()));
        };

        let id_table = read_txn.open_table(INDEX_IDS)?;
        let mut ids = Vec::new();
        for entry in id_table.iter()? {
            let (key, value) = entry?;
            let pos = key.value();
            if pos != ids.len() as u64 {
                return Err(EmbedRecError::Storage(format!(
                    "index ids are not contiguous: expected position {}, found {pos}",
                    ids.len()
                )));
            }
            ids.push(ItemId::from(value.value()));
        }

        let vector_table = read_txn.open_table(INDEX_VECTORS)?;
        let mut data = Vec::with_capacity(ids.len() * dim);
        let mut rows = 0usize;
        for entry in vector_table.iter()? {
            let (key, value) = entry?;
            let pos = key.value();
            let bytes = value.value();
            if pos != rows as u64 {
                return Err(EmbedRecError::Storage(format!(
                    "index vectors are not contiguous: expected position {rows}, found {pos}"
                )));
            }
            if bytes.len() != dim * 4 {
                return Err(EmbedRecError::Storage(format!(
                    "corrupt vector at position {pos}: {} bytes for dimension {dim}",
                    bytes.len()
                )));
            }
            data.extend(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
            rows += 1;
        }
        if rows != ids.len() {
            return Err(EmbedRecError::Storage(format!(
                "index has {} ids but {rows} vectors",
                ids.len()
            )));
        }

        let index = VectorIndex::from_normalized(ids, data, dim)?;
        tracing::info!(items = index.len(), dim, "loaded index generation");
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
