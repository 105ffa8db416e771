//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `snapshots` — folded document text at a log position (LZ4 compressed)
//! - `entries`   — accepted log entries (keyed by doc_id:position)
//! - `metadata`  — per-document bookkeeping (position, counts, sizes)
//!
//! The `entries` family doubles as the crash-recovery tail: it is keyed in
//! log order, so a restarted worker replays `snapshot + entries_since`
//! and is back at the exact head. Saving a snapshot prunes the entries it
//! covers, which bounds replay cost for long-lived documents.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, Write-Ahead Logs)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use crate::operation::LogEntry;
use crate::storage::{DocumentSnapshot, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_ENTRIES: &str = "entries";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_ENTRIES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB).
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10).
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false — RocksDB's WAL covers crashes).
    pub sync_writes: bool,
    /// Max open files (default: 512).
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB).
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-provided temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Position of the latest persisted snapshot.
    pub snapshot_position: u64,
    /// Entries persisted since the document was created.
    pub entry_count: u64,
    /// Uncompressed snapshot size in bytes.
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes.
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch).
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch).
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_seconds();
        Self {
            doc_id,
            snapshot_position: 0,
            entry_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed [`SnapshotStore`].
pub struct DocumentStore {
    /// Single-threaded mode — concurrency is handled by the workers.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if
    /// missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, infrequent writes, point lookups.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ENTRIES => {
                // Many small sequential writes, prefix-scanned by doc_id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Check if a document has any persisted state.
    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    /// Load document metadata.
    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// List all document ids in the store.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::DeserializationError("invalid uuid key".into()))?,
                );
                doc_ids.push(id);
            }
        }

        Ok(doc_ids)
    }

    /// Delete a document's snapshot, entries, and metadata.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_entries = self.cf(CF_ENTRIES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());

        let start_key = Self::entry_key(doc_id, 0);
        for item in self.db.iterator_cf(
            &cf_entries,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        ) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_entries, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("column family '{name}' not found")))
    }

    /// Entry key: doc_id (16 bytes) + position (8 bytes big-endian), so a
    /// forward scan yields log order.
    fn entry_key(doc_id: Uuid, position: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&position.to_be_bytes());
        key
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl SnapshotStore for DocumentStore {
    fn load_document(&self, doc_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                let (snapshot, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, doc_id: Uuid, position: u64, text: &str) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_entries = self.cf(CF_ENTRIES)?;

        let snapshot = DocumentSnapshot {
            position,
            text: text.to_string(),
        };
        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(doc_id)
            .unwrap_or_else(|_| DocumentMetadata::new(doc_id));
        meta.snapshot_position = position;
        meta.snapshot_size = text.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_seconds();

        // Atomic batch: snapshot + metadata + pruning of covered entries.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);

        let start_key = Self::entry_key(doc_id, 0);
        let end_key = Self::entry_key(doc_id, position);
        for item in self.db.iterator_cf(
            &cf_entries,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        ) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            if key.as_ref() >= end_key.as_slice() {
                break;
            }
            batch.delete_cf(&cf_entries, &key);
        }

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn append_entry(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(doc_id)
            .unwrap_or_else(|_| DocumentMetadata::new(doc_id));
        meta.entry_count += 1;
        meta.updated_at = unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_entries, Self::entry_key(doc_id, entry.position), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn entries_since(&self, doc_id: Uuid, position: u64) -> Result<Vec<LogEntry>, StoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let start_key = Self::entry_key(doc_id, position);

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        ) {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }

            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let (entry, _): (LogEntry, _) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
