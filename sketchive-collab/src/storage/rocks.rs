//! RocksDB-backed whiteboard store.
//!
//! Column families:
//! - `whiteboards`: bincode records, LZ4 compressed (state blobs can be large)
//! - `strokes`    : bincode records keyed by whiteboard_id:stroke_id (both BE),
//!   so one board's strokes are a contiguous key range
//! - `meta`       : id sequences, written in the same batch as the insert
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::model::{now_millis, BoundingBox, NewStroke, Stroke, Whiteboard, WhiteboardUpdate};
use super::{sort_by_creation, StoreError, WhiteboardStore};

const CF_WHITEBOARDS: &str = "whiteboards";
const CF_STROKES: &str = "strokes";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_WHITEBOARDS, CF_STROKES, CF_META];

const KEY_NEXT_WHITEBOARD: &[u8] = b"next_whiteboard_id";
const KEY_NEXT_STROKE: &[u8] = b"next_stroke_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sketchive_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config at `path` with the remaining settings left at their defaults.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Next ids to hand out. Guarded by the writer mutex, which also serializes
/// every read-modify-write against the database.
#[derive(Debug)]
struct Sequences {
    next_whiteboard: u64,
    next_stroke: u64,
}

/// RocksDB-backed implementation of [`WhiteboardStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded CF mode; shared behind `&self`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    writer: Mutex<Sequences>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
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

        let sequences = Sequences {
            next_whiteboard: Self::read_sequence(&db, KEY_NEXT_WHITEBOARD)?,
            next_stroke: Self::read_sequence(&db, KEY_NEXT_STROKE)?,
        };
        log::info!(
            "Opened whiteboard store at {} (next board id {}, next stroke id {})",
            config.path.display(),
            sequences.next_whiteboard,
            sequences.next_stroke
        );

        Ok(Self {
            db,
            config,
            writer: Mutex::new(sequences),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_WHITEBOARDS => {
                // Records are LZ4 compressed before they get here
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_STROKES => {
                // Many small writes, range-scanned per board
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn read_sequence(db: &DBWithThreadMode<SingleThreaded>, key: &[u8]) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, key)? {
            Some(raw) => decode_u64(&raw),
            None => Ok(1),
        }
    }

    /// Open the store, count its whiteboards and close it again.
    ///
    /// RocksDB holds an exclusive lock on the directory while a handle is
    /// open; this one is dropped before returning, so the path stays free
    /// for other processes.
    pub fn verify(config: &StoreConfig) -> Result<usize, StoreError> {
        let store = Self::open(config.clone())?;
        let boards = store.list_whiteboard_ids()?.len();
        drop(store);
        Ok(boards)
    }

    /// Ids of every stored whiteboard, ascending.
    pub fn list_whiteboard_ids(&self) -> Result<Vec<u64>, StoreError> {
        let cf = self.cf(CF_WHITEBOARDS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(decode_u64(&key)?);
        }
        Ok(ids)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Sequences>, StoreError> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Database("writer lock poisoned".into()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn load_whiteboard(&self, id: u64) -> Result<Option<Whiteboard>, StoreError> {
        let cf = self.cf(CF_WHITEBOARDS)?;
        match self.db.get_cf(&cf, id.to_be_bytes())? {
            Some(raw) => Ok(Some(decode_whiteboard(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every stroke of a board (deleted or not) with its key, in key order.
    fn board_strokes(&self, whiteboard_id: u64) -> Result<Vec<(Box<[u8]>, Stroke)>, StoreError> {
        let cf = self.cf(CF_STROKES)?;
        let prefix = whiteboard_id.to_be_bytes();
        let mut strokes = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            strokes.push((key, decode(&value)?));
        }

        Ok(strokes)
    }
}

impl WhiteboardStore for RocksStore {
    fn create_whiteboard(&self) -> Result<Whiteboard, StoreError> {
        let mut seq = self.lock()?;
        let id = seq.next_whiteboard;
        let board = Whiteboard::new(id, now_millis());

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_WHITEBOARDS)?, id.to_be_bytes(), encode_whiteboard(&board)?);
        batch.put_cf(&self.cf(CF_META)?, KEY_NEXT_WHITEBOARD, (id + 1).to_be_bytes());
        self.write(batch)?;
        seq.next_whiteboard = id + 1;

        log::debug!("Created whiteboard {id}");
        Ok(board)
    }

    fn get_whiteboard(&self, id: u64) -> Result<Whiteboard, StoreError> {
        self.load_whiteboard(id)?
            .ok_or(StoreError::WhiteboardNotFound(id))
    }

    fn update_whiteboard(&self, id: u64, update: WhiteboardUpdate) -> Result<Whiteboard, StoreError> {
        let _seq = self.lock()?;
        let mut board = self
            .load_whiteboard(id)?
            .ok_or(StoreError::WhiteboardNotFound(id))?;
        board.apply(update, now_millis());

        let cf = self.cf(CF_WHITEBOARDS)?;
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, id.to_be_bytes(), encode_whiteboard(&board)?, &opts)?;

        log::debug!("Updated whiteboard {id} (version {})", board.version);
        Ok(board)
    }

    fn delete_whiteboard(&self, id: u64) -> Result<(), StoreError> {
        let _seq = self.lock()?;
        let strokes_cf = self.cf(CF_STROKES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_WHITEBOARDS)?, id.to_be_bytes());
        let strokes = self.board_strokes(id)?;
        for (key, _) in &strokes {
            batch.delete_cf(&strokes_cf, key);
        }
        self.write(batch)?;

        log::debug!("Deleted whiteboard {id} and {} strokes", strokes.len());
        Ok(())
    }

    fn clear_strokes(&self, whiteboard_id: u64) -> Result<usize, StoreError> {
        let _seq = self.lock()?;
        let cf = self.cf(CF_STROKES)?;
        let strokes = self.board_strokes(whiteboard_id)?;
        if strokes.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        for (key, _) in &strokes {
            batch.delete_cf(&cf, key);
        }
        self.write(batch)?;

        log::debug!("Cleared {} strokes from whiteboard {whiteboard_id}", strokes.len());
        Ok(strokes.len())
    }

    fn insert_stroke(&self, stroke: NewStroke) -> Result<Stroke, StoreError> {
        let mut seq = self.lock()?;
        if self.load_whiteboard(stroke.whiteboard_id)?.is_none() {
            return Err(StoreError::WhiteboardNotFound(stroke.whiteboard_id));
        }

        let id = seq.next_stroke;
        let stroke = stroke.into_stroke(id, now_millis())?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(CF_STROKES)?,
            stroke_key(stroke.whiteboard_id, id),
            encode(&stroke)?,
        );
        batch.put_cf(&self.cf(CF_META)?, KEY_NEXT_STROKE, (id + 1).to_be_bytes());
        self.write(batch)?;
        seq.next_stroke = id + 1;

        log::debug!(
            "Inserted stroke {id} on whiteboard {} ({} points)",
            stroke.whiteboard_id,
            stroke.path.len()
        );
        Ok(stroke)
    }

    fn get_active_strokes(&self, whiteboard_id: u64) -> Result<Vec<Stroke>, StoreError> {
        let mut strokes: Vec<Stroke> = self
            .board_strokes(whiteboard_id)?
            .into_iter()
            .map(|(_, stroke)| stroke)
            .filter(|stroke| !stroke.deleted)
            .collect();
        sort_by_creation(&mut strokes);
        Ok(strokes)
    }

    fn mark_deleted_in_region(&self, whiteboard_id: u64, region: BoundingBox) -> Result<usize, StoreError> {
        region.validate()?;
        let _seq = self.lock()?;
        let cf = self.cf(CF_STROKES)?;

        let mut batch = WriteBatch::default();
        let mut marked = 0;
        for (key, mut stroke) in self.board_strokes(whiteboard_id)? {
            if stroke.erased_by(&region) {
                stroke.deleted = true;
                batch.put_cf(&cf, key, encode(&stroke)?);
                marked += 1;
            }
        }
        if marked > 0 {
            self.write(batch)?;
        }

        log::debug!("Erased {marked} strokes on whiteboard {whiteboard_id} in {region:?}");
        Ok(marked)
    }
}

/// Stroke key: whiteboard_id (8 bytes BE) + stroke_id (8 bytes BE).
fn stroke_key(whiteboard_id: u64, stroke_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&whiteboard_id.to_be_bytes());
    key[8..].copy_from_slice(&stroke_id.to_be_bytes());
    key
}

fn decode_u64(raw: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = raw
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Deserialization(format!("expected 8-byte id, got {}", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_whiteboard(board: &Whiteboard) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(board)?))
}

fn decode_whiteboard(raw: &[u8]) -> Result<Whiteboard, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(raw)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode(&bytes)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::Point;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn stroke_on(board: u64, raw: &[(f64, f64)]) -> NewStroke {
        NewStroke {
            whiteboard_id: board,
            owner_id: 1,
            path: raw.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            color: "#000".into(),
            width: 5,
        }
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path().join("db").as_path());
        assert!(store.list_whiteboard_ids().unwrap().is_empty());
    }

    #[test]
    fn test_verify_releases_directory_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.create_whiteboard().unwrap();
            // A live handle keeps the directory locked.
            assert!(RocksStore::open(config.clone()).is_err());
        }

        assert_eq!(RocksStore::verify(&config).unwrap(), 1);
        let reopened = RocksStore::open(config.clone()).unwrap();
        assert_eq!(reopened.list_whiteboard_ids().unwrap(), vec![1]);
        drop(reopened);
        assert_eq!(RocksStore::verify(&config).unwrap(), 1);
    }

    #[test]
    fn test_create_then_get_round_trip() {
        let (_dir, store) = open_temp();
        let created = store.create_whiteboard().unwrap();
        let loaded = store.get_whiteboard(created.id).unwrap();

        assert_eq!(loaded, created);
        assert_eq!(loaded.name, "Untitled");
        assert!(loaded.data.is_empty());
    }

    #[test]
    fn test_get_missing_whiteboard() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get_whiteboard(42), Err(StoreError::WhiteboardNotFound(42)));
        assert_eq!(
            store.update_whiteboard(42, WhiteboardUpdate::default()),
            Err(StoreError::WhiteboardNotFound(42))
        );
    }

    #[test]
    fn test_update_large_state_blob() {
        let (_dir, store) = open_temp();
        let board = store.create_whiteboard().unwrap();
        let blob = format!("{{\"strokes\":[{}]}}", vec!["[1,2,3,4]"; 5_000].join(","));

        let updated = store
            .update_whiteboard(
                board.id,
                WhiteboardUpdate {
                    name: Some("Sprint".into()),
                    data: Some(blob.clone()),
                },
            )
            .unwrap();
        assert_eq!(updated.version, 1);

        let loaded = store.get_whiteboard(board.id).unwrap();
        assert_eq!(loaded.name, "Sprint");
        assert_eq!(loaded.data, blob);
        assert!(loaded.updated_at >= loaded.created_at);
    }

    #[test]
    fn test_insert_stroke_computes_bounds() {
        let (_dir, store) = open_temp();
        let board = store.create_whiteboard().unwrap();
        let stroke = store
            .insert_stroke(stroke_on(board.id, &[(0.0, 0.0), (3.0, 4.0), (-1.0, 2.0)]))
            .unwrap();

        assert_eq!(stroke.bounds(), BoundingBox::new(-1.0, 3.0, 0.0, 4.0));
        assert!(matches!(
            store.insert_stroke(stroke_on(board.id, &[])),
            Err(StoreError::InvalidInput(_))
        ));
        assert_eq!(
            store.insert_stroke(stroke_on(999, &[(1.0, 1.0)])),
            Err(StoreError::WhiteboardNotFound(999))
        );
    }

    #[test]
    fn test_erase_region_marks_overlapping_only() {
        let (_dir, store) = open_temp();
        let board = store.create_whiteboard().unwrap();
        let overlapping = store.insert_stroke(stroke_on(board.id, &[(4.0, 1.0), (10.0, 2.0)])).unwrap();
        let outside = store.insert_stroke(stroke_on(board.id, &[(10.0, 1.0), (20.0, 2.0)])).unwrap();

        let marked = store
            .mark_deleted_in_region(board.id, BoundingBox::new(0.0, 5.0, 0.0, 5.0))
            .unwrap();
        assert_eq!(marked, 1);

        let active = store.get_active_strokes(board.id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, outside.id);
        assert!(active.iter().all(|s| s.id != overlapping.id));

        // Already-deleted strokes are not matched again.
        let again = store
            .mark_deleted_in_region(board.id, BoundingBox::new(0.0, 5.0, 0.0, 5.0))
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_erase_rejects_inverted_region() {
        let (_dir, store) = open_temp();
        let board = store.create_whiteboard().unwrap();
        assert!(matches!(
            store.mark_deleted_in_region(board.id, BoundingBox::new(5.0, 0.0, 0.0, 5.0)),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_active_strokes_ordered_and_isolated_per_board() {
        let (_dir, store) = open_temp();
        let a = store.create_whiteboard().unwrap();
        let b = store.create_whiteboard().unwrap();

        let first = store.insert_stroke(stroke_on(a.id, &[(0.0, 0.0)])).unwrap();
        store.insert_stroke(stroke_on(b.id, &[(1.0, 1.0)])).unwrap();
        let second = store.insert_stroke(stroke_on(a.id, &[(2.0, 2.0)])).unwrap();

        let active = store.get_active_strokes(a.id).unwrap();
        let ids: Vec<u64> = active.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(active.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(store.get_active_strokes(b.id).unwrap().len(), 1);
    }

    #[test]
    fn test_clear_and_delete_cascade() {
        let (_dir, store) = open_temp();
        let board = store.create_whiteboard().unwrap();
        for i in 0..3 {
            store.insert_stroke(stroke_on(board.id, &[(i as f64, 0.0)])).unwrap();
        }

        assert_eq!(store.clear_strokes(board.id).unwrap(), 3);
        assert!(store.get_active_strokes(board.id).unwrap().is_empty());
        assert_eq!(store.clear_strokes(board.id).unwrap(), 0);

        store.insert_stroke(stroke_on(board.id, &[(1.0, 1.0)])).unwrap();
        store.delete_whiteboard(board.id).unwrap();
        assert_eq!(store.get_whiteboard(board.id), Err(StoreError::WhiteboardNotFound(board.id)));
        assert!(store.get_active_strokes(board.id).unwrap().is_empty());

        // Deleting again is fine.
        store.delete_whiteboard(board.id).unwrap();
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let (board_id, stroke_id) = {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            let board = store.create_whiteboard().unwrap();
            let stroke = store.insert_stroke(stroke_on(board.id, &[(1.0, 2.0)])).unwrap();
            store.delete_whiteboard(board.id).unwrap();
            (board.id, stroke.id)
        };

        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let board = store.create_whiteboard().unwrap();
        let stroke = store.insert_stroke(stroke_on(board.id, &[(1.0, 2.0)])).unwrap();
        assert!(board.id > board_id);
        assert!(stroke.id > stroke_id);
        assert_eq!(store.list_whiteboard_ids().unwrap(), vec![board.id]);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("sketchive_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(StoreConfig::at("elsewhere").path, PathBuf::from("elsewhere"));
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::WhiteboardNotFound(7).to_string(), "Whiteboard not found: 7");
        assert_eq!(
            StoreError::InvalidInput("stroke path is empty".into()).to_string(),
            "Invalid input: stroke path is empty"
        );
    }
}
