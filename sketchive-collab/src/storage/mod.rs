//! Whiteboard and stroke persistence.
//!
//! The realtime core never touches storage. The board service talks to it
//! through the [`WhiteboardStore`] capability trait:
//!
//! ```text
//! ┌──────────────┐   WhiteboardStore   ┌──────────────────────────────────┐
//! │ BoardService │ ──────────────────► │ RocksStore  (RocksDB)            │
//! └──────────────┘                     │   CF "whiteboards" : LZ4 records │
//!                                      │   CF "strokes"     : board:id    │
//!                                      │   CF "meta"        : sequences   │
//!                                      ├──────────────────────────────────┤
//!                                      │ MemoryStore (tests, no path set) │
//!                                      └──────────────────────────────────┘
//! ```

pub mod memory;
pub mod model;
pub mod rocks;

pub use memory::MemoryStore;
pub use model::{
    BoundingBox, NewStroke, Point, Stroke, Whiteboard, WhiteboardUpdate, DEFAULT_OWNER_ID,
    DEFAULT_WHITEBOARD_NAME,
};
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Whiteboard not found: {0}")]
    WhiteboardNotFound(u64),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistence operations the board service relies on.
///
/// Implementations must keep each stroke's bounding box equal to the extent
/// of its path, and must never return a deleted stroke from
/// [`get_active_strokes`](WhiteboardStore::get_active_strokes).
pub trait WhiteboardStore: Send + Sync {
    /// New board named "Untitled" with an empty state blob.
    fn create_whiteboard(&self) -> Result<Whiteboard, StoreError>;

    fn get_whiteboard(&self, id: u64) -> Result<Whiteboard, StoreError>;

    /// Patch the given fields; returns the updated board.
    fn update_whiteboard(&self, id: u64, update: WhiteboardUpdate) -> Result<Whiteboard, StoreError>;

    /// Remove a board and its strokes. Absent boards are not an error.
    fn delete_whiteboard(&self, id: u64) -> Result<(), StoreError>;

    /// Remove every stroke of a board; returns how many were removed.
    fn clear_strokes(&self, whiteboard_id: u64) -> Result<usize, StoreError>;

    /// Assign id, timestamp and bounding box, then persist.
    fn insert_stroke(&self, stroke: NewStroke) -> Result<Stroke, StoreError>;

    /// Non-deleted strokes of a board, oldest first.
    fn get_active_strokes(&self, whiteboard_id: u64) -> Result<Vec<Stroke>, StoreError>;

    /// Flag every active stroke whose box overlaps `region`; returns the count.
    fn mark_deleted_in_region(&self, whiteboard_id: u64, region: BoundingBox) -> Result<usize, StoreError>;
}

/// Creation order: timestamp first, id breaks ties within one millisecond.
pub(crate) fn sort_by_creation(strokes: &mut [Stroke]) {
    strokes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
