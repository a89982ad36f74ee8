//! In-process store. Used when no storage path is configured and in tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::model::{now_millis, BoundingBox, NewStroke, Stroke, Whiteboard, WhiteboardUpdate};
use super::{sort_by_creation, StoreError, WhiteboardStore};

#[derive(Debug)]
struct Tables {
    whiteboards: BTreeMap<u64, Whiteboard>,
    strokes: BTreeMap<u64, Stroke>,
    next_whiteboard: u64,
    next_stroke: u64,
}

/// Volatile [`WhiteboardStore`]. Everything is lost when it is dropped.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Tables {
                whiteboards: BTreeMap::new(),
                strokes: BTreeMap::new(),
                next_whiteboard: 1,
                next_stroke: 1,
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl WhiteboardStore for MemoryStore {
    fn create_whiteboard(&self) -> Result<Whiteboard, StoreError> {
        let mut tables = self.lock()?;
        let id = tables.next_whiteboard;
        tables.next_whiteboard += 1;
        let board = Whiteboard::new(id, now_millis());
        tables.whiteboards.insert(id, board.clone());
        Ok(board)
    }

    fn get_whiteboard(&self, id: u64) -> Result<Whiteboard, StoreError> {
        self.lock()?
            .whiteboards
            .get(&id)
            .cloned()
            .ok_or(StoreError::WhiteboardNotFound(id))
    }

    fn update_whiteboard(&self, id: u64, update: WhiteboardUpdate) -> Result<Whiteboard, StoreError> {
        let mut tables = self.lock()?;
        let board = tables
            .whiteboards
            .get_mut(&id)
            .ok_or(StoreError::WhiteboardNotFound(id))?;
        board.apply(update, now_millis());
        Ok(board.clone())
    }

    fn delete_whiteboard(&self, id: u64) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        tables.whiteboards.remove(&id);
        tables.strokes.retain(|_, s| s.whiteboard_id != id);
        Ok(())
    }

    fn clear_strokes(&self, whiteboard_id: u64) -> Result<usize, StoreError> {
        let mut tables = self.lock()?;
        let before = tables.strokes.len();
        tables.strokes.retain(|_, s| s.whiteboard_id != whiteboard_id);
        Ok(before - tables.strokes.len())
    }

    fn insert_stroke(&self, stroke: NewStroke) -> Result<Stroke, StoreError> {
        let mut tables = self.lock()?;
        if !tables.whiteboards.contains_key(&stroke.whiteboard_id) {
            return Err(StoreError::WhiteboardNotFound(stroke.whiteboard_id));
        }
        let id = tables.next_stroke;
        let stroke = stroke.into_stroke(id, now_millis())?;
        tables.next_stroke += 1;
        tables.strokes.insert(id, stroke.clone());
        Ok(stroke)
    }

    fn get_active_strokes(&self, whiteboard_id: u64) -> Result<Vec<Stroke>, StoreError> {
        let mut strokes: Vec<Stroke> = self
            .lock()?
            .strokes
            .values()
            .filter(|s| s.whiteboard_id == whiteboard_id && !s.deleted)
            .cloned()
            .collect();
        sort_by_creation(&mut strokes);
        Ok(strokes)
    }

    fn mark_deleted_in_region(&self, whiteboard_id: u64, region: BoundingBox) -> Result<usize, StoreError> {
        region.validate()?;
        let mut tables = self.lock()?;
        let mut marked = 0;
        for stroke in tables.strokes.values_mut() {
            if stroke.whiteboard_id == whiteboard_id && stroke.erased_by(&region) {
                stroke.deleted = true;
                marked += 1;
            }
        }
        Ok(marked)
    }
}
