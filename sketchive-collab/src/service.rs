//! Board service: the REST-facing boundary over a [`WhiteboardStore`].
//!
//! Handlers receive what an HTTP layer would hand them: the raw `id` query
//! parameter and the raw request body. Everything that can go wrong is
//! folded into [`ApiError`], which knows its status code and JSON body.
//! Storage faults stop here; they never reach the realtime path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{
    BoundingBox, NewStroke, Stroke, StoreError, Whiteboard, WhiteboardStore, WhiteboardUpdate,
};

/// Errors surfaced to API callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Storage(_) => 500,
        }
    }

    /// `{"error": "..."}`
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidInput(msg) => ApiError::BadRequest(msg),
            StoreError::WhiteboardNotFound(id) => {
                ApiError::NotFound(format!("whiteboard {id} not found"))
            }
            other => ApiError::Storage(other),
        }
    }
}

/// Response for operations that return no record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acknowledgement {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl Acknowledgement {
    fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            count: None,
        }
    }

    fn with_count(message: &str, count: usize) -> Self {
        Self {
            message: message.to_string(),
            count: Some(count),
        }
    }
}

/// Eraser request body: the board plus the region swept by the eraser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EraseRequest {
    #[serde(rename = "whiteboardID")]
    pub whiteboard_id: u64,
    #[serde(flatten)]
    pub region: BoundingBox,
}

#[derive(Clone)]
pub struct BoardService {
    store: Arc<dyn WhiteboardStore>,
}

impl BoardService {
    pub fn new(store: Arc<dyn WhiteboardStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn WhiteboardStore> {
        &self.store
    }

    pub fn create_whiteboard(&self) -> Result<Whiteboard, ApiError> {
        let board = self.store.create_whiteboard()?;
        log::info!("Created whiteboard {}", board.id);
        Ok(board)
    }

    pub fn get_whiteboard(&self, id: Option<&str>) -> Result<Whiteboard, ApiError> {
        let id = parse_id(id)?;
        Ok(self.store.get_whiteboard(id)?)
    }

    /// Body: `{"name"?: string, "data"?: string}`.
    pub fn update_whiteboard(&self, id: Option<&str>, body: &[u8]) -> Result<Whiteboard, ApiError> {
        let id = parse_id(id)?;
        let update: WhiteboardUpdate = parse_body(body)?;
        let board = self.store.update_whiteboard(id, update)?;
        log::info!("Updated whiteboard {id} (version {})", board.version);
        Ok(board)
    }

    pub fn delete_whiteboard(&self, id: Option<&str>) -> Result<Acknowledgement, ApiError> {
        let id = parse_id(id)?;
        self.store.delete_whiteboard(id)?;
        log::info!("Deleted whiteboard {id}");
        Ok(Acknowledgement::new("Whiteboard deleted successfully"))
    }

    pub fn clear_strokes(&self, id: Option<&str>) -> Result<Acknowledgement, ApiError> {
        let id = parse_id(id)?;
        let removed = self.store.clear_strokes(id)?;
        log::info!("Cleared {removed} strokes from whiteboard {id}");
        Ok(Acknowledgement::with_count("Whiteboard cleared successfully", removed))
    }

    /// Body: a [`NewStroke`] as JSON.
    pub fn add_stroke(&self, body: &[u8]) -> Result<Stroke, ApiError> {
        let stroke: NewStroke = parse_body(body)?;
        let stroke = self.store.insert_stroke(stroke)?;
        log::debug!("Stored stroke {} on whiteboard {}", stroke.id, stroke.whiteboard_id);
        Ok(stroke)
    }

    pub fn list_strokes(&self, whiteboard_id: Option<&str>) -> Result<Vec<Stroke>, ApiError> {
        let id = parse_id(whiteboard_id)?;
        let strokes = self.store.get_active_strokes(id)?;
        log::debug!("Retrieved {} strokes for whiteboard {id}", strokes.len());
        Ok(strokes)
    }

    /// Body: an [`EraseRequest`] as JSON.
    pub fn erase_region(&self, body: &[u8]) -> Result<Acknowledgement, ApiError> {
        let request: EraseRequest = parse_body(body)?;
        let marked = self
            .store
            .mark_deleted_in_region(request.whiteboard_id, request.region)?;
        log::info!(
            "Erased {marked} strokes on whiteboard {} in {:?}",
            request.whiteboard_id,
            request.region
        );
        Ok(Acknowledgement::with_count("Strokes marked as deleted successfully", marked))
    }
}

fn parse_id(raw: Option<&str>) -> Result<u64, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing whiteboard ID".into()))?;
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid whiteboard ID: {raw:?}")))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))
}
