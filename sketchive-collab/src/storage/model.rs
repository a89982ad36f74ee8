//! Whiteboard and stroke records.
//!
//! JSON field names match what browser clients already send and expect
//! (`whiteboardID`, `minX`, `created_at`, ...). The same structs are
//! bincode-encoded for storage, where field names play no part.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::StoreError;

/// Name given to freshly created whiteboards.
pub const DEFAULT_WHITEBOARD_NAME: &str = "Untitled";

/// Owner assigned to new whiteboards until accounts exist.
pub const DEFAULT_OWNER_ID: u64 = 1;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned rectangle, inclusive on every edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(rename = "minX")]
    pub min_x: f64,
    #[serde(rename = "maxX")]
    pub max_x: f64,
    #[serde(rename = "minY")]
    pub min_y: f64,
    #[serde(rename = "maxY")]
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self { min_x, max_x, min_y, max_y }
    }

    /// Tightest box around `points`; `None` for an empty path.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let init = Self::new(first.x, first.x, first.y, first.y);
        Some(points[1..].iter().fold(init, |b, p| Self {
            min_x: b.min_x.min(p.x),
            max_x: b.max_x.max(p.x),
            min_y: b.min_y.min(p.y),
            max_y: b.max_y.max(p.y),
        }))
    }

    /// Overlap test (touching edges count), not containment.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Reject non-finite or inverted boxes.
    pub fn validate(&self) -> Result<(), StoreError> {
        let finite = [self.min_x, self.max_x, self.min_y, self.max_y]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(StoreError::InvalidInput("bounding box must be finite".into()));
        }
        if self.min_x > self.max_x || self.min_y > self.max_y {
            return Err(StoreError::InvalidInput(format!(
                "inverted bounding box ({}, {}, {}, {})",
                self.min_x, self.max_x, self.min_y, self.max_y
            )));
        }
        Ok(())
    }
}

/// A whiteboard and its opaque client-owned state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Whiteboard {
    pub id: u64,
    pub name: String,
    #[serde(rename = "owner")]
    pub owner_id: u64,
    #[serde(rename = "created")]
    pub created_at: u64,
    pub updated_at: u64,
    /// Serialized board state. Never parsed server-side.
    pub data: String,
    /// Bumped each time `data` changes.
    pub version: u64,
}

impl Whiteboard {
    pub(crate) fn new(id: u64, now: u64) -> Self {
        Self {
            id,
            name: DEFAULT_WHITEBOARD_NAME.to_string(),
            owner_id: DEFAULT_OWNER_ID,
            created_at: now,
            updated_at: now,
            data: String::new(),
            version: 0,
        }
    }

    /// Apply a partial update in place.
    pub(crate) fn apply(&mut self, update: WhiteboardUpdate, now: u64) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(data) = update.data {
            if data != self.data {
                self.data = data;
                self.version += 1;
            }
        }
        self.updated_at = now;
    }
}

/// Fields a client may change on an existing whiteboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

/// A stroke as submitted by a client, before id and bounds are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStroke {
    #[serde(rename = "whiteboardID")]
    pub whiteboard_id: u64,
    #[serde(rename = "ownerID", default)]
    pub owner_id: u64,
    pub path: Vec<Point>,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub width: u32,
}

impl NewStroke {
    /// Validate the path and build the stored stroke.
    pub(crate) fn into_stroke(self, id: u64, now: u64) -> Result<Stroke, StoreError> {
        if let Some(bad) = self.path.iter().position(|p| !p.is_finite()) {
            return Err(StoreError::InvalidInput(format!("point {bad} is not finite")));
        }
        let bounds = BoundingBox::from_points(&self.path)
            .ok_or_else(|| StoreError::InvalidInput("stroke path is empty".into()))?;
        Ok(Stroke {
            id,
            whiteboard_id: self.whiteboard_id,
            owner_id: self.owner_id,
            path: self.path,
            color: self.color,
            width: self.width,
            created_at: now,
            deleted: false,
            min_x: bounds.min_x,
            max_x: bounds.max_x,
            min_y: bounds.min_y,
            max_y: bounds.max_y,
        })
    }
}

/// A persisted stroke with its cached bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: u64,
    #[serde(rename = "whiteboardID")]
    pub whiteboard_id: u64,
    #[serde(rename = "ownerID")]
    pub owner_id: u64,
    pub path: Vec<Point>,
    pub color: String,
    pub width: u32,
    pub created_at: u64,
    pub deleted: bool,
    #[serde(rename = "minX")]
    pub min_x: f64,
    #[serde(rename = "maxX")]
    pub max_x: f64,
    #[serde(rename = "minY")]
    pub min_y: f64,
    #[serde(rename = "maxY")]
    pub max_y: f64,
}

impl Stroke {
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.min_x, self.max_x, self.min_y, self.max_y)
    }

    /// Replace the path, keeping the bounding box in step with it.
    pub fn set_path(&mut self, path: Vec<Point>) -> Result<(), StoreError> {
        let bounds = BoundingBox::from_points(&path)
            .ok_or_else(|| StoreError::InvalidInput("stroke path is empty".into()))?;
        self.path = path;
        self.min_x = bounds.min_x;
        self.max_x = bounds.max_x;
        self.min_y = bounds.min_y;
        self.max_y = bounds.max_y;
        Ok(())
    }

    /// Whether an erase over `region` should take this stroke out.
    pub fn erased_by(&self, region: &BoundingBox) -> bool {
        !self.deleted && self.bounds().intersects(region)
    }
}
