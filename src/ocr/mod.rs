//! Text-region extraction: tile planning, the detection engine seam and
//! region fusion. The engine itself is a black box that takes one tile
//! image and returns raw detections in tile-local coordinates.

pub mod fusion;
pub mod geom;
pub mod python_engine;
pub mod tiling;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use fusion::{FusedRegion, RegionFuser, RegionId};
pub use python_engine::PythonDetectionEngine;
pub use tiling::{plan_tiles, Tile};

/// Axis-aligned box, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoxPx {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoxPx {
    /// Builds a box from two corners in any order.
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) as f32 / 2.0
    }

    pub fn translate_y(&self, dy: u32) -> Self {
        Self {
            x1: self.x1,
            y1: self.y1 + dy,
            x2: self.x2,
            y2: self.y2 + dy,
        }
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.x1.min(width),
            self.y1.min(height),
            self.x2.min(width),
            self.y2.min(height),
        )
    }
}

/// What the engine reports for one text line, in tile-local coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDetection {
    pub bbox: BoxPx,
    pub text: String,
    pub confidence: f32,
}

/// An engine detection tagged with the tile it came from.
#[derive(Debug, Clone, Serialize)]
pub struct RawDetection {
    pub tile_index: usize,
    pub bbox: BoxPx,
    pub text: String,
    pub confidence: f32,
}

/// A tile plus the pixels it covers.
pub struct TileImage {
    pub tile: Tile,
    pub image: DynamicImage,
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("detection engine not loaded")]
    EngineNotLoaded,
    #[error("detection failed: {0}")]
    ProcessingFailed(String),
}

/// Black-box text detection/recognition engine.
/// Implementations need not be reentrant; callers serialize access
/// through the detection gate.
pub trait DetectionEngine: Send + Sync {
    fn detect(&self, tile: &TileImage) -> Result<Vec<EngineDetection>, OcrError>;

    /// Whether the engine can currently run at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Cuts the full-width horizontal slice for `tile` out of `image`.
pub fn crop_tile(image: &DynamicImage, tile: &Tile) -> TileImage {
    TileImage {
        tile: tile.clone(),
        image: image.crop_imm(0, tile.y_offset, image.width(), tile.height),
    }
}

/// What one tile produced. A failed tile carries no detections.
#[derive(Debug, Clone, Default)]
pub struct TileDetections {
    pub tile_index: usize,
    pub detections: Vec<RawDetection>,
    pub failed: bool,
}

/// Runs the engine on one tile. A failing engine yields no detections
/// for that tile instead of failing the page.
pub fn detect_tile(engine: &dyn DetectionEngine, tile: &TileImage) -> TileDetections {
    let (width, height) = (tile.image.width(), tile.image.height());
    let tile_index = tile.tile.index;
    match engine.detect(tile) {
        Ok(found) => TileDetections {
            tile_index,
            detections: found
                .into_iter()
                .map(|d| RawDetection {
                    tile_index,
                    bbox: d.bbox.clamp_to(width, height),
                    text: d.text,
                    confidence: d.confidence,
                })
                .collect(),
            failed: false,
        },
        Err(e) => {
            warn!(tile = tile_index, error = %e, "tile_detection_failed");
            TileDetections {
                tile_index,
                detections: Vec::new(),
                failed: true,
            }
        }
    }
}
