//! Splits a tall page into overlapping full-width horizontal tiles.
//! Pure and deterministic: the same (height, tile height, overlap) always
//! produces the same plan, which keeps benchmark runs comparable.

use serde::Serialize;
use tracing::debug;

use crate::config::{EdgeTileMode, TilingConfig};

/// Pages up to this multiple of the tile height are processed whole.
const SINGLE_TILE_FACTOR: f64 = 1.5;
/// Largest overlap ratio the planner accepts.
const MAX_OVERLAP: f32 = 0.9;
/// In `auto` mode, edge tiles are added below this overlap ratio.
const AUTO_EDGE_OVERLAP: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tile {
    pub index: usize,
    pub y_offset: u32,
    pub height: u32,
    pub is_edge_tile: bool,
}

impl Tile {
    /// Exclusive bottom edge in page coordinates.
    pub fn end(&self) -> u32 {
        self.y_offset + self.height
    }
}

pub fn plan_tiles(image_height: u32, config: &TilingConfig) -> Vec<Tile> {
    if image_height == 0 {
        return Vec::new();
    }
    let tile_height = config.tile_height.max(1);
    if image_height as f64 <= tile_height as f64 * SINGLE_TILE_FACTOR {
        return vec![Tile {
            index: 0,
            y_offset: 0,
            height: image_height,
            is_edge_tile: false,
        }];
    }

    let overlap = clamp_overlap(config.overlap_ratio);
    let stride = ((tile_height as f64) * (1.0 - overlap as f64)).round().max(1.0) as u32;
    let min_height = config.min_tile_height.min(tile_height).min(image_height);

    let mut tiles = Vec::new();
    let mut y = 0u32;
    loop {
        let end = (y + tile_height).min(image_height);
        let mut start = y;
        if end - start < min_height {
            // Widen the last tile upward rather than emit a sliver.
            start = end - min_height;
        }
        tiles.push(Tile {
            index: tiles.len(),
            y_offset: start,
            height: end - start,
            is_edge_tile: false,
        });
        if end >= image_height {
            break;
        }
        y += stride;
    }

    let edges_enabled = match config.edge_tiles {
        EdgeTileMode::Off => false,
        EdgeTileMode::On => true,
        EdgeTileMode::Auto => overlap < AUTO_EDGE_OVERLAP,
    };
    if edges_enabled {
        let edge_height = (tile_height / 2).max(min_height).min(image_height);
        let boundaries: Vec<u32> = tiles[..tiles.len() - 1].iter().map(Tile::end).collect();
        for boundary in boundaries {
            let start = boundary
                .saturating_sub(edge_height / 2)
                .min(image_height - edge_height);
            tiles.push(Tile {
                index: tiles.len(),
                y_offset: start,
                height: edge_height,
                is_edge_tile: true,
            });
        }
    }

    debug!(
        image_height,
        tile_height,
        stride,
        tiles = tiles.len(),
        "tiles_planned"
    );
    tiles
}

fn clamp_overlap(ratio: f32) -> f32 {
    if ratio.is_finite() {
        ratio.clamp(0.0, MAX_OVERLAP)
    } else {
        0.0
    }
}
