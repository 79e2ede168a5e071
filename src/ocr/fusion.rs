//! Region fusion: tile-local detections in, page-level regions out.
//!
//! 1. remap to page coordinates,
//! 2. drop cross-tile duplicates inside overlap bands (higher confidence wins),
//! 3. noise filtering,
//! 4. row/paragraph fusion,
//! 5. a final pass folding any remaining heavy overlap into one region.
//!
//! Output is in reading order and region ids follow that order; the batch
//! scheduler and the result assembly both rely on it.

use std::cmp::Ordering;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use super::geom::{horizontal_gap, horizontal_overlap_ratio, overlap_ratio, union_box, vertical_gap};
use super::{BoxPx, RawDetection, Tile};
use crate::config::{ConfigError, FusionConfig, Script};

// Noise policy. Not exposed as knobs.
const MIN_WIDTH_PX: u32 = 15;
const MIN_HEIGHT_PX: u32 = 10;
const MIN_ASPECT: f32 = 0.05;
const MAX_ASPECT: f32 = 20.0;
const SHORT_TEXT_CHARS: usize = 3;
const SHORT_TEXT_MIN_CONFIDENCE: f32 = 0.85;
/// Stacked lines must share at least this much horizontal extent.
const MIN_PARAGRAPH_H_OVERLAP: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegionId(pub u32);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedRegion {
    pub id: RegionId,
    pub bbox: BoxPx,
    pub text: String,
    pub confidence: f32,
    /// Positions in the raw detection list that ended up in this region.
    pub source_detection_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub raw: usize,
    pub duplicates_removed: usize,
    pub noise_removed: usize,
    pub merged: usize,
    pub regions: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    bbox: BoxPx,
    text: String,
    confidence: f32,
    tile_index: usize,
    sources: Vec<u32>,
}

impl Candidate {
    fn absorb(&mut self, other: Candidate, text: String) {
        self.confidence = merge_conf(
            self.confidence,
            self.text.chars().count(),
            other.confidence,
            other.text.chars().count(),
        );
        self.bbox = union_box(&self.bbox, &other.bbox);
        self.text = text;
        self.sources.extend(other.sources);
        self.sources.sort_unstable();
        self.sources.dedup();
    }
}

pub struct RegionFuser {
    config: FusionConfig,
    numeric: Vec<Regex>,
}

impl RegionFuser {
    pub fn new(config: &FusionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            numeric: config.compile_patterns()?,
            config: config.clone(),
        })
    }

    pub fn fuse(&self, tiles: &[Tile], detections: &[RawDetection]) -> (Vec<FusedRegion>, FusionStats) {
        let mut stats = FusionStats {
            raw: detections.len(),
            ..FusionStats::default()
        };

        let remapped = remap(tiles, detections);
        let before = remapped.len();
        let deduped = self.dedup_bands(tiles, remapped);
        stats.duplicates_removed = before - deduped.len();

        let before = deduped.len();
        let kept: Vec<Candidate> = deduped.into_iter().filter(|c| self.keep(c)).collect();
        stats.noise_removed = before - kept.len();

        let before = kept.len();
        let fused = if self.config.paragraph_fusion {
            self.merge_paragraphs(self.merge_rows(kept))
        } else {
            kept
        };
        let fused = self.fold_overlaps(fused);
        stats.merged = before - fused.len();

        let regions: Vec<FusedRegion> = self
            .reading_order(fused)
            .into_iter()
            .enumerate()
            .map(|(i, c)| FusedRegion {
                id: RegionId(i as u32),
                bbox: c.bbox,
                text: c.text,
                confidence: c.confidence,
                source_detection_ids: c.sources,
            })
            .collect();
        stats.regions = regions.len();

        debug!(
            raw = stats.raw,
            duplicates = stats.duplicates_removed,
            noise = stats.noise_removed,
            merged = stats.merged,
            regions = stats.regions,
            "regions_fused"
        );
        (regions, stats)
    }

    /// Collapses detections seen by two different tiles inside an overlap band.
    fn dedup_bands(&self, tiles: &[Tile], candidates: Vec<Candidate>) -> Vec<Candidate> {
        let bands = overlap_bands(tiles);
        if bands.is_empty() {
            return candidates;
        }
        let in_band = |b: &BoxPx| bands.iter().any(|&(start, end)| b.y1 < end && b.y2 > start);

        let mut ordered = candidates;
        ordered.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.bbox.area().cmp(&a.bbox.area()))
                .then_with(|| a.sources.cmp(&b.sources))
        });

        let mut kept: Vec<Candidate> = Vec::with_capacity(ordered.len());
        for candidate in ordered {
            if in_band(&candidate.bbox) {
                let duplicate_of = kept.iter().position(|k| {
                    k.tile_index != candidate.tile_index
                        && in_band(&k.bbox)
                        && overlap_ratio(&k.bbox, &candidate.bbox) > self.config.dedup_threshold
                });
                if let Some(idx) = duplicate_of {
                    // The survivor keeps its own box and text; only provenance is merged.
                    kept[idx].sources.extend(candidate.sources);
                    kept[idx].sources.sort_unstable();
                    continue;
                }
            }
            kept.push(candidate);
        }
        kept.sort_by(position_order);
        kept
    }

    fn keep(&self, c: &Candidate) -> bool {
        let (w, h) = (c.bbox.width(), c.bbox.height());
        if w < MIN_WIDTH_PX || h < MIN_HEIGHT_PX {
            return false;
        }
        let aspect = w as f32 / h as f32;
        if !(MIN_ASPECT..=MAX_ASPECT).contains(&aspect) {
            return false;
        }
        let text = c.text.trim();
        if text.is_empty() {
            return false;
        }
        if text.chars().count() <= SHORT_TEXT_CHARS && c.confidence < SHORT_TEXT_MIN_CONFIDENCE {
            return false;
        }
        !self.numeric.iter().any(|re| re.is_match(text))
    }

    /// Joins pieces of one visual row that sit close together horizontally.
    fn merge_rows(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut out = Vec::with_capacity(candidates.len());
        for mut row in self.cluster_rows(candidates) {
            row.sort_by_key(|c| (c.bbox.x1, c.bbox.y1));
            let mut pieces = row.into_iter();
            let Some(mut current) = pieces.next() else {
                continue;
            };
            for next in pieces {
                let line_height = current.bbox.height().max(next.bbox.height()) as f32;
                let max_gap = (line_height * self.config.max_inline_gap_ratio) as i64;
                if horizontal_gap(&current.bbox, &next.bbox) <= max_gap {
                    let text = join_inline(&current.text, &next.text);
                    current.absorb(next, text);
                } else {
                    out.push(std::mem::replace(&mut current, next));
                }
            }
            out.push(current);
        }
        out
    }

    /// Stacks consecutive lines into paragraphs.
    fn merge_paragraphs(&self, lines: Vec<Candidate>) -> Vec<Candidate> {
        let mut lines = lines;
        lines.sort_by(position_order);

        // (paragraph, box of its last line)
        let mut paragraphs: Vec<(Candidate, BoxPx)> = Vec::new();
        for line in lines {
            let target = paragraphs.iter().position(|(_, last)| {
                let line_height = last.height().min(line.bbox.height()) as f32;
                let gap = vertical_gap(last, &line.bbox);
                gap >= -(line_height as i64 / 2)
                    && gap <= (line_height * self.config.max_line_gap_ratio) as i64
                    && horizontal_overlap_ratio(last, &line.bbox) > MIN_PARAGRAPH_H_OVERLAP
            });
            match target {
                Some(idx) => {
                    let (paragraph, last) = &mut paragraphs[idx];
                    *last = line.bbox;
                    let text = join_inline(&paragraph.text, &line.text);
                    paragraph.absorb(line, text);
                }
                None => {
                    let last = line.bbox;
                    paragraphs.push((line, last));
                }
            }
        }
        paragraphs.into_iter().map(|(p, _)| p).collect()
    }

    /// Whatever still overlaps above the threshold becomes one region.
    fn fold_overlaps(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut items = candidates;
        items.sort_by(position_order);
        'restart: loop {
            for i in 0..items.len() {
                for j in (i + 1)..items.len() {
                    if overlap_ratio(&items[i].bbox, &items[j].bbox) > self.config.dedup_threshold {
                        let other = items.remove(j);
                        let text = fold_text(&items[i].text, &other.text);
                        items[i].absorb(other, text);
                        continue 'restart;
                    }
                }
            }
            break;
        }
        items
    }

    /// Top-to-bottom rows, left-to-right within a row.
    fn reading_order(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut rows = self.cluster_rows(candidates);
        for row in &mut rows {
            row.sort_by(|a, b| a.bbox.x1.cmp(&b.bbox.x1).then_with(|| position_order(a, b)));
        }
        rows.sort_by_key(|row| {
            let top = row.iter().map(|c| c.bbox.y1).min().unwrap_or(0);
            let left = row.iter().map(|c| c.bbox.x1).min().unwrap_or(0);
            (top, left)
        });
        rows.into_iter().flatten().collect()
    }

    /// Groups candidates whose vertical centers lie within the row band.
    fn cluster_rows(&self, candidates: Vec<Candidate>) -> Vec<Vec<Candidate>> {
        let mut sorted = candidates;
        sorted.sort_by(|a, b| {
            a.bbox
                .center_y()
                .partial_cmp(&b.bbox.center_y())
                .unwrap_or(Ordering::Equal)
                .then_with(|| position_order(a, b))
        });

        let mut rows: Vec<Vec<Candidate>> = Vec::new();
        // Center and shortest height of the open row.
        let (mut anchor_center, mut anchor_height) = (0.0f32, 0u32);
        for c in sorted {
            if let Some(row) = rows.last_mut() {
                let tolerance =
                    anchor_height.min(c.bbox.height()) as f32 * self.config.row_tolerance_ratio;
                if (c.bbox.center_y() - anchor_center).abs() <= tolerance {
                    anchor_height = anchor_height.min(c.bbox.height());
                    row.push(c);
                    continue;
                }
            }
            anchor_center = c.bbox.center_y();
            anchor_height = c.bbox.height();
            rows.push(vec![c]);
        }
        rows
    }
}

fn remap(tiles: &[Tile], detections: &[RawDetection]) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(detections.len());
    for (id, d) in detections.iter().enumerate() {
        let Some(tile) = tiles.iter().find(|t| t.index == d.tile_index) else {
            warn!(tile = d.tile_index, "detection_for_unknown_tile");
            continue;
        };
        out.push(Candidate {
            bbox: d.bbox.translate_y(tile.y_offset),
            text: d.text.trim().to_string(),
            confidence: d.confidence,
            tile_index: d.tile_index,
            sources: vec![id as u32],
        });
    }
    out.sort_by(position_order);
    out
}

/// Vertical ranges covered by more than one tile.
fn overlap_bands(tiles: &[Tile]) -> Vec<(u32, u32)> {
    let mut bands = Vec::new();
    for (i, a) in tiles.iter().enumerate() {
        for b in &tiles[i + 1..] {
            let start = a.y_offset.max(b.y_offset);
            let end = a.end().min(b.end());
            if start < end {
                bands.push((start, end));
            }
        }
    }
    bands.sort_unstable();
    bands.dedup();
    bands
}

fn position_order(a: &Candidate, b: &Candidate) -> Ordering {
    (a.bbox.y1, a.bbox.x1, a.bbox.y2, a.bbox.x2, a.tile_index)
        .cmp(&(b.bbox.y1, b.bbox.x1, b.bbox.y2, b.bbox.x2, b.tile_index))
        .then_with(|| a.sources.cmp(&b.sources))
}

fn is_cjk(ch: char) -> bool {
    Script::Han.contains(ch) || Script::Kana.contains(ch) || Script::Hangul.contains(ch)
}

fn needs_space(left: &str, right: &str) -> bool {
    let last = left.chars().rev().find(|ch| !ch.is_whitespace());
    let first = right.chars().find(|ch| !ch.is_whitespace());
    match (last, first) {
        (Some(a), Some(b)) => !is_cjk(a) && !is_cjk(b) && !b.is_ascii_punctuation(),
        _ => false,
    }
}

fn join_inline(left: &str, right: &str) -> String {
    if left.trim().is_empty() {
        return right.trim().to_string();
    }
    if needs_space(left, right) {
        format!("{} {}", left.trim_end(), right.trim_start())
    } else {
        format!("{}{}", left.trim_end(), right.trim_start())
    }
}

fn fold_text(first: &str, second: &str) -> String {
    let squash = |s: &str| s.split_whitespace().collect::<String>();
    let (a, b) = (squash(first), squash(second));
    if a.contains(&b) {
        first.to_string()
    } else if b.contains(&a) {
        second.to_string()
    } else {
        join_inline(first, second)
    }
}

fn merge_conf(a: f32, a_len: usize, b: f32, b_len: usize) -> f32 {
    let total = (a_len + b_len).max(1) as f32;
    (a * a_len as f32 + b * b_len as f32) / total
}
