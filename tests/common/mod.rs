//! In-process fakes for driving `PagePipeline` end to end.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use page_translate::ocr::{BoxPx, DetectionEngine, EngineDetection, OcrError, TileImage};
use page_translate::translate::{
    BatchItem, ProviderFuture, RequestOptions, TranslateError, TranslationProvider,
};

pub const PAGE_WIDTH: u32 = 400;

/// Text printed on the page at a fixed position. The engine reports it in
/// every tile that fully contains it, like a real detector would in
/// overlapping tiles.
#[derive(Debug, Clone)]
pub struct PrintedText {
    pub bbox: BoxPx,
    pub text: String,
}

pub struct ScriptedEngine {
    page: Vec<PrintedText>,
    available: AtomicBool,
    /// Tiles from this index on fail.
    fail_from_tile: Option<usize>,
    /// Set once a tile has failed; the engine then reports itself down.
    tripped: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(page: Vec<PrintedText>) -> Self {
        Self {
            page,
            available: AtomicBool::new(true),
            fail_from_tile: None,
            tripped: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        let engine = Self::new(Vec::new());
        engine.available.store(false, Ordering::SeqCst);
        engine
    }

    /// Errors on every tile with `index >= tile`, like an engine that
    /// crashes partway down the page.
    pub fn failing_from(mut self, tile: usize) -> Self {
        self.fail_from_tile = Some(tile);
        self
    }
}

impl DetectionEngine for ScriptedEngine {
    fn detect(&self, tile: &TileImage) -> Result<Vec<EngineDetection>, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(OcrError::EngineNotLoaded);
        }
        if self.fail_from_tile.is_some_and(|from| tile.tile.index >= from) {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(OcrError::ProcessingFailed("engine crashed".into()));
        }
        let (top, bottom) = (tile.tile.y_offset, tile.tile.end());
        Ok(self
            .page
            .iter()
            .filter(|p| p.bbox.y1 >= top && p.bbox.y2 <= bottom)
            .map(|p| EngineDetection {
                bbox: BoxPx::new(p.bbox.x1, p.bbox.y1 - top, p.bbox.x2, p.bbox.y2 - top),
                text: p.text.clone(),
                confidence: 0.95,
            })
            .collect())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.tripped.load(Ordering::SeqCst)
    }
}

/// Blocks for `delay` on every tile and records how many calls overlap.
/// Stands in for an engine that must never be entered twice at once.
pub struct SlowEngine {
    inner: ScriptedEngine,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SlowEngine {
    pub fn new(page: Vec<PrintedText>, delay: Duration) -> Self {
        Self {
            inner: ScriptedEngine::new(page),
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl DetectionEngine for SlowEngine {
    fn detect(&self, tile: &TileImage) -> Result<Vec<EngineDetection>, OcrError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let out = self.inner.detect(tile);
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

/// `count` lines of speech, one every `spacing` pixels, far enough apart
/// that none of them fuse into a paragraph.
pub fn speech_lines(count: usize, spacing: u32) -> Vec<PrintedText> {
    (0..count)
        .map(|i| {
            let y = 60 + i as u32 * spacing;
            PrintedText {
                bbox: BoxPx::new(40, y, 240, y + 40),
                text: format!("台詞その{i}"),
            }
        })
        .collect()
}

pub fn page_height(lines: &[PrintedText]) -> u32 {
    lines.iter().map(|p| p.bbox.y2).max().unwrap_or(0) + 200
}

/// English stand-in derived from the digits of the source, so every
/// output can be traced back to its input.
pub fn english_for(source: &str) -> String {
    let digits: String = source.chars().filter(char::is_ascii_digit).collect();
    format!("line {digits}")
}

type Reply = dyn Fn(&[BatchItem]) -> Result<Vec<String>, TranslateError> + Send + Sync;

pub struct ScriptedProvider {
    id: String,
    delay: Duration,
    reply: Box<Reply>,
    pub batch_calls: AtomicUsize,
    pub item_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(
        id: &str,
        delay: Duration,
        reply: impl Fn(&[BatchItem]) -> Result<Vec<String>, TranslateError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.to_string(),
            delay,
            reply: Box::new(reply),
            batch_calls: AtomicUsize::new(0),
            item_calls: AtomicUsize::new(0),
        }
    }

    /// Translates every item correctly.
    pub fn fluent(id: &str, delay: Duration) -> Self {
        Self::new(id, delay, |items| {
            Ok(items.iter().map(|i| english_for(&i.text)).collect())
        })
    }

    /// Fails every call.
    pub fn broken(id: &str) -> Self {
        Self::new(id, Duration::ZERO, |_| {
            Err(TranslateError::Provider("upstream unavailable".into()))
        })
    }

    pub fn total_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst) + self.item_calls.load(Ordering::SeqCst)
    }
}

impl TranslationProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn translate_batch<'a>(
        &'a self,
        items: &'a [BatchItem],
        _options: &'a RequestOptions,
    ) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.reply)(items)
        })
    }

    fn translate_one<'a>(
        &'a self,
        item: &'a BatchItem,
        _options: &'a RequestOptions,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.item_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut out = (self.reply)(std::slice::from_ref(item))?;
            Ok(out.pop().unwrap_or_default())
        })
    }
}

