//! Page pipeline: image → tiles → gated detection → fusion → batches →
//! fallback chain → translated regions, with one metrics record per page.

use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use image::DynamicImage;
use serde::Serialize;
use tracing::{info, warn};

use crate::budget::PageBudget;
use crate::config::{ConfigError, PipelineConfig, SanitizedConfig};
use crate::error::PipelineError;
use crate::gate::{GateKind, GateSet};
use crate::metrics::{MetricsRegistry, PageMetrics, PageRecorder, RegionCounts, StageClock, TileTiming};
use crate::ocr::fusion::FusionStats;
use crate::ocr::{
    crop_tile, detect_tile, plan_tiles, BoxPx, DetectionEngine, FusedRegion, RawDetection, RegionFuser,
    RegionId, Tile, TileDetections,
};
use crate::sink::{MetricsSink, PageReport, TracingSink};
use crate::state_machine::FailureReason;
use crate::translate::batch::{plan_batches, PlannedItem};
use crate::translate::fallback::{BatchOutcome, FallbackChain, ItemOutcome};
use crate::translate::normalize::{self, ScriptValidator};
use crate::translate::{ChatProvider, TranslationCache, TranslationProvider};

/// Text placed in a region that could not be translated. Never confused with
/// the empty translation of a blank region.
pub const FAILURE_MARKER: &str = "[untranslated]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionStatus {
    Translated,
    Cached,
    /// Nothing translatable in the source; the empty translation is correct.
    Blank,
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslatedRegion {
    pub id: RegionId,
    pub bbox: BoxPx,
    pub source_text: String,
    pub text: String,
    pub status: RegionStatus,
    pub provider: Option<String>,
}

impl TranslatedRegion {
    fn new(region: &FusedRegion, text: String, status: RegionStatus, provider: Option<String>) -> Self {
        Self {
            id: region.id,
            bbox: region.bbox,
            source_text: region.text.clone(),
            text,
            status,
            provider,
        }
    }

    fn failed(region: &FusedRegion, reason: FailureReason) -> Self {
        Self::new(
            region,
            FAILURE_MARKER.to_string(),
            RegionStatus::Failed { reason },
            None,
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, RegionStatus::Failed { .. })
    }
}

/// Regions found on a page.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub tiles: Vec<Tile>,
    pub regions: Vec<FusedRegion>,
    pub stats: FusionStats,
    pub engine_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageTranslation {
    pub page_id: String,
    /// In reading order.
    pub regions: Vec<TranslatedRegion>,
    pub metrics: PageMetrics,
    pub engine_error: Option<String>,
    pub aborted: bool,
}

pub struct PagePipeline {
    config: PipelineConfig,
    sanitized: SanitizedConfig,
    engine: Arc<dyn DetectionEngine>,
    primary: Arc<dyn TranslationProvider>,
    secondary: Option<Arc<dyn TranslationProvider>>,
    gates: Arc<GateSet>,
    cache: Option<Arc<TranslationCache>>,
    registry: Arc<MetricsRegistry>,
    sink: Option<Arc<dyn MetricsSink>>,
    fuser: RegionFuser,
    validator: ScriptValidator,
}

impl PagePipeline {
    pub fn new(
        config: PipelineConfig,
        engine: Arc<dyn DetectionEngine>,
        primary: Arc<dyn TranslationProvider>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let t = &config.translation;
        let cache = TranslationCache::new(t.cache_capacity, std::time::Duration::from_secs(t.cache_ttl_secs))
            .map(Arc::new);
        Ok(Self {
            sanitized: config.sanitized(),
            fuser: RegionFuser::new(&config.fusion)?,
            validator: ScriptValidator::from_config(t),
            gates: Arc::new(GateSet::from_config(&config)),
            cache,
            registry: Arc::new(MetricsRegistry::new()),
            sink: Some(Arc::new(TracingSink)),
            engine,
            primary,
            secondary: None,
            config,
        })
    }

    /// Build with chat providers for the configured primary (and secondary)
    /// profiles. API keys come from the environment.
    pub fn with_chat_providers(
        config: PipelineConfig,
        engine: Arc<dyn DetectionEngine>,
    ) -> Result<Self, PipelineError> {
        let provider_error = |e: crate::translate::TranslateError| {
            PipelineError::Config(ConfigError::Invalid(e.to_string()))
        };
        let primary = ChatProvider::from_profile(&config.providers.primary).map_err(provider_error)?;
        let secondary = match &config.providers.secondary {
            Some(profile) => Some(ChatProvider::from_profile(profile).map_err(provider_error)?),
            None => None,
        };
        let mut pipeline = Self::new(config, engine, Arc::new(primary))?;
        if let Some(secondary) = secondary {
            pipeline = pipeline.with_secondary(Arc::new(secondary));
        }
        Ok(pipeline)
    }

    pub fn with_secondary(mut self, provider: Arc<dyn TranslationProvider>) -> Self {
        self.secondary = Some(provider);
        self
    }

    /// Share gates with other pipelines in the process.
    pub fn with_gates(mut self, gates: Arc<GateSet>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<TranslationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_sink(mut self, sink: Option<Arc<dyn MetricsSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Decode an encoded image and process it.
    pub async fn process_image_bytes(&self, bytes: &[u8]) -> Result<PageTranslation, PipelineError> {
        let image = image::load_from_memory(bytes).map_err(|e| PipelineError::Image(e.to_string()))?;
        self.process_page(image).await
    }

    pub async fn process_page(&self, image: DynamicImage) -> Result<PageTranslation, PipelineError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::Image(format!(
                "empty image {}x{}",
                image.width(),
                image.height()
            )));
        }
        let t = &self.config.translation;
        let recorder = PageRecorder::new(Arc::clone(&self.registry));
        let budget = PageBudget::new(t.page_call_budget, t.page_time_budget());
        let mut clock = StageClock::start("page");

        let extraction = self.extract_regions(Arc::new(image), &recorder).await;
        clock.lap("detection");
        let regions = self
            .translate_regions(&extraction.regions, &recorder, &budget)
            .await;
        clock.lap("translation");
        recorder.record_stage(clock.finish());

        let counts = count_regions(&regions);
        let aborted = budget.is_aborted();
        let page_id = recorder.page_id().to_string();
        let metrics = recorder.finish(
            counts,
            budget.is_exhausted(),
            aborted,
            extraction.engine_error.clone(),
        );

        if let Some(sink) = &self.sink {
            let report = PageReport {
                metrics: &metrics,
                config: &self.sanitized,
            };
            if let Err(e) = sink.emit(&report) {
                warn!(page_id = %page_id, error = %e, "sink_emit_failed");
            }
        }
        info!(
            page_id = %page_id,
            regions = regions.len(),
            failed = metrics.regions.failed,
            calls = metrics.counters.total_calls(),
            wall_us = metrics.wall_us,
            "page_processed"
        );

        Ok(PageTranslation {
            page_id,
            regions,
            engine_error: extraction.engine_error,
            metrics,
            aborted,
        })
    }

    /// Tile the page, run detection under the detection gate and fuse.
    /// An engine that is unavailable up front, or fails on every tile, yields
    /// zero regions and an `engine_error`. Tiles that fail on their own
    /// contribute nothing; the rest of the page is still fused.
    pub async fn extract_regions(&self, image: Arc<DynamicImage>, recorder: &PageRecorder) -> Extraction {
        let mut clock = StageClock::start("detection");
        let height = image.height();
        let tiles = plan_tiles(height, &self.config.tiling);
        clock.lap("plan_tiles");

        let mut per_tile: Vec<TileDetections> = if self.engine.is_available() {
            stream::iter(tiles.iter().cloned())
                .map(|tile| self.detect_one(Arc::clone(&image), tile, recorder))
                .buffer_unordered(self.config.detection.concurrency.max(1))
                .collect()
                .await
        } else {
            Vec::new()
        };
        per_tile.sort_by_key(|t| t.tile_index);
        clock.lap("detect_tiles");

        let failed = per_tile.iter().filter(|t| t.failed).count();
        if per_tile.is_empty() || failed == per_tile.len() {
            let err = if per_tile.is_empty() {
                PipelineError::EngineUnavailable("detection engine is not available".into())
            } else {
                PipelineError::EngineUnavailable(format!("all {failed} tiles failed"))
            };
            warn!(error = %err, tiles = tiles.len(), "page_without_regions");
            clock.lap("fuse");
            recorder.record_stage(clock.finish());
            recorder.record_extraction(height, tiles.len(), &FusionStats::default());
            return Extraction {
                tiles,
                regions: Vec::new(),
                stats: FusionStats::default(),
                engine_error: Some(err.to_string()),
            };
        }

        let engine_error = (failed > 0).then(|| {
            let err = PipelineError::EngineUnavailable(format!(
                "{failed} of {} tiles failed",
                per_tile.len()
            ));
            warn!(error = %err, "partial_detection");
            err.to_string()
        });

        let detections: Vec<RawDetection> = per_tile.into_iter().flat_map(|t| t.detections).collect();
        let (regions, stats) = self.fuser.fuse(&tiles, &detections);
        clock.lap("fuse");
        recorder.record_stage(clock.finish());
        recorder.record_extraction(height, tiles.len(), &stats);
        info!(
            tiles = tiles.len(),
            failed_tiles = failed,
            raw = stats.raw,
            duplicates = stats.duplicates_removed,
            noise = stats.noise_removed,
            regions = regions.len(),
            "regions_extracted"
        );
        Extraction {
            tiles,
            regions,
            stats,
            engine_error,
        }
    }

    /// The detect permit moves into the blocking task and is released only
    /// when the engine returns, even if this future is dropped first.
    async fn detect_one(&self, image: Arc<DynamicImage>, tile: Tile, recorder: &PageRecorder) -> TileDetections {
        let index = tile.index;
        let is_edge_tile = tile.is_edge_tile;
        let permit = match self.gates.acquire_detect().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(tile = index, error = %e, "tile_skipped");
                return TileDetections {
                    tile_index: index,
                    detections: Vec::new(),
                    failed: true,
                };
            }
        };
        let gate_wait_us = permit.waited.as_micros() as u64;
        recorder.record_gate_wait(GateKind::Detect, gate_wait_us);

        let engine = Arc::clone(&self.engine);
        let (outcome, detect_us) = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let started = Instant::now();
            let tile_image = crop_tile(&image, &tile);
            let outcome = detect_tile(engine.as_ref(), &tile_image);
            (outcome, started.elapsed().as_micros() as u64)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(tile = index, error = %e, "tile_detection_panicked");
            (
                TileDetections {
                    tile_index: index,
                    detections: Vec::new(),
                    failed: true,
                },
                0,
            )
        });

        recorder.record_tile(TileTiming {
            index,
            is_edge_tile,
            gate_wait_us,
            detect_us,
            detections: outcome.detections.len(),
            failed: outcome.failed,
        });
        outcome
    }

    /// Translate regions in reading order. The output has exactly one entry
    /// per input region, at the same position.
    pub async fn translate_regions(
        &self,
        regions: &[FusedRegion],
        recorder: &PageRecorder,
        budget: &PageBudget,
    ) -> Vec<TranslatedRegion> {
        let t = &self.config.translation;
        let mut clock = StageClock::start("translation");
        let mut slots: Vec<Option<TranslatedRegion>> = vec![None; regions.len()];

        let mut planned = Vec::new();
        for (position, region) in regions.iter().enumerate() {
            let text = normalize::prepare(&region.text);
            if normalize::is_blank(&text) {
                slots[position] = Some(TranslatedRegion::new(region, String::new(), RegionStatus::Blank, None));
                continue;
            }
            if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&t.target_lang, &text)) {
                slots[position] = Some(TranslatedRegion::new(region, hit, RegionStatus::Cached, None));
                continue;
            }
            let context = position
                .checked_sub(1)
                .and_then(|prev| normalize::context_snippet(&regions[prev].text, t.context_chars));
            planned.push(PlannedItem {
                region_id: region.id,
                position,
                text,
                context,
            });
        }
        clock.lap("cache_lookup");

        let plan = plan_batches(planned, t);
        clock.lap("plan_batches");

        let chain = FallbackChain::new(
            self.primary.as_ref(),
            self.secondary.as_deref(),
            &self.validator,
            t,
            budget,
            recorder,
            &self.gates,
        );
        let outcomes: Vec<BatchOutcome> = stream::iter(plan.batches.iter())
            .map(|batch| chain.run(batch))
            .buffer_unordered(t.concurrency.max(1))
            .collect()
            .await;
        clock.lap("dispatch");

        for outcome in outcomes {
            recorder.record_batch(outcome.lane);
            for item in outcome.results {
                let Some(region) = regions.get(item.position).filter(|r| r.id == item.region_id) else {
                    warn!(region = %item.region_id, position = item.position, "result_without_region");
                    continue;
                };
                let translated = match item.outcome {
                    ItemOutcome::Translated { text, provider } => {
                        // Only output that passed validation reaches this arm.
                        if let Some(cache) = &self.cache {
                            cache.insert(&t.target_lang, &normalize::prepare(&region.text), text.clone());
                        }
                        TranslatedRegion::new(region, text, RegionStatus::Translated, Some(provider))
                    }
                    ItemOutcome::Failed { reason } => TranslatedRegion::failed(region, reason),
                };
                slots[item.position] = Some(translated);
            }
        }

        let translated: Vec<TranslatedRegion> = slots
            .into_iter()
            .zip(regions)
            .map(|(slot, region)| {
                slot.unwrap_or_else(|| TranslatedRegion::failed(region, FailureReason::ProviderFailed))
            })
            .collect();
        clock.lap("assemble");
        recorder.record_stage(clock.finish());
        translated
    }
}

fn count_regions(regions: &[TranslatedRegion]) -> RegionCounts {
    let mut counts = RegionCounts::default();
    for region in regions {
        match &region.status {
            RegionStatus::Translated => counts.translated += 1,
            RegionStatus::Cached => counts.cached += 1,
            RegionStatus::Blank => counts.blank += 1,
            RegionStatus::Failed {
                reason: FailureReason::Aborted,
            } => counts.aborted += 1,
            RegionStatus::Failed { .. } => counts.failed += 1,
        }
    }
    counts
}
