//! Observability: per-page attempt log and stage timings, plus process-wide
//! histograms. Every remote call, including ones made deep inside a retry
//! branch, is appended to the same page-scoped `PageRecorder`.
//! Histograms track p50/p95/p99 for all timing points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::gate::GateKind;
use crate::ocr::fusion::FusionStats;

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        let idx = idx.min(self.count - 1);
        sorted[idx]
    }
}

/// Stores histograms for all named metrics, across pages.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            ring_capacity: 1024,
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        debug!(metric = name, value_us = value_us, "metric_recorded");
    }

    /// Get percentile for a metric (p value 0-100). Returns microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// Generate a summary of all metrics at p50/p95/p99.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        let mut out = HashMap::new();
        for (&name, ring) in hists.iter() {
            out.insert(
                name.to_string(),
                MetricSummary {
                    p50_us: ring.percentile(50.0),
                    p95_us: ring.percentile(95.0),
                    p99_us: ring.percentile(99.0),
                    count: ring.count,
                },
            );
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names (constants to avoid typos).
pub mod metric_names {
    pub const TILE_DETECT: &str = "t_tile_detect";
    pub const FUSE: &str = "t_fuse";
    pub const PROVIDER_CALL: &str = "t_provider_call";
    pub const BATCH: &str = "t_batch";
    pub const DETECT_GATE_WAIT: &str = "detect_gate_wait";
    pub const TRANSLATE_GATE_WAIT: &str = "translate_gate_wait";
    pub const PAGE: &str = "t_page";
}

// --- Stage clocks ---

#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub name: &'static str,
    pub duration_ns: u64,
}

/// Wall time of one stage and the sub-steps it was split into.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub name: String,
    pub wall_ns: u64,
    pub steps: Vec<StepTiming>,
}

impl StageTiming {
    pub fn accounted_ns(&self) -> u64 {
        self.steps.iter().map(|s| s.duration_ns).sum()
    }

    /// Total time spent in steps called `name`.
    pub fn step_ns(&self, name: &str) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.duration_ns)
            .sum()
    }

    /// Fraction of the stage's wall time not covered by any step.
    pub fn unaccounted_ratio(&self) -> f64 {
        if self.wall_ns == 0 {
            return 0.0;
        }
        self.wall_ns.saturating_sub(self.accounted_ns()) as f64 / self.wall_ns as f64
    }
}

/// Splits a stage into consecutive laps. Each lap covers the time since the
/// previous one, so the laps tile the stage without gaps.
pub struct StageClock {
    name: String,
    started: Instant,
    last: Instant,
    steps: Vec<StepTiming>,
}

impl StageClock {
    pub fn start(name: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            started: now,
            last: now,
            steps: Vec::new(),
        }
    }

    /// Close the current step and name it.
    pub fn lap(&mut self, step: &'static str) -> u64 {
        let now = Instant::now();
        let duration_ns = now.duration_since(self.last).as_nanos() as u64;
        self.last = now;
        self.steps.push(StepTiming {
            name: step,
            duration_ns,
        });
        duration_ns
    }

    pub fn finish(self) -> StageTiming {
        StageTiming {
            name: self.name,
            wall_ns: self.started.elapsed().as_nanos() as u64,
            steps: self.steps,
        }
    }
}

// --- Page records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Primary,
    Secondary,
    /// Whole-batch retry after missing numbered outputs.
    MissingRetry,
    /// One call carrying every still-failing item of a batch.
    Rebatch,
    /// Individual salvage call for one item.
    PerItem,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Primary => "primary",
            CallKind::Secondary => "secondary",
            CallKind::MissingRetry => "missing_retry",
            CallKind::Rebatch => "rebatch",
            CallKind::PerItem => "per_item",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Timeout,
    Error,
    /// Stopped by the page budget or a fail-fast abort.
    Cancelled,
}

/// One remote call. Append-only once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct CallAttempt {
    pub provider: String,
    pub kind: CallKind,
    pub batch_index: usize,
    /// 1-based sequence number within the batch.
    pub attempt_number: u32,
    /// Offset from the page start.
    pub started_at_us: u64,
    pub duration_us: u64,
    pub outcome: CallOutcome,
    pub items: usize,
    /// Outputs that passed validation.
    pub valid_outputs: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TileTiming {
    pub index: usize,
    pub is_edge_tile: bool,
    pub gate_wait_us: u64,
    pub detect_us: u64,
    pub detections: usize,
    /// The engine returned an error for this tile.
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    pub primary_calls: u32,
    pub fallback_calls: u32,
    pub missing_item_retries: u32,
    pub rebatch_calls: u32,
    pub salvage_items: u32,
    pub budget_rejections: u32,
}

impl CallCounters {
    pub fn total_calls(&self) -> u32 {
        self.primary_calls
            + self.fallback_calls
            + self.missing_item_retries
            + self.rebatch_calls
            + self.salvage_items
    }
}

/// How the page's regions ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionCounts {
    pub translated: usize,
    pub cached: usize,
    pub blank: usize,
    pub failed: usize,
    pub aborted: usize,
}

/// Everything measured for one page. Handed to the metrics sink once the
/// page is finished.
#[derive(Debug, Clone, Serialize)]
pub struct PageMetrics {
    pub page_id: String,
    pub started_at_unix_ms: u64,
    pub wall_us: u64,
    pub image_height: u32,
    pub tile_count: usize,
    pub tiles: Vec<TileTiming>,
    pub fusion: FusionStats,
    pub stages: Vec<StageTiming>,
    /// One lane per translation batch.
    pub batches: Vec<StageTiming>,
    pub attempts: Vec<CallAttempt>,
    pub counters: CallCounters,
    pub detect_gate_wait_us: u64,
    pub translate_gate_wait_us: u64,
    pub regions: RegionCounts,
    pub budget_exhausted: bool,
    pub aborted: bool,
    pub engine_error: Option<String>,
}

impl PageMetrics {
    pub fn stage(&self, name: &str) -> Option<&StageTiming> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Worst explainability gap over all stages and batch lanes.
    pub fn max_unaccounted_ratio(&self) -> f64 {
        self.stages
            .iter()
            .chain(self.batches.iter())
            .map(StageTiming::unaccounted_ratio)
            .fold(0.0, f64::max)
    }

    pub fn attempts_of(&self, kind: CallKind) -> impl Iterator<Item = &CallAttempt> {
        self.attempts.iter().filter(move |a| a.kind == kind)
    }
}

#[derive(Default)]
struct PageLog {
    image_height: u32,
    tile_count: usize,
    tiles: Vec<TileTiming>,
    fusion: FusionStats,
    stages: Vec<StageTiming>,
    batches: Vec<StageTiming>,
    attempts: Vec<CallAttempt>,
    counters: CallCounters,
    detect_gate_wait_us: u64,
    translate_gate_wait_us: u64,
}

/// Page-scoped recorder, passed by reference into every branch that does
/// timed work.
pub struct PageRecorder {
    page_id: String,
    started: Instant,
    started_at_unix_ms: u64,
    log: Mutex<PageLog>,
    registry: Arc<MetricsRegistry>,
}

impl PageRecorder {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            page_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            started_at_unix_ms,
            log: Mutex::new(PageLog::default()),
            registry,
        }
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Microseconds since the page started.
    pub fn offset_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn record_extraction(&self, image_height: u32, tile_count: usize, fusion: &FusionStats) {
        let mut log = self.log.lock();
        log.image_height = image_height;
        log.tile_count = tile_count;
        log.fusion = fusion.clone();
    }

    pub fn record_tile(&self, timing: TileTiming) {
        self.registry
            .record(metric_names::TILE_DETECT, timing.detect_us as f64);
        self.log.lock().tiles.push(timing);
    }

    pub fn record_gate_wait(&self, kind: GateKind, waited_us: u64) {
        let name = match kind {
            GateKind::Detect => metric_names::DETECT_GATE_WAIT,
            GateKind::Translate => metric_names::TRANSLATE_GATE_WAIT,
        };
        self.registry.record(name, waited_us as f64);
        let mut log = self.log.lock();
        match kind {
            GateKind::Detect => log.detect_gate_wait_us += waited_us,
            GateKind::Translate => log.translate_gate_wait_us += waited_us,
        }
    }

    pub fn record_attempt(&self, attempt: CallAttempt) {
        self.registry
            .record(metric_names::PROVIDER_CALL, attempt.duration_us as f64);
        debug!(
            provider = %attempt.provider,
            kind = attempt.kind.as_str(),
            batch = attempt.batch_index,
            attempt = attempt.attempt_number,
            outcome = ?attempt.outcome,
            duration_us = attempt.duration_us,
            "call_attempt"
        );
        let mut log = self.log.lock();
        let counters = &mut log.counters;
        match attempt.kind {
            CallKind::Primary => counters.primary_calls += 1,
            CallKind::Secondary => counters.fallback_calls += 1,
            CallKind::MissingRetry => counters.missing_item_retries += 1,
            CallKind::Rebatch => counters.rebatch_calls += 1,
            CallKind::PerItem => counters.salvage_items += 1,
        }
        log.attempts.push(attempt);
    }

    pub fn record_budget_rejection(&self) {
        self.log.lock().counters.budget_rejections += 1;
    }

    pub fn record_stage(&self, stage: StageTiming) {
        if stage.name == "detection" {
            self.registry.record(metric_names::FUSE, stage.step_ns("fuse") as f64 / 1000.0);
        }
        debug!(
            stage = %stage.name,
            wall_ns = stage.wall_ns,
            unaccounted = stage.unaccounted_ratio(),
            "stage_timed"
        );
        self.log.lock().stages.push(stage);
    }

    pub fn record_batch(&self, lane: StageTiming) {
        self.registry.record(metric_names::BATCH, lane.wall_ns as f64 / 1000.0);
        self.log.lock().batches.push(lane);
    }

    /// Snapshot of the call counters so far.
    pub fn counters(&self) -> CallCounters {
        self.log.lock().counters.clone()
    }

    /// Close the page record.
    pub fn finish(
        self,
        regions: RegionCounts,
        budget_exhausted: bool,
        aborted: bool,
        engine_error: Option<String>,
    ) -> PageMetrics {
        let wall_us = self.started.elapsed().as_micros() as u64;
        self.registry.record(metric_names::PAGE, wall_us as f64);
        let mut log = self.log.into_inner();
        log.tiles.sort_by_key(|t| t.index);
        log.attempts.sort_by_key(|a| a.started_at_us);
        PageMetrics {
            page_id: self.page_id,
            started_at_unix_ms: self.started_at_unix_ms,
            wall_us,
            image_height: log.image_height,
            tile_count: log.tile_count,
            tiles: log.tiles,
            fusion: log.fusion,
            stages: log.stages,
            batches: log.batches,
            attempts: log.attempts,
            counters: log.counters,
            detect_gate_wait_us: log.detect_gate_wait_us,
            translate_gate_wait_us: log.translate_gate_wait_us,
            regions,
            budget_exhausted,
            aborted,
            engine_error,
        }
    }
}
