//! Per-page report delivery to observability collaborators.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::SanitizedConfig;
use crate::metrics::PageMetrics;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One structured record per page: what was measured and how the run was
/// configured, without secrets.
#[derive(Debug, Serialize)]
pub struct PageReport<'a> {
    pub metrics: &'a PageMetrics,
    pub config: &'a SanitizedConfig,
}

pub trait MetricsSink: Send + Sync {
    fn emit(&self, report: &PageReport<'_>) -> Result<(), SinkError>;
}

/// Emits a compact summary as a tracing event and the full report at debug.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&self, report: &PageReport<'_>) -> Result<(), SinkError> {
        let m = report.metrics;
        info!(
            page_id = %m.page_id,
            wall_us = m.wall_us,
            tiles = m.tile_count,
            regions = m.fusion.regions,
            calls = m.counters.total_calls(),
            fallback_calls = m.counters.fallback_calls,
            failed = m.regions.failed,
            unaccounted = m.max_unaccounted_ratio(),
            "page_report"
        );
        tracing::debug!(report = %serde_json::to_string(report)?, "page_report_full");
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricsSink for JsonLinesSink {
    fn emit(&self, report: &PageReport<'_>) -> Result<(), SinkError> {
        let line = serde_json::to_string(report)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::PipelineConfig;
    use crate::metrics::{MetricsRegistry, PageRecorder, RegionCounts};

    fn metrics() -> PageMetrics {
        PageRecorder::new(Arc::new(MetricsRegistry::new())).finish(
            RegionCounts::default(),
            false,
            false,
            None,
        )
    }

    #[test]
    fn json_lines_append_one_record_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.jsonl");
        let sink = JsonLinesSink::open(&path).unwrap();
        let config = PipelineConfig::default().sanitized();
        let (a, b) = (metrics(), metrics());
        sink.emit(&PageReport { metrics: &a, config: &config }).unwrap();
        sink.emit(&PageReport { metrics: &b, config: &config }).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["metrics"]["page_id"], a.page_id.as_str());
        assert_eq!(first["config"]["tiling"]["tile_height"], 1024);
        assert!(!content.contains("api_key"));
    }

    #[test]
    fn tracing_sink_accepts_reports() {
        let config = PipelineConfig::default().sanitized();
        let m = metrics();
        TracingSink
            .emit(&PageReport { metrics: &m, config: &config })
            .unwrap();
    }
}
