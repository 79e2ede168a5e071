mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use page_translate::config::FailFastMode;
use page_translate::gate::GateSet;
use page_translate::metrics::{CallKind, CallOutcome};
use page_translate::sink::JsonLinesSink;
use page_translate::state_machine::FailureReason;
use page_translate::{
    PagePipeline, PipelineConfig, PipelineError, RegionStatus, TranslatedRegion, FAILURE_MARKER,
};

use common::{
    english_for, page_height, speech_lines, PrintedText, ScriptedEngine, ScriptedProvider, SlowEngine,
    PAGE_WIDTH,
};

fn blank_page(lines: &[PrintedText]) -> DynamicImage {
    DynamicImage::new_rgb8(PAGE_WIDTH, page_height(lines))
}

/// Twelve lines split into several batches.
fn batched_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.translation.small_input_items = 4;
    config.translation.batch_max_items = 6;
    config
}

fn build(
    config: PipelineConfig,
    lines: Vec<PrintedText>,
    primary: Arc<ScriptedProvider>,
) -> PagePipeline {
    PagePipeline::new(config, Arc::new(ScriptedEngine::new(lines)), primary)
        .unwrap()
        .with_sink(None)
}

fn sources(regions: &[TranslatedRegion]) -> Vec<&str> {
    regions.iter().map(|r| r.source_text.as_str()).collect()
}

#[tokio::test]
async fn regions_come_back_in_reading_order() {
    let lines = speech_lines(6, 400);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let pipeline = build(PipelineConfig::default(), lines.clone(), primary.clone());

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    let expected: Vec<String> = lines.iter().map(|l| l.text.clone()).collect();
    assert_eq!(sources(&page.regions), expected);
    for region in &page.regions {
        assert_eq!(region.status, RegionStatus::Translated);
        assert_eq!(region.text, english_for(&region.source_text));
        assert_eq!(region.provider.as_deref(), Some("primary"));
    }
    let ys: Vec<u32> = page.regions.iter().map(|r| r.bbox.y1).collect();
    assert!(ys.windows(2).all(|w| w[0] < w[1]));

    // Lines printed inside an overlap band were seen twice and collapsed.
    assert!(page.metrics.fusion.duplicates_removed > 0);
    assert_eq!(page.metrics.fusion.regions, 6);
    assert!(page.metrics.tile_count > 1);
    assert_eq!(page.metrics.tiles.len(), page.metrics.tile_count);
    assert_eq!(primary.total_calls(), 1);
    assert_eq!(page.metrics.counters.primary_calls, 1);
    assert_eq!(page.metrics.regions.translated, 6);
}

#[tokio::test]
async fn unavailable_engine_yields_zero_regions_and_an_error() {
    let lines = speech_lines(3, 400);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let pipeline = PagePipeline::new(
        PipelineConfig::default(),
        Arc::new(ScriptedEngine::unavailable()),
        primary.clone(),
    )
    .unwrap()
    .with_sink(None);

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    assert!(page.regions.is_empty());
    let error = page.engine_error.as_deref().unwrap();
    assert!(error.contains("unavailable"));
    assert_eq!(page.metrics.engine_error.as_deref(), Some(error));
    assert_eq!(primary.total_calls(), 0);
    assert!(!page.aborted);
}

#[tokio::test]
async fn failing_tile_keeps_the_rest_of_the_page() {
    // 2300px tall: tiles [0,1024) [512,1536) [1024,2048) [1536,2300).
    // The last line sits only in the last tile.
    let lines = speech_lines(6, 400);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let engine = ScriptedEngine::new(lines.clone()).failing_from(3);
    let pipeline = PagePipeline::new(PipelineConfig::default(), Arc::new(engine), primary)
        .unwrap()
        .with_sink(None);

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    let expected: Vec<String> = lines[..5].iter().map(|l| l.text.clone()).collect();
    assert_eq!(sources(&page.regions), expected);
    assert!(page.regions.iter().all(|r| r.status == RegionStatus::Translated));
    let error = page.engine_error.as_deref().unwrap();
    assert!(error.contains("1 of 4"), "{error}");
    assert_eq!(page.metrics.tile_count, 4);
    let failed: Vec<usize> = page.metrics.tiles.iter().filter(|t| t.failed).map(|t| t.index).collect();
    assert_eq!(failed, vec![3]);
}

#[tokio::test]
async fn every_tile_failing_yields_zero_regions() {
    let lines = speech_lines(6, 400);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let engine = ScriptedEngine::new(lines.clone()).failing_from(0);
    let pipeline = PagePipeline::new(PipelineConfig::default(), Arc::new(engine), primary.clone())
        .unwrap()
        .with_sink(None);

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    assert!(page.regions.is_empty());
    assert!(page.engine_error.as_deref().unwrap().contains("all 4 tiles failed"));
    assert_eq!(primary.total_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_page_keeps_the_engine_gated() {
    let lines = speech_lines(2, 300);
    let engine = Arc::new(SlowEngine::new(lines.clone(), Duration::from_millis(300)));
    let gates = Arc::new(GateSet::new(1, 2));
    let pipeline = |engine: Arc<SlowEngine>| {
        let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
        PagePipeline::new(PipelineConfig::default(), engine, primary)
            .unwrap()
            .with_gates(Arc::clone(&gates))
            .with_sink(None)
            .with_cache(None)
    };
    let first = pipeline(Arc::clone(&engine));
    let second = pipeline(Arc::clone(&engine));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), first.process_page(blank_page(&lines))).await;
    assert!(abandoned.is_err());

    let page = second.process_page(blank_page(&lines)).await.unwrap();
    assert_eq!(page.regions.len(), 2);
    assert_eq!(engine.max_active(), 1);
    // The blocking call left behind by the first page still held the gate.
    assert!(page.metrics.detect_gate_wait_us > 0);
}

#[tokio::test]
async fn performance_knobs_keep_the_region_set() {
    let lines = speech_lines(30, 200);
    let knobs = [
        (1024, 0.5, 1, 3),
        (512, 0.5, 2, 1),
        (1024, 0.25, 1, 4),
        (2048, 0.5, 3, 2),
        (640, 0.3, 2, 3),
    ];
    let mut baseline = None;
    for (tile_height, overlap_ratio, detect, translate) in knobs {
        let mut config = batched_config();
        config.tiling.tile_height = tile_height;
        config.tiling.overlap_ratio = overlap_ratio;
        config.detection.concurrency = detect;
        config.translation.concurrency = translate;
        let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
        let pipeline = build(config, lines.clone(), primary);

        let page = pipeline.process_page(blank_page(&lines)).await.unwrap();
        let regions: Vec<_> = page
            .regions
            .iter()
            .map(|r| (r.bbox, r.source_text.clone(), r.text.clone()))
            .collect();
        assert_eq!(regions.len(), 30, "tile_height {tile_height} overlap {overlap_ratio}");
        match &baseline {
            None => baseline = Some(regions),
            Some(expected) => assert_eq!(
                &regions, expected,
                "tile_height {tile_height} overlap {overlap_ratio}"
            ),
        }
    }
}

#[tokio::test]
async fn repeated_page_is_served_from_cache() {
    let lines = speech_lines(5, 400);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let pipeline = build(PipelineConfig::default(), lines.clone(), primary.clone());

    let first = pipeline.process_page(blank_page(&lines)).await.unwrap();
    let calls_after_first = primary.total_calls();
    let second = pipeline.process_page(blank_page(&lines)).await.unwrap();

    assert_eq!(primary.total_calls(), calls_after_first);
    assert_eq!(second.metrics.counters.total_calls(), 0);
    assert_eq!(second.metrics.regions.cached, 5);
    assert_ne!(first.page_id, second.page_id);
    for (a, b) in first.regions.iter().zip(&second.regions) {
        assert_eq!(a.text, b.text);
        assert_eq!(b.status, RegionStatus::Cached);
    }
}

#[tokio::test]
async fn rejected_output_is_never_cached() {
    let lines = speech_lines(3, 400);
    // Echoes the source back, which leaks the source script.
    let primary = Arc::new(ScriptedProvider::new("primary", Duration::ZERO, |items| {
        Ok(items.iter().map(|i| i.text.clone()).collect())
    }));
    let pipeline = build(PipelineConfig::default(), lines.clone(), primary.clone());

    let first = pipeline.process_page(blank_page(&lines)).await.unwrap();
    assert!(first.regions.iter().all(TranslatedRegion::is_failed));
    let calls_after_first = primary.total_calls();

    let second = pipeline.process_page(blank_page(&lines)).await.unwrap();
    assert_eq!(second.metrics.regions.cached, 0);
    assert!(second.regions.iter().all(TranslatedRegion::is_failed));
    assert!(primary.total_calls() > calls_after_first);
}

#[tokio::test]
async fn punctuation_only_regions_are_blank_not_failed() {
    let mut lines = speech_lines(3, 400);
    lines[1].text = "……！".into();
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let pipeline = build(PipelineConfig::default(), lines.clone(), primary);

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    assert_eq!(page.regions.len(), 3);
    assert_eq!(page.regions[1].status, RegionStatus::Blank);
    assert_eq!(page.regions[1].text, "");
    assert_eq!(page.regions[0].text, "line 0");
    assert_eq!(page.regions[2].text, "line 2");
    assert_eq!(page.metrics.regions.blank, 1);
    assert_eq!(page.metrics.regions.failed, 0);
}

#[tokio::test]
async fn stage_timings_explain_the_page() {
    let lines = speech_lines(12, 300);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::from_millis(15)));
    let pipeline = build(batched_config(), lines.clone(), primary);

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();
    let m = &page.metrics;

    for name in ["page", "detection", "translation"] {
        assert!(m.stage(name).is_some(), "missing stage {name}");
    }
    assert_eq!(m.batches.len(), 2);
    assert!(m.max_unaccounted_ratio() <= 0.10, "ratio {}", m.max_unaccounted_ratio());

    let translation = m.stage("translation").unwrap();
    assert!(translation.step_ns("dispatch") >= 15_000_000);
    for lane in &m.batches {
        assert!(lane.step_ns("primary") >= 15_000_000);
    }
    assert!(m.attempts.iter().all(|a| a.outcome == CallOutcome::Success));
}

#[tokio::test]
async fn slow_primary_falls_back_once_per_batch() {
    let lines = speech_lines(12, 300);
    let mut config = batched_config();
    config.translation.primary_timeout_ms = 50;
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::from_millis(400)));
    let secondary = Arc::new(ScriptedProvider::fluent("backup", Duration::ZERO));
    let pipeline = build(config, lines.clone(), primary).with_secondary(secondary.clone());

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();
    let m = &page.metrics;

    assert_eq!(secondary.batch_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(m.attempts_of(CallKind::Secondary).count(), 2);
    assert!(m
        .attempts_of(CallKind::Primary)
        .all(|a| a.outcome == CallOutcome::Timeout));
    assert_eq!(m.counters.fallback_calls, 2);
    assert!(page
        .regions
        .iter()
        .all(|r| r.provider.as_deref() == Some("backup")));
}

#[tokio::test]
async fn failing_provider_terminates_within_call_budget() {
    let lines = speech_lines(12, 300);
    let mut config = batched_config();
    config.translation.page_call_budget = 5;
    let primary = Arc::new(ScriptedProvider::broken("primary"));
    let pipeline = build(config, lines.clone(), primary.clone());

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    assert_eq!(page.regions.len(), 12);
    for region in &page.regions {
        assert!(region.is_failed());
        assert_eq!(region.text, FAILURE_MARKER);
    }
    assert!(primary.total_calls() <= 5);
    assert!(page.metrics.counters.total_calls() <= 5);
    assert_eq!(page.metrics.regions.failed + page.metrics.regions.aborted, 12);
}

#[tokio::test]
async fn abort_page_mode_stops_remaining_batches() {
    let lines = speech_lines(12, 300);
    let mut config = batched_config();
    config.translation.fail_fast = FailFastMode::AbortPage;
    config.translation.concurrency = 1;
    let primary = Arc::new(ScriptedProvider::broken("primary"));
    let pipeline = build(config, lines.clone(), primary);

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    assert!(page.aborted);
    assert!(page.metrics.aborted);
    let aborted = page
        .regions
        .iter()
        .filter(|r| r.status == RegionStatus::Failed { reason: FailureReason::Aborted })
        .count();
    assert!(aborted >= 6, "aborted {aborted}");
    assert!(page.regions.iter().all(TranslatedRegion::is_failed));
}

#[tokio::test]
async fn encoded_images_are_decoded() {
    let lines = speech_lines(4, 400);
    let mut png = Vec::new();
    blank_page(&lines)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let pipeline = build(PipelineConfig::default(), lines.clone(), primary);

    let page = pipeline.process_image_bytes(&png).await.unwrap();
    assert_eq!(page.regions.len(), 4);
    assert_eq!(page.metrics.image_height, page_height(&lines));

    let err = pipeline.process_image_bytes(b"not an image").await.unwrap_err();
    assert!(matches!(err, PipelineError::Image(_)));
}

#[tokio::test]
async fn page_report_lands_in_json_lines_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pages.jsonl");
    let lines = speech_lines(3, 400);
    let primary = Arc::new(ScriptedProvider::fluent("primary", Duration::ZERO));
    let pipeline = build(PipelineConfig::default(), lines.clone(), primary)
        .with_sink(Some(Arc::new(JsonLinesSink::open(&path).unwrap())));

    let page = pipeline.process_page(blank_page(&lines)).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let record: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
    assert_eq!(record["metrics"]["page_id"], page.page_id.as_str());
    assert_eq!(record["metrics"]["regions"]["translated"], 3);
    assert_eq!(record["config"]["primary_provider"]["id"], "deepseek");
    assert!(record["metrics"]["attempts"].as_array().unwrap().len() == 1);
}
