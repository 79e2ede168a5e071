//! page-translate: tiled text-region extraction and budgeted batch
//! translation for tall page images.
//! Main library: module wiring, public re-exports, tracing setup.

pub mod budget;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod ocr;
pub mod pipeline;
pub mod sink;
pub mod state_machine;
pub mod translate;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{PagePipeline, PageTranslation, RegionStatus, TranslatedRegion, FAILURE_MARKER};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filter comes from `RUST_LOG`,
/// falling back to `page_translate=info`. A second call is a no-op.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("page_translate=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
