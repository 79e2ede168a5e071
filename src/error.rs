//! Page-level errors surfaced to callers of the pipeline.
//! Recoverable translation failures never reach this type; they are
//! resolved (or explicitly marked) inside the fallback chain.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("detection engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("image error: {0}")]
    Image(String),
}
