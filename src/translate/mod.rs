//! Translation provider seam plus the pieces that drive it: batching,
//! the numbered-output contract, output validation, caching and the
//! per-batch fallback chain.

pub mod batch;
pub mod cache;
pub mod chat;
pub mod fallback;
pub mod normalize;
pub mod numbered;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use batch::{plan_batches, BatchPlan, PlannedItem, TranslationBatch};
pub use cache::TranslationCache;
pub use chat::ChatProvider;
pub use fallback::{BatchOutcome, FallbackChain, ItemResult};
pub use normalize::{OutputCheck, ScriptValidator};

/// Future returned by provider calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TranslateError>> + Send + 'a>>;

/// One unit of text sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub text: String,
    /// Neighbouring text given to the model for reference only.
    pub context: Option<String>,
}

impl BatchItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: None,
        }
    }
}

/// Per-call request parameters.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub target_lang: String,
    /// Upper bound the provider applies to its own transport.
    pub timeout: Duration,
    /// Ask for stricter adherence to the numbered-output format.
    pub strict: bool,
    pub max_output_tokens: u32,
}

/// A translation backend. Providers differ in protocol, not in contract:
/// `translate_batch` returns one output per input, in input order. Missing
/// or empty entries are allowed and are handled by the caller.
pub trait TranslationProvider: Send + Sync {
    /// Stable identifier recorded on every call attempt.
    fn id(&self) -> &str;

    fn translate_batch<'a>(
        &'a self,
        items: &'a [BatchItem],
        options: &'a RequestOptions,
    ) -> ProviderFuture<'a, Vec<String>>;

    fn translate_one<'a>(
        &'a self,
        item: &'a BatchItem,
        options: &'a RequestOptions,
    ) -> ProviderFuture<'a, String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("provider call timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation cancelled")]
    Cancelled,
    #[error("{missing} of {expected} outputs missing")]
    MissingOutput { missing: usize, expected: usize },
    #[error("output contains leaked source-script text")]
    ContentCorruption,
    #[error("page call budget exhausted")]
    BudgetExhausted,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl TranslateError {
    /// Errors that move a batch on to the secondary provider.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            TranslateError::Timeout | TranslateError::Provider(_) | TranslateError::RateLimited { .. }
        )
    }
}
