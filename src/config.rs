//! Pipeline configuration: named knobs with conservative defaults.
//! Every knob can be set from TOML and overridden from a `PAGE_TRANSLATE_*`
//! environment variable. Secrets never live here, only env var names.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "PAGE_TRANSLATE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Whether extra tiles are centered on tile boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTileMode {
    Off,
    On,
    /// Enabled only when the overlap band is too thin to hold a text line.
    Auto,
}

impl FromStr for EdgeTileMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(EdgeTileMode::Off),
            "on" => Ok(EdgeTileMode::On),
            "auto" => Ok(EdgeTileMode::Auto),
            _ => Err(()),
        }
    }
}

/// How items that failed their batch are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// One re-batched call for all failing items of a batch.
    Rebatch,
    /// One call per failing item, bounded by the salvage cap.
    PerItem,
}

impl FromStr for RetryMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rebatch" => Ok(RetryMode::Rebatch),
            "per_item" | "per-item" => Ok(RetryMode::PerItem),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailFastMode {
    /// Keep going and mark unrecoverable items as failed.
    Continue,
    /// Stop the page at the first unrecoverable item.
    AbortPage,
}

impl FromStr for FailFastMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(FailFastMode::Continue),
            "abort_page" | "abort-page" | "abort" => Ok(FailFastMode::AbortPage),
            _ => Err(()),
        }
    }
}

/// Writing systems recognized by the output validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    Latin,
    Han,
    Kana,
    Hangul,
    Cyrillic,
}

impl Script {
    pub fn contains(self, ch: char) -> bool {
        let code = ch as u32;
        match self {
            Script::Latin => ch.is_ascii_alphabetic() || matches!(code, 0x00C0..=0x024F),
            Script::Han => matches!(code, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF),
            Script::Kana => matches!(code, 0x3040..=0x30FF | 0x31F0..=0x31FF | 0xFF66..=0xFF9D),
            Script::Hangul => matches!(code, 0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F),
            Script::Cyrillic => matches!(code, 0x0400..=0x04FF),
        }
    }
}

impl FromStr for Script {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latin" => Ok(Script::Latin),
            "han" => Ok(Script::Han),
            "kana" => Ok(Script::Kana),
            "hangul" => Ok(Script::Hangul),
            "cyrillic" => Ok(Script::Cyrillic),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub tile_height: u32,
    pub overlap_ratio: f32,
    pub min_tile_height: u32,
    pub edge_tiles: EdgeTileMode,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_height: 1024,
            overlap_ratio: 0.5,
            min_tile_height: 256,
            edge_tiles: EdgeTileMode::Off,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Intersection over smaller-box area above which two boxes are duplicates.
    pub dedup_threshold: f32,
    /// Detections whose whole text matches one of these are dropped.
    pub numeric_patterns: Vec<String>,
    pub paragraph_fusion: bool,
    /// Row band, as a fraction of the shorter box height.
    pub row_tolerance_ratio: f32,
    /// Max horizontal gap between pieces of one row, as a fraction of line height.
    pub max_inline_gap_ratio: f32,
    /// Max vertical gap between stacked lines of one paragraph, as a fraction of line height.
    pub max_line_gap_ratio: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.5,
            numeric_patterns: vec![
                r"^[0-9０-９]+$".to_string(),
                r"^[0-9０-９]+\s*[/／]\s*[0-9０-９]+$".to_string(),
            ],
            paragraph_fusion: true,
            row_tolerance_ratio: 0.5,
            max_inline_gap_ratio: 1.0,
            max_line_gap_ratio: 0.8,
        }
    }
}

impl FusionConfig {
    /// Compile the numeric noise patterns.
    pub fn compile_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.numeric_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::Invalid(format!("numeric pattern {p:?}: {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Process-wide ceiling on in-flight detection engine calls.
    pub concurrency: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub target_lang: String,
    pub target_script: Script,
    pub source_scripts: Vec<Script>,
    pub batch_char_budget: usize,
    pub batch_max_items: usize,
    /// Inputs with fewer items than this go out as a single batch.
    pub small_input_items: usize,
    pub context_overhead: usize,
    pub context_chars: usize,
    pub concurrency: usize,
    pub primary_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Output-length multiplier for the strict missing-item retry.
    pub strict_output_growth: f32,
    pub retry_mode: RetryMode,
    pub salvage_cap: usize,
    pub page_call_budget: u32,
    pub page_time_budget_ms: Option<u64>,
    pub fail_fast: FailFastMode,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_lang: "en".to_string(),
            target_script: Script::Latin,
            source_scripts: vec![Script::Han, Script::Kana, Script::Hangul],
            batch_char_budget: 1800,
            batch_max_items: 24,
            small_input_items: 8,
            context_overhead: 16,
            context_chars: 48,
            concurrency: 3,
            primary_timeout_ms: 45_000,
            call_timeout_ms: 120_000,
            strict_output_growth: 1.5,
            retry_mode: RetryMode::Rebatch,
            salvage_cap: 4,
            page_call_budget: 64,
            page_time_budget_ms: None,
            fail_fast: FailFastMode::Continue,
            cache_capacity: 512,
            cache_ttl_secs: 600,
        }
    }
}

impl TranslationConfig {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn page_time_budget(&self) -> Option<Duration> {
        self.page_time_budget_ms.map(Duration::from_millis)
    }
}

/// Connection profile for an OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderProfile {
    pub id: String,
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub min_interval_ms: u64,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            id: "deepseek".to_string(),
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            min_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub primary: ProviderProfile,
    pub secondary: Option<ProviderProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tiling: TilingConfig,
    pub fusion: FusionConfig,
    pub detection: DetectionConfig,
    pub translation: TranslationConfig,
    pub providers: ProvidersConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file, apply process env overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        info!(path = %path.display(), "config_loaded");
        Ok(config)
    }

    /// Apply `PAGE_TRANSLATE_*` overrides. Unknown keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(knob) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let t = &mut self.translation;
            match knob {
                "TILE_HEIGHT" => self.tiling.tile_height = parse_knob(&key, &value)?,
                "OVERLAP_RATIO" => self.tiling.overlap_ratio = parse_knob(&key, &value)?,
                "MIN_TILE_HEIGHT" => self.tiling.min_tile_height = parse_knob(&key, &value)?,
                "EDGE_TILES" => self.tiling.edge_tiles = parse_knob(&key, &value)?,
                "DETECT_CONCURRENCY" => self.detection.concurrency = parse_knob(&key, &value)?,
                "BATCH_CHAR_BUDGET" => t.batch_char_budget = parse_knob(&key, &value)?,
                "BATCH_MAX_ITEMS" => t.batch_max_items = parse_knob(&key, &value)?,
                "TRANSLATE_CONCURRENCY" => t.concurrency = parse_knob(&key, &value)?,
                "PRIMARY_TIMEOUT_MS" => t.primary_timeout_ms = parse_knob(&key, &value)?,
                "CALL_TIMEOUT_MS" => t.call_timeout_ms = parse_knob(&key, &value)?,
                "PAGE_CALL_BUDGET" => t.page_call_budget = parse_knob(&key, &value)?,
                "PAGE_TIME_BUDGET_MS" => t.page_time_budget_ms = Some(parse_knob(&key, &value)?),
                "SALVAGE_CAP" => t.salvage_cap = parse_knob(&key, &value)?,
                "RETRY_MODE" => t.retry_mode = parse_knob(&key, &value)?,
                "FAIL_FAST" => t.fail_fast = parse_knob(&key, &value)?,
                "TARGET_LANG" => t.target_lang = value.trim().to_string(),
                "TARGET_SCRIPT" => t.target_script = parse_knob(&key, &value)?,
                "SMALL_INPUT_ITEMS" => t.small_input_items = parse_knob(&key, &value)?,
                "CONTEXT_OVERHEAD" => t.context_overhead = parse_knob(&key, &value)?,
                "CONTEXT_CHARS" => t.context_chars = parse_knob(&key, &value)?,
                "STRICT_OUTPUT_GROWTH" => t.strict_output_growth = parse_knob(&key, &value)?,
                "CACHE_CAPACITY" => t.cache_capacity = parse_knob(&key, &value)?,
                "CACHE_TTL_SECS" => t.cache_ttl_secs = parse_knob(&key, &value)?,
                "DEDUP_THRESHOLD" => self.fusion.dedup_threshold = parse_knob(&key, &value)?,
                "PARAGRAPH_FUSION" => self.fusion.paragraph_fusion = parse_knob(&key, &value)?,
                _ => continue,
            }
            info!(key = %key, value = %value, "config_override");
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiling.tile_height == 0 {
            return Err(ConfigError::Invalid("tile_height must be > 0".into()));
        }
        if !self.tiling.overlap_ratio.is_finite() {
            return Err(ConfigError::Invalid("overlap_ratio must be finite".into()));
        }
        let threshold = self.fusion.dedup_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "dedup_threshold must be in (0, 1], got {threshold}"
            )));
        }
        self.fusion.compile_patterns()?;
        if self.detection.concurrency == 0 || self.translation.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency ceilings must be > 0".into()));
        }
        let t = &self.translation;
        if t.page_call_budget == 0 {
            return Err(ConfigError::Invalid("page_call_budget must be > 0".into()));
        }
        if t.batch_char_budget == 0 || t.batch_max_items == 0 {
            return Err(ConfigError::Invalid("batch budgets must be > 0".into()));
        }
        if t.strict_output_growth < 1.0 {
            return Err(ConfigError::Invalid("strict_output_growth must be >= 1.0".into()));
        }
        if t.source_scripts.contains(&t.target_script) {
            return Err(ConfigError::Invalid(
                "target_script must not also be a source script".into(),
            ));
        }
        Ok(())
    }

    /// Config view safe to ship to reporting collaborators.
    pub fn sanitized(&self) -> SanitizedConfig {
        SanitizedConfig {
            tiling: self.tiling.clone(),
            fusion: self.fusion.clone(),
            detection: self.detection.clone(),
            translation: self.translation.clone(),
            primary_provider: ProviderSummary::from(&self.providers.primary),
            secondary_provider: self.providers.secondary.as_ref().map(ProviderSummary::from),
        }
    }
}

fn parse_knob<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Provider identity without connection secrets.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub model: String,
    pub base_url: String,
}

impl From<&ProviderProfile> for ProviderSummary {
    fn from(p: &ProviderProfile) -> Self {
        Self {
            id: p.id.clone(),
            model: p.model.clone(),
            base_url: p.base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub tiling: TilingConfig,
    pub fusion: FusionConfig,
    pub detection: DetectionConfig,
    pub translation: TranslationConfig,
    pub primary_provider: ProviderSummary,
    pub secondary_provider: Option<ProviderSummary>,
}
