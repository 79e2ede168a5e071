//! OpenAI-compatible chat/completions provider (DeepSeek by default).
//! Connection pooling via reqwest, request pacing, and retry for 429/5xx.
//! Those retries stay inside one recorded call attempt.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::warn;

use super::numbered::{build_prompt, parse_numbered, SYSTEM_PROMPT};
use super::{BatchItem, ProviderFuture, RequestOptions, TranslateError, TranslationProvider};
use crate::config::ProviderProfile;

pub struct ChatProvider {
    id: String,
    model: String,
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    /// Tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    /// Minimum interval between requests.
    min_interval: Duration,
}

impl ChatProvider {
    /// Create a provider from its profile. Reads the API key from the
    /// environment variable the profile names.
    pub fn from_profile(profile: &ProviderProfile) -> Result<Self, TranslateError> {
        let api_key = std::env::var(&profile.api_key_env).map_err(|_| {
            TranslateError::InvalidInput(format!(
                "{} environment variable not set",
                profile.api_key_env
            ))
        })?;
        Self::with_api_key(profile, api_key)
    }

    pub fn with_api_key(profile: &ProviderProfile, api_key: String) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TranslateError::Provider(e.to_string()))?;

        Ok(Self {
            id: profile.id.clone(),
            model: profile.model.clone(),
            http,
            api_key,
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(profile.min_interval_ms),
        })
    }

    /// Wait until pacing allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    fn request_body(&self, user_prompt: &str, options: &RequestOptions) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "max_tokens": options.max_output_tokens,
            "stream": false,
            "temperature": if options.strict { 0.0 } else { 0.1 }
        })
    }

    async fn complete(&self, user_prompt: &str, options: &RequestOptions) -> Result<String, TranslateError> {
        self.rate_limit_wait().await;
        let body = self.request_body(user_prompt, options);
        let response = self.send_with_retry(&body, options.timeout).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Provider(format!("decode response: {e}")))?;
        parsed.into_content()
    }

    /// POST the request, retrying rate limits and server errors per
    /// [`retry_delay`]. A transport timeout is final: the caller's deadline
    /// for the whole call is the same duration, so a second try cannot finish.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, TranslateError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut attempt: u32 = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(timeout)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        TranslateError::Timeout
                    } else {
                        TranslateError::Provider(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);

            let Some(wait) = retry_delay(status, retry_after, attempt) else {
                return Err(status_error(status, retry_after, response).await);
            };
            warn!(
                provider = %self.id,
                status = status.as_u16(),
                attempt,
                wait_ms = wait.as_millis() as u64,
                "provider_retry"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const MAX_SERVER_RETRIES: u32 = 2;

/// Backoff before retrying a failed status, or `None` to give up.
/// 429 honours `Retry-After`, else waits 1s, 2s, 4s. 5xx waits 0.5s, 1s.
fn retry_delay(status: StatusCode, retry_after: Option<Duration>, attempt: u32) -> Option<Duration> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        (attempt < MAX_RATE_LIMIT_RETRIES)
            .then(|| retry_after.unwrap_or_else(|| Duration::from_secs(1 << attempt)))
    } else if status.is_server_error() {
        (attempt < MAX_SERVER_RETRIES).then(|| Duration::from_millis(500 << attempt))
    } else {
        None
    }
}

async fn status_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    response: reqwest::Response,
) -> TranslateError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TranslateError::RateLimited {
            retry_after_ms: retry_after.map_or(0, |d| d.as_millis() as u64),
        };
    }
    if status.is_server_error() {
        return TranslateError::Provider(format!("server error: {status}"));
    }
    let body = response.text().await.unwrap_or_default();
    TranslateError::Provider(format!(
        "unexpected status {status}: {}",
        body.chars().take(200).collect::<String>()
    ))
}

impl TranslationProvider for ChatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn translate_batch<'a>(
        &'a self,
        items: &'a [BatchItem],
        options: &'a RequestOptions,
    ) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            let prompt = build_prompt(items, &options.target_lang, options.strict);
            let reply = self.complete(&prompt, options).await?;
            Ok(parse_numbered(&reply, items.len()))
        })
    }

    fn translate_one<'a>(
        &'a self,
        item: &'a BatchItem,
        options: &'a RequestOptions,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let prompt = build_prompt(std::slice::from_ref(item), &options.target_lang, options.strict);
            let reply = self.complete(&prompt, options).await?;
            let mut parsed = parse_numbered(&reply, 1);
            let line = parsed.pop().unwrap_or_default();
            // A lone reply may come back without its number.
            if line.is_empty() {
                Ok(reply.trim().to_string())
            } else {
                Ok(line)
            }
        })
    }
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatResponse {
    fn into_content(self) -> Result<String, TranslateError> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TranslateError::Provider("response has no content".into()))
    }
}
