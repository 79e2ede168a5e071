//! Concurrency gates shared by every page in the process.
//! Detection calls and provider calls each take a permit for the duration
//! of one call. Detection finishes before translation starts, so a task
//! never holds a detection permit while waiting for a translation permit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Detect,
    Translate,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Detect => "detect",
            GateKind::Translate => "translate",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{} gate closed", .0.as_str())]
pub struct GateClosed(pub GateKind);

/// A held permit plus how long it took to get it.
/// The permit is released when this is dropped, on every exit path.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    pub kind: GateKind,
    pub waited: Duration,
}

pub struct GateSet {
    detect: Arc<Semaphore>,
    translate: Arc<Semaphore>,
    detect_limit: usize,
    translate_limit: usize,
}

impl GateSet {
    pub fn new(detect_limit: usize, translate_limit: usize) -> Self {
        let detect_limit = detect_limit.max(1);
        let translate_limit = translate_limit.max(1);
        Self {
            detect: Arc::new(Semaphore::new(detect_limit)),
            translate: Arc::new(Semaphore::new(translate_limit)),
            detect_limit,
            translate_limit,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.detection.concurrency, config.translation.concurrency)
    }

    pub async fn acquire_detect(&self) -> Result<GatePermit, GateClosed> {
        Self::acquire(&self.detect, GateKind::Detect).await
    }

    pub async fn acquire_translate(&self) -> Result<GatePermit, GateClosed> {
        Self::acquire(&self.translate, GateKind::Translate).await
    }

    async fn acquire(semaphore: &Arc<Semaphore>, kind: GateKind) -> Result<GatePermit, GateClosed> {
        let start = Instant::now();
        let permit = Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed(kind))?;
        let waited = start.elapsed();
        if !waited.is_zero() {
            debug!(gate = kind.as_str(), waited_us = waited.as_micros() as u64, "gate_wait");
        }
        Ok(GatePermit {
            _permit: permit,
            kind,
            waited,
        })
    }

    pub fn limit(&self, kind: GateKind) -> usize {
        match kind {
            GateKind::Detect => self.detect_limit,
            GateKind::Translate => self.translate_limit,
        }
    }

    pub fn available(&self, kind: GateKind) -> usize {
        match kind {
            GateKind::Detect => self.detect.available_permits(),
            GateKind::Translate => self.translate.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let gates = GateSet::new(1, 2);
        let first = gates.acquire_detect().await.unwrap();
        assert_eq!(gates.available(GateKind::Detect), 0);
        drop(first);
        assert_eq!(gates.available(GateKind::Detect), 1);
        assert_eq!(gates.limit(GateKind::Translate), 2);
    }

    #[tokio::test]
    async fn second_caller_waits_and_reports_it() {
        let gates = Arc::new(GateSet::new(1, 1));
        let held = gates.acquire_translate().await.unwrap();
        let waiter = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.acquire_translate().await.map(|p| p.waited) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);
        let waited = waiter.await.unwrap().unwrap();
        assert!(waited >= Duration::from_millis(20));
    }

    #[test]
    fn zero_limits_are_raised_to_one() {
        let gates = GateSet::new(0, 0);
        assert_eq!(gates.limit(GateKind::Detect), 1);
        assert_eq!(gates.available(GateKind::Translate), 1);
    }
}
