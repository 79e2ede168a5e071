//! Fallback chain for one batch:
//! primary → secondary (once, if configured) → strict whole-batch retry when
//! numbered outputs are missing → re-batched or per-item retry of what is
//! still failing → explicit failure marker.
//!
//! Every retry is built from the original source text held by the batch,
//! never from an earlier output. Every call goes through the page budget and
//! the translation gate and is appended to the page's attempt log. A call
//! slot is reserved after the gate admits the call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use super::batch::TranslationBatch;
use super::normalize::{OutputCheck, ScriptValidator};
use super::numbered::max_output_tokens;
use super::{BatchItem, RequestOptions, TranslateError, TranslationProvider};
use crate::budget::PageBudget;
use crate::config::{FailFastMode, RetryMode, TranslationConfig};
use crate::gate::{GateKind, GateSet};
use crate::metrics::{CallAttempt, CallKind, CallOutcome, PageRecorder, StageClock, StageTiming};
use crate::ocr::RegionId;
use crate::state_machine::{FailureReason, ItemState, ItemTracker};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Translated { text: String, provider: String },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub region_id: RegionId,
    pub position: usize,
    pub outcome: ItemOutcome,
}

pub struct BatchOutcome {
    pub batch_index: usize,
    pub results: Vec<ItemResult>,
    /// Wall time of the batch split into gate waits and calls.
    pub lane: StageTiming,
}

/// Page-scoped chain shared by every batch of one page.
pub struct FallbackChain<'a> {
    primary: &'a dyn TranslationProvider,
    secondary: Option<&'a dyn TranslationProvider>,
    validator: &'a ScriptValidator,
    config: &'a TranslationConfig,
    budget: &'a PageBudget,
    recorder: &'a PageRecorder,
    gates: &'a GateSet,
    salvage_left: AtomicUsize,
}

struct BatchRun<'b> {
    batch: &'b TranslationBatch,
    tracker: ItemTracker,
    resolved: Vec<Option<(String, String)>>,
    reasons: Vec<FailureReason>,
    lane: StageClock,
    attempts: u32,
}

/// Errors that end the whole batch rather than one attempt.
fn stop_reason(err: &TranslateError) -> Option<FailureReason> {
    match err {
        TranslateError::BudgetExhausted => Some(FailureReason::BudgetExhausted),
        TranslateError::Cancelled => Some(FailureReason::Aborted),
        _ => None,
    }
}

impl<'a> FallbackChain<'a> {
    pub fn new(
        primary: &'a dyn TranslationProvider,
        secondary: Option<&'a dyn TranslationProvider>,
        validator: &'a ScriptValidator,
        config: &'a TranslationConfig,
        budget: &'a PageBudget,
        recorder: &'a PageRecorder,
        gates: &'a GateSet,
    ) -> Self {
        Self {
            primary,
            secondary,
            validator,
            config,
            budget,
            recorder,
            gates,
            salvage_left: AtomicUsize::new(config.salvage_cap),
        }
    }

    /// Drive every item of `batch` to `Done` or `Failed`.
    pub async fn run(&self, batch: &TranslationBatch) -> BatchOutcome {
        let n = batch.items.len();
        let mut run = BatchRun {
            batch,
            tracker: ItemTracker::new(batch.index, n),
            resolved: vec![None; n],
            reasons: vec![FailureReason::ProviderFailed; n],
            lane: StageClock::start(format!("batch_{}", batch.index)),
            attempts: 0,
        };

        let stopped = self.drive(&mut run).await.err();
        self.finalize(&mut run, stopped);
        run.lane.lap("finalize");

        let BatchRun {
            mut resolved,
            tracker,
            lane,
            ..
        } = run;
        let results: Vec<ItemResult> = batch
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let outcome = match (resolved[i].take(), tracker.state(i)) {
                    (Some((text, provider)), _) => ItemOutcome::Translated { text, provider },
                    (None, ItemState::Failed(reason)) => ItemOutcome::Failed { reason },
                    (None, _) => ItemOutcome::Failed {
                        reason: FailureReason::ProviderFailed,
                    },
                };
                ItemResult {
                    region_id: item.region_id,
                    position: item.position,
                    outcome,
                }
            })
            .collect();

        debug!(
            batch = batch.index,
            items = n,
            failed = results
                .iter()
                .filter(|r| matches!(r.outcome, ItemOutcome::Failed { .. }))
                .count(),
            "batch_finished"
        );
        BatchOutcome {
            batch_index: batch.index,
            results,
            lane: lane.finish(),
        }
    }

    async fn drive(&self, run: &mut BatchRun<'_>) -> Result<(), FailureReason> {
        let all: Vec<usize> = (0..run.batch.items.len()).collect();
        let call_timeout = self.config.call_timeout();
        // Without a secondary there is nothing to fall back to, so the
        // primary only runs under the hard per-call cap.
        let primary_timeout = if self.secondary.is_some() {
            self.config.primary_timeout()
        } else {
            call_timeout
        };

        run.tracker.advance_all(&all, ItemState::PrimaryAttempt);
        let mut active = self.primary;
        let mut missing = Vec::new();
        match self
            .call(run, self.primary, CallKind::Primary, &all, false, primary_timeout)
            .await
        {
            Ok(outputs) => missing = self.absorb(run, &all, &outputs, self.primary.id()),
            Err(err) => {
                if let Some(stop) = stop_reason(&err) {
                    return Err(stop);
                }
                if let Some(secondary) = self.secondary {
                    warn!(batch = run.batch.index, error = %err, fallback = secondary.id(), "primary_failed_falling_back");
                    run.tracker.advance_all(&all, ItemState::SecondaryAttempt);
                    match self
                        .call(run, secondary, CallKind::Secondary, &all, false, call_timeout)
                        .await
                    {
                        Ok(outputs) => {
                            active = secondary;
                            missing = self.absorb(run, &all, &outputs, secondary.id());
                        }
                        Err(err) => {
                            if let Some(stop) = stop_reason(&err) {
                                return Err(stop);
                            }
                            warn!(batch = run.batch.index, error = %err, "secondary_failed");
                        }
                    }
                }
            }
        }

        if !missing.is_empty() {
            warn!(
                batch = run.batch.index,
                missing = missing.len(),
                expected = all.len(),
                "missing_outputs_strict_retry"
            );
            let pending = run.tracker.unresolved();
            run.tracker.advance_all(&pending, ItemState::StrictRetry);
            match self
                .call(run, active, CallKind::MissingRetry, &all, true, call_timeout)
                .await
            {
                Ok(outputs) => {
                    self.absorb(run, &all, &outputs, active.id());
                }
                Err(err) => {
                    if let Some(stop) = stop_reason(&err) {
                        return Err(stop);
                    }
                }
            }
        }

        let mut pending = run.tracker.unresolved();
        if pending.is_empty() {
            return Ok(());
        }
        run.tracker.advance_all(&pending, ItemState::ItemRetry);

        if self.config.retry_mode == RetryMode::Rebatch && pending.len() > 1 {
            match self
                .call(run, active, CallKind::Rebatch, &pending, true, call_timeout)
                .await
            {
                Ok(outputs) => {
                    self.absorb(run, &pending, &outputs, active.id());
                }
                Err(err) => {
                    if let Some(stop) = stop_reason(&err) {
                        return Err(stop);
                    }
                }
            }
            pending = run.tracker.unresolved();
        }

        // Sequential so each salvage call is attributed on its own.
        for idx in pending {
            if !self.take_salvage_slot() {
                debug!(batch = run.batch.index, item = idx, "salvage_cap_reached");
                continue;
            }
            match self
                .call(run, active, CallKind::PerItem, &[idx], true, call_timeout)
                .await
            {
                Ok(outputs) => {
                    self.absorb(run, &[idx], &outputs, active.id());
                }
                Err(err) => {
                    if let Some(stop) = stop_reason(&err) {
                        return Err(stop);
                    }
                }
            }
        }
        Ok(())
    }

    /// Accept valid outputs for `sent` items. Returns the items whose output
    /// was missing or empty.
    fn absorb(
        &self,
        run: &mut BatchRun<'_>,
        sent: &[usize],
        outputs: &[String],
        provider: &str,
    ) -> Vec<usize> {
        let mut missing = Vec::new();
        for (k, &idx) in sent.iter().enumerate() {
            if run.resolved[idx].is_some() {
                continue;
            }
            let output = outputs.get(k).map(|s| s.trim()).unwrap_or("");
            let item = &run.batch.items[idx];
            match self.validator.check(&item.text, output) {
                OutputCheck::Valid => {
                    run.resolved[idx] = Some((output.to_string(), provider.to_string()));
                    let _ = run.tracker.advance(idx, ItemState::Done);
                }
                OutputCheck::Empty => {
                    run.reasons[idx] = FailureReason::MissingOutput;
                    missing.push(idx);
                }
                OutputCheck::LeakedSourceScript => {
                    debug!(batch = run.batch.index, region = %item.region_id, "corrupted_output_discarded");
                    run.reasons[idx] = FailureReason::InvalidOutput;
                }
                OutputCheck::MissingTargetScript => {
                    run.reasons[idx] = FailureReason::InvalidOutput;
                }
            }
        }
        missing
    }

    /// Mark whatever is still unresolved as failed.
    fn finalize(&self, run: &mut BatchRun<'_>, stopped: Option<FailureReason>) {
        let mut failed = 0;
        for idx in run.tracker.unresolved() {
            let reason = stopped.unwrap_or(run.reasons[idx]);
            let _ = run.tracker.advance(idx, ItemState::Failed(reason));
            warn!(
                batch = run.batch.index,
                region = %run.batch.items[idx].region_id,
                reason = %reason,
                "item_marked_failed"
            );
            if reason != FailureReason::Aborted {
                failed += 1;
            }
        }
        if failed > 0 && self.config.fail_fast == FailFastMode::AbortPage {
            self.budget.abort("unrecoverable item");
        }
    }

    fn take_salvage_slot(&self) -> bool {
        self.salvage_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    /// One remote call for the `sent` items, gated, budgeted, timed and logged.
    async fn call(
        &self,
        run: &mut BatchRun<'_>,
        provider: &dyn TranslationProvider,
        kind: CallKind,
        sent: &[usize],
        strict: bool,
        timeout: Duration,
    ) -> Result<Vec<String>, TranslateError> {
        let permit = self
            .budget
            .guard(self.gates.acquire_translate())
            .await?
            .map_err(|e| TranslateError::Provider(e.to_string()))?;
        run.lane.lap("gate_wait");
        self.recorder
            .record_gate_wait(GateKind::Translate, permit.waited.as_micros() as u64);
        // Reserved only once the call is certain to go out, so every used
        // slot has a matching attempt in the log.
        if let Err(err) = self.budget.try_acquire_call() {
            if err == TranslateError::BudgetExhausted {
                self.recorder.record_budget_rejection();
            }
            return Err(err);
        }

        let inputs: Vec<BatchItem> = sent
            .iter()
            .map(|&i| run.batch.items[i].to_batch_item())
            .collect();
        let options = RequestOptions {
            target_lang: self.config.target_lang.clone(),
            timeout,
            strict,
            max_output_tokens: max_output_tokens(&inputs, strict, self.config.strict_output_growth),
        };
        run.attempts += 1;
        let started_at_us = self.recorder.offset_us();
        let started = Instant::now();
        let request = async {
            match (kind, inputs.first()) {
                (CallKind::PerItem, Some(item)) => provider
                    .translate_one(item, &options)
                    .await
                    .map(|text| vec![text]),
                _ => provider.translate_batch(&inputs, &options).await,
            }
        };
        let result = match self.budget.guard(tokio::time::timeout(timeout, request)).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(_elapsed)) => Err(TranslateError::Timeout),
            Err(stop) => Err(stop),
        };
        let duration = started.elapsed();
        drop(permit);
        run.lane.lap(kind.as_str());

        let valid_outputs = match &result {
            Ok(outputs) => sent
                .iter()
                .zip(outputs)
                .filter(|&(&i, out)| self.validator.check(&run.batch.items[i].text, out).is_valid())
                .count(),
            Err(_) => 0,
        };
        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(TranslateError::Timeout) => CallOutcome::Timeout,
            Err(TranslateError::Cancelled | TranslateError::BudgetExhausted) => CallOutcome::Cancelled,
            Err(_) => CallOutcome::Error,
        };
        if let Err(err) = &result {
            warn!(
                batch = run.batch.index,
                provider = provider.id(),
                kind = kind.as_str(),
                error = %err,
                "provider_call_failed"
            );
        }
        self.recorder.record_attempt(CallAttempt {
            provider: provider.id().to_string(),
            kind,
            batch_index: run.batch.index,
            attempt_number: run.attempts,
            started_at_us,
            duration_us: duration.as_micros() as u64,
            outcome,
            items: sent.len(),
            valid_outputs,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }
}
