//! Per-page remote-call and time budget.
//! One `PageBudget` is shared by every batch of a page. Running out of calls
//! stops new calls; hitting the deadline or aborting the page also cancels
//! waits already in progress so pending items fail fast instead of blocking.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::translate::TranslateError;

pub struct PageBudget {
    max_calls: u32,
    calls_used: AtomicU32,
    rejected: AtomicU32,
    deadline: Option<Instant>,
    token: CancellationToken,
    expired: AtomicBool,
    aborted: AtomicBool,
}

impl PageBudget {
    pub fn new(max_calls: u32, time_budget: Option<Duration>) -> Self {
        Self {
            max_calls,
            calls_used: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            deadline: time_budget.map(|d| Instant::now() + d),
            token: CancellationToken::new(),
            expired: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    /// Reserve one remote call.
    pub fn try_acquire_call(&self) -> Result<(), TranslateError> {
        if self.token.is_cancelled() {
            return Err(self.stop_error());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.expire();
                return Err(TranslateError::BudgetExhausted);
            }
        }
        let reserved = self
            .calls_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max_calls).then_some(used + 1)
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(used) => {
                if self.rejected.fetch_add(1, Ordering::SeqCst) == 0 {
                    warn!(used, max = self.max_calls, "page_call_budget_exhausted");
                }
                Err(TranslateError::BudgetExhausted)
            }
        }
    }

    /// Runs `fut` unless the page is stopped first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, TranslateError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.stopped() => Err(self.stop_error()),
        }
    }

    /// Resolves once the page is aborted or its deadline passes.
    pub async fn stopped(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => self.expire(),
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Fail-fast abort: cancels every pending wait on this page.
    pub fn abort(&self, reason: &str) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            warn!(reason, "page_aborted");
        }
        self.token.cancel();
    }

    fn expire(&self) {
        if !self.expired.swap(true, Ordering::SeqCst) {
            warn!("page_time_budget_exhausted");
        }
        self.token.cancel();
    }

    fn stop_error(&self) -> TranslateError {
        if self.aborted.load(Ordering::SeqCst) {
            TranslateError::Cancelled
        } else {
            TranslateError::BudgetExhausted
        }
    }

    pub fn calls_used(&self) -> u32 {
        self.calls_used.load(Ordering::SeqCst)
    }

    /// Calls refused because the budget was already spent.
    pub fn rejected_calls(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.expired.load(Ordering::SeqCst) || self.rejected_calls() > 0
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
