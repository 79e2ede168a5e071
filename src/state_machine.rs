//! Item lifecycle inside the fallback chain:
//! Pending → PrimaryAttempt → SecondaryAttempt → StrictRetry → ItemRetry → Done/Failed.
//! Every stage may be skipped forward, never revisited, so each item reaches a
//! terminal state after a bounded number of transitions.

use serde::Serialize;
use tracing::{debug, warn};

/// Why an item ended up without a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every provider call covering the item failed or timed out.
    ProviderFailed,
    /// The provider never returned a usable line for the item.
    MissingOutput,
    /// Output kept failing the target-script check.
    InvalidOutput,
    /// Page call or time budget ran out first.
    BudgetExhausted,
    /// The page was aborted by fail-fast mode.
    Aborted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ProviderFailed => write!(f, "provider_failed"),
            FailureReason::MissingOutput => write!(f, "missing_output"),
            FailureReason::InvalidOutput => write!(f, "invalid_output"),
            FailureReason::BudgetExhausted => write!(f, "budget_exhausted"),
            FailureReason::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ItemState {
    Pending,
    PrimaryAttempt,
    SecondaryAttempt,
    /// Whole-batch retry with the stricter numbered-output instruction.
    StrictRetry,
    /// Re-batched or individual retry of this item alone.
    ItemRetry,
    Done,
    Failed(FailureReason),
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemState::Pending => write!(f, "Pending"),
            ItemState::PrimaryAttempt => write!(f, "PrimaryAttempt"),
            ItemState::SecondaryAttempt => write!(f, "SecondaryAttempt"),
            ItemState::StrictRetry => write!(f, "StrictRetry"),
            ItemState::ItemRetry => write!(f, "ItemRetry"),
            ItemState::Done => write!(f, "Done"),
            ItemState::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed(_))
    }

    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, PrimaryAttempt)
                | (PrimaryAttempt, Done)
                | (PrimaryAttempt, SecondaryAttempt)
                | (PrimaryAttempt, StrictRetry)
                | (PrimaryAttempt, ItemRetry)
                | (SecondaryAttempt, Done)
                | (SecondaryAttempt, StrictRetry)
                | (SecondaryAttempt, ItemRetry)
                | (StrictRetry, Done)
                | (StrictRetry, ItemRetry)
                | (ItemRetry, Done)
        ) || (!self.is_terminal() && matches!(next, Failed(_)))
    }
}

/// States of every item of one batch, addressed by position in the batch.
pub struct ItemTracker {
    batch_index: usize,
    states: Vec<ItemState>,
}

impl ItemTracker {
    pub fn new(batch_index: usize, items: usize) -> Self {
        Self {
            batch_index,
            states: vec![ItemState::Pending; items],
        }
    }

    pub fn state(&self, item: usize) -> ItemState {
        self.states[item]
    }

    pub fn states(&self) -> &[ItemState] {
        &self.states
    }

    /// Attempt a transition. Invalid transitions leave the state unchanged.
    pub fn advance(&mut self, item: usize, next: ItemState) -> Result<ItemState, String> {
        let current = self.states[item];
        if current == next {
            return Ok(next);
        }
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {current} -> {next}");
            warn!(batch = self.batch_index, item, "{}", msg);
            return Err(msg);
        }
        self.states[item] = next;
        debug!(batch = self.batch_index, item, from = %current, to = %next, "item_transition");
        Ok(next)
    }

    /// Move every non-terminal item in `items` to `next`.
    pub fn advance_all(&mut self, items: &[usize], next: ItemState) {
        for &item in items {
            if !self.states[item].is_terminal() {
                let _ = self.advance(item, next);
            }
        }
    }

    /// Positions of items not yet in a terminal state.
    pub fn unresolved(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }
}
