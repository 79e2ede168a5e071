//! Batch scheduler: partitions the reading-ordered regions into batches
//! whose estimated cost stays under the character budget.

use serde::Serialize;
use tracing::debug;

use super::BatchItem;
use crate::config::TranslationConfig;
use crate::ocr::RegionId;

/// A region queued for translation. `position` is its index in the page's
/// reading order and is how results find their way back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedItem {
    pub region_id: RegionId,
    pub position: usize,
    pub text: String,
    pub context: Option<String>,
}

impl PlannedItem {
    /// Characters of text and context plus the fixed per-item overhead.
    pub fn cost(&self, context_overhead: usize) -> usize {
        self.text.chars().count()
            + self.context.as_ref().map_or(0, |c| c.chars().count())
            + context_overhead
    }

    /// Provider input built from the original source text.
    pub fn to_batch_item(&self) -> BatchItem {
        BatchItem {
            text: self.text.clone(),
            context: self.context.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslationBatch {
    pub index: usize,
    pub items: Vec<PlannedItem>,
}

impl TranslationBatch {
    pub fn cost(&self, context_overhead: usize) -> usize {
        self.items.iter().map(|i| i.cost(context_overhead)).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<TranslationBatch>,
    /// Whole input sent as one batch because it was small.
    pub bypassed: bool,
}

pub fn plan_batches(items: Vec<PlannedItem>, config: &TranslationConfig) -> BatchPlan {
    if items.is_empty() {
        return BatchPlan {
            batches: Vec::new(),
            bypassed: false,
        };
    }
    if items.len() < config.small_input_items {
        debug!(items = items.len(), "batch_plan_bypassed");
        return BatchPlan {
            batches: vec![TranslationBatch { index: 0, items }],
            bypassed: true,
        };
    }

    let budget = config.batch_char_budget.max(1);
    let max_items = config.batch_max_items.max(1);
    let overhead = config.context_overhead;

    let mut batches: Vec<TranslationBatch> = Vec::new();
    let mut current: Vec<PlannedItem> = Vec::new();
    let mut current_cost = 0usize;
    for item in items {
        let cost = item.cost(overhead);
        let fits = current_cost + cost <= budget && current.len() < max_items;
        if !current.is_empty() && !fits {
            batches.push(TranslationBatch {
                index: batches.len(),
                items: std::mem::take(&mut current),
            });
            current_cost = 0;
        }
        // An item costlier than the whole budget travels alone.
        current_cost += cost;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(TranslationBatch {
            index: batches.len(),
            items: current,
        });
    }

    debug!(batches = batches.len(), budget, max_items, "batches_planned");
    BatchPlan {
        batches,
        bypassed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(lengths: &[usize]) -> Vec<PlannedItem> {
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| PlannedItem {
                region_id: RegionId(i as u32),
                position: i,
                text: "字".repeat(len),
                context: None,
            })
            .collect()
    }

    fn config(budget: usize, max_items: usize) -> TranslationConfig {
        TranslationConfig {
            batch_char_budget: budget,
            batch_max_items: max_items,
            small_input_items: 4,
            context_overhead: 10,
            ..TranslationConfig::default()
        }
    }

    #[test]
    fn batches_respect_budget_and_keep_order() {
        let cfg = config(100, 50);
        let plan = plan_batches(items(&[30, 30, 30, 40, 10, 5, 60, 20]), &cfg);
        assert!(!plan.bypassed);
        for batch in &plan.batches {
            assert!(batch.cost(cfg.context_overhead) <= 100);
        }
        let order: Vec<usize> = plan
            .batches
            .iter()
            .flat_map(|b| b.items.iter().map(|i| i.position))
            .collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
        assert!(plan.batches.iter().enumerate().all(|(i, b)| b.index == i));
    }

    #[test]
    fn item_cap_splits_batches() {
        let plan = plan_batches(items(&[1; 10]), &config(10_000, 3));
        let sizes: Vec<usize> = plan.batches.iter().map(|b| b.items.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn small_input_is_one_batch_even_over_budget() {
        let plan = plan_batches(items(&[90, 90, 90]), &config(100, 50));
        assert!(plan.bypassed);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].items.len(), 3);
    }

    #[test]
    fn oversized_item_travels_alone() {
        let plan = plan_batches(items(&[10, 500, 10, 10, 10]), &config(100, 50));
        let sizes: Vec<usize> = plan.batches.iter().map(|b| b.items.len()).collect();
        assert_eq!(sizes, vec![1, 1, 3]);
    }

    #[test]
    fn context_counts_toward_cost() {
        let mut item = items(&[10]).remove(0);
        assert_eq!(item.cost(5), 15);
        item.context = Some("abc".into());
        assert_eq!(item.cost(5), 18);
        assert!(plan_batches(Vec::new(), &config(10, 1)).batches.is_empty());
    }
}
