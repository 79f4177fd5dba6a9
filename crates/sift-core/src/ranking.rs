//! Live best-of ranking.
//!
//! The merger combines the two backend scores into one ranking and keeps the
//! best [`TOP_K`] results seen so far, so that clients can display something
//! long before every backend has finished.
//!
//! ## Combined ranking
//!
//! The first result of a query seeds a reference pre-rank. Every later result
//! ranks as `pre + (reference * 0.1) * post`: the path-based pre-rank
//! dominates, the content-based post-rank only reorders results with similar
//! pre-ranks. The reference is an approximation of the maximum pre-rank, taken
//! early so that display does not wait for all results.

use crate::types::{ResultPointer, ResultRecord, TOP_K};
use std::cmp::Ordering;

/// Weight of the post-rank relative to the reference pre-rank.
const POST_RANK_WEIGHT: f32 = 0.1;

/// Order results best first: ranking descending, then path descending.
///
/// The path tie-break keeps the order stable across runs of the same query,
/// whichever backend answers first.
pub fn by_ranking(a: &ResultRecord, b: &ResultRecord) -> Ordering {
    b.ranking()
        .total_cmp(&a.ranking())
        .then_with(|| b.hit.path.cmp(&a.hit.path))
}

/// Order pointers best first: ranking descending, then path hash descending.
pub fn pointer_order(a: &ResultPointer, b: &ResultPointer) -> Ordering {
    b.ranking
        .total_cmp(&a.ranking)
        .then_with(|| b.path_hash.cmp(&a.path_hash))
}

/// Maintains the combined ranking reference and the best-of buffer.
///
/// Not synchronized on its own; the owning query state serializes access.
#[derive(Debug, Default)]
pub struct TopKMerger {
    reference: Option<f32>,
    best: Vec<ResultRecord>,
}

impl TopKMerger {
    pub fn new() -> Self {
        TopKMerger {
            reference: None,
            best: Vec::with_capacity(TOP_K + 1),
        }
    }

    /// The reference pre-rank, once seeded.
    pub fn reference(&self) -> Option<f32> {
        self.reference
    }

    /// Compute the combined ranking of a result.
    ///
    /// The first call with a positive pre-rank seeds the reference; that
    /// result ranks by its pre-rank alone.
    pub fn rank(&mut self, path_rank: f32, post_rank: f32) -> f32 {
        match self.reference {
            Some(reference) => path_rank + (reference * POST_RANK_WEIGHT) * post_rank,
            None => {
                if path_rank > 0.0 {
                    self.reference = Some(path_rank);
                }
                path_rank
            }
        }
    }

    /// Offer an already-ranked result. Returns true if it entered the buffer.
    pub fn offer(&mut self, record: &ResultRecord) -> bool {
        if self.best.len() >= TOP_K {
            let worst = &self.best[self.best.len() - 1];
            if by_ranking(record, worst) != Ordering::Less {
                return false;
            }
        }

        self.best.push(record.clone());
        self.best.sort_by(by_ranking);
        self.best.truncate(TOP_K);
        true
    }

    /// The current best results, best first.
    pub fn best(&self) -> &[ResultRecord] {
        &self.best
    }
}
