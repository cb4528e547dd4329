//! Reciprocal Rank Fusion of lexical and semantic result lists.
//!
//! The two backends score on incompatible scales (BM25 vs cosine), so only
//! ranks are compared: each item scores `Σ 1 / (k + rank)` over the lists it
//! appears in. [`fuse`] is a pure function of its inputs: no I/O, no clock.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::fact::Fact;
use crate::{RecollectError, Result, ScoredFact};

/// Default RRF rank constant.
pub const DEFAULT_RRF_K: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    /// RRF rank constant.
    pub k: u32,
    /// Number of results returned.
    pub limit: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            limit: 10,
        }
    }
}

impl FusionParams {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(RecollectError::Search("fusion: `k` must be >= 1".to_string()));
        }
        if self.limit == 0 {
            return Err(RecollectError::Search(
                "fusion: `limit` must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which backend supplied the representative copy of a fused item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Lexical,
    Semantic,
}

/// One fused result. `score` is the RRF value, not a backend score.
#[derive(Debug, Clone, Serialize)]
pub struct RankedFact {
    pub fact: Fact,
    pub score: f64,
    /// 1-based rank in the lexical list, if present there.
    pub lexical_rank: Option<usize>,
    /// 1-based rank in the semantic list, if present there.
    pub semantic_rank: Option<usize>,
    pub origin: Origin,
}

struct Slot {
    fact: Fact,
    normalized: String,
    lexical_rank: Option<usize>,
    semantic_rank: Option<usize>,
    origin: Origin,
}

/// Merge two ranked lists into one.
///
/// Items are matched across lists by id, then by normalized text. The first
/// copy seen wins and lexical is seen first, so exact hits are the canonical
/// representative. Items whose normalized text is in `superseded_texts` are
/// dropped. Ties on RRF break by recency (newer first), then lexical origin,
/// then id.
///
/// Both lists must already be scope-filtered.
pub fn fuse(
    lexical: Vec<ScoredFact>,
    semantic: Vec<ScoredFact>,
    superseded_texts: &HashSet<String>,
    params: &FusionParams,
) -> Vec<RankedFact> {
    let mut slots: Vec<Slot> = Vec::with_capacity(lexical.len() + semantic.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut by_text: HashMap<String, usize> = HashMap::new();

    for (origin, list) in [(Origin::Lexical, lexical), (Origin::Semantic, semantic)] {
        for (rank, fact) in sorted_by_score(list).into_iter().enumerate() {
            let rank = rank + 1;
            let normalized = fact.normalized_text();
            let existing = by_id
                .get(fact.id.as_str())
                .or_else(|| by_text.get(&normalized))
                .copied();

            let idx = match existing {
                Some(idx) => idx,
                None => {
                    slots.push(Slot {
                        fact,
                        normalized: normalized.clone(),
                        lexical_rank: None,
                        semantic_rank: None,
                        origin,
                    });
                    let idx = slots.len() - 1;
                    by_id.insert(slots[idx].fact.id.0.clone(), idx);
                    by_text.entry(normalized).or_insert(idx);
                    idx
                }
            };

            // A repeat within one list keeps the better (earlier) rank.
            let slot_rank = match origin {
                Origin::Lexical => &mut slots[idx].lexical_rank,
                Origin::Semantic => &mut slots[idx].semantic_rank,
            };
            if slot_rank.is_none() {
                *slot_rank = Some(rank);
            }
        }
    }

    let k = f64::from(params.k);
    let mut fused: Vec<RankedFact> = slots
        .into_iter()
        .filter(|slot| !superseded_texts.contains(&slot.normalized))
        .map(|slot| {
            let score = [slot.lexical_rank, slot.semantic_rank]
                .into_iter()
                .flatten()
                .map(|rank| 1.0 / (k + rank as f64))
                .sum();
            RankedFact {
                fact: slot.fact,
                score,
                lexical_rank: slot.lexical_rank,
                semantic_rank: slot.semantic_rank,
                origin: slot.origin,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.fact.recency().cmp(&a.fact.recency()))
            .then_with(|| a.origin.cmp(&b.origin))
            .then_with(|| a.fact.id.cmp(&b.fact.id))
    });
    fused.truncate(params.limit);
    fused
}

/// Stable sort by native score, best first. NaN scores sink to the end.
fn sorted_by_score(mut list: Vec<ScoredFact>) -> Vec<Fact> {
    list.sort_by(|a, b| sortable(b.score).total_cmp(&sortable(a.score)));
    list.into_iter().map(|s| s.fact).collect()
}

fn sortable(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}
