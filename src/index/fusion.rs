//! Reciprocal rank fusion of ranked result lists.

use rustc_hash::FxHashMap;

use crate::types::NodeId;

/// Per-list weights of a hybrid query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusionWeights {
    /// Weight of the full-text ranking.
    pub text: f32,
    /// Weight of the vector ranking.
    pub vector: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            text: 1.0,
            vector: 1.0,
        }
    }
}

/// Weights chosen from the query shape: short keyword queries lean on text,
/// long natural-language queries lean on vectors.
pub fn adaptive_weights(query_tokens: usize) -> FusionWeights {
    match query_tokens {
        0..=2 => FusionWeights {
            text: 1.0,
            vector: 0.7,
        },
        3..=5 => FusionWeights::default(),
        _ => FusionWeights {
            text: 0.7,
            vector: 1.0,
        },
    }
}

/// Fuses ranked lists with `score(id) = Σ w / (k + rank)`, ranks 1-based.
///
/// Output is sorted by descending score; equal scores order by ascending id.
pub fn reciprocal_rank_fusion(lists: &[(&[NodeId], f32)], k: u32) -> Vec<(NodeId, f32)> {
    let mut scores: FxHashMap<NodeId, f64> = FxHashMap::default();
    for (list, weight) in lists {
        for (rank, id) in list.iter().enumerate() {
            let contribution = f64::from(*weight) / (f64::from(k) + (rank + 1) as f64);
            *scores.entry(*id).or_insert(0.0) += contribution;
        }
    }
    let mut fused: Vec<(NodeId, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused.into_iter().map(|(id, s)| (id, s as f32)).collect()
}
