//! Hierarchical navigable small-world graph for approximate nearest neighbours.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::kernel::{normalize, Metric, VectorKernel};
use crate::types::{EngineError, NodeId, Result};

/// Tuning parameters of an [`HnswIndex`].
#[derive(Clone, Debug)]
pub struct HnswParams {
    /// Embedding dimension.
    pub dimensions: usize,
    /// Links per node on upper layers; layer 0 keeps `2 * m`.
    pub m: usize,
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Candidate list size while searching.
    pub ef_search: usize,
    /// Similarity metric.
    pub metric: Metric,
    /// Seed of the level generator; fixed seeds give identical graphs.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            dimensions: 384,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            metric: Metric::Cosine,
            seed: 0x5EED_CAFE,
        }
    }
}

const MAX_LEVEL: usize = 16;

struct Slot {
    id: NodeId,
    vector: Vec<f32>,
    links: Vec<Vec<u32>>,
    deleted: bool,
}

/// Candidate ordered by distance, then slot for a total order.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Scored {
    dist: f32,
    slot: u32,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

/// In-memory HNSW index keyed by node id.
///
/// Removal tombstones the slot; tombstoned slots still route searches but are
/// never returned. Once more than a quarter of the slots are tombstones the
/// graph is rebuilt from the live vectors.
pub struct HnswIndex {
    params: HnswParams,
    kernel: Arc<dyn VectorKernel>,
    slots: Vec<Slot>,
    ids: FxHashMap<NodeId, u32>,
    entry: Option<u32>,
    max_level: usize,
    level_mult: f64,
    rng: ChaCha8Rng,
    tombstones: usize,
}

impl HnswIndex {
    /// Creates an empty index.
    pub fn new(params: HnswParams, kernel: Arc<dyn VectorKernel>) -> Self {
        let m = params.m.max(2);
        let rng = ChaCha8Rng::seed_from_u64(params.seed);
        Self {
            level_mult: 1.0 / (m as f64).ln(),
            params: HnswParams { m, ..params },
            kernel,
            slots: Vec::new(),
            ids: FxHashMap::default(),
            entry: None,
            max_level: 0,
            rng,
            tombstones: 0,
        }
    }

    /// Index parameters.
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Live vectors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true when no live vector is stored.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Tombstoned slots awaiting a rebuild.
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Whether `id` has a live vector.
    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains_key(&id)
    }

    /// Whether `id` is live with exactly `vector`, after metric
    /// normalisation.
    pub fn holds(&self, id: NodeId, vector: &[f32]) -> bool {
        if vector.len() != self.params.dimensions {
            return false;
        }
        match self.ids.get(&id) {
            Some(&slot) => self.slots[slot as usize].vector == self.prepare(vector),
            None => false,
        }
    }

    /// Name of the distance kernel in use.
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    fn check_dims(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.params.dimensions {
            return Err(EngineError::InvalidOwned(format!(
                "embedding has {} dimensions, index expects {}",
                vector.len(),
                self.params.dimensions
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(EngineError::Invalid("embedding must be finite"));
        }
        Ok(())
    }

    fn prepare(&self, vector: &[f32]) -> Vec<f32> {
        let mut v = vector.to_vec();
        if self.params.metric == Metric::Cosine {
            normalize(&mut v);
        }
        v
    }

    fn dist(&self, query: &[f32], slot: u32) -> f32 {
        self.kernel
            .distance(self.params.metric, query, &self.slots[slot as usize].vector)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-uniform.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    /// Inserts or replaces the vector of `id`.
    pub fn insert(&mut self, id: NodeId, vector: &[f32]) -> Result<()> {
        self.check_dims(vector)?;
        if self.ids.contains_key(&id) {
            self.tombstone(id);
        }
        let vector = self.prepare(vector);
        let level = self.random_level();
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            id,
            vector,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.ids.insert(id, slot);

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            self.max_level = level;
            return Ok(());
        };
        let query = self.slots[slot as usize].vector.clone();
        let mut entry_points = vec![Scored {
            dist: self.dist(&query, entry),
            slot: entry,
        }];
        for layer in (level + 1..=self.max_level).rev() {
            entry_points = self.search_layer(&query, &entry_points, 1, layer);
        }
        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates =
                self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let neighbours: Vec<u32> = candidates
                .iter()
                .filter(|c| c.slot != slot)
                .take(self.params.m)
                .map(|c| c.slot)
                .collect();
            self.slots[slot as usize].links[layer] = neighbours.clone();
            for neighbour in neighbours {
                self.link(neighbour, slot, layer);
            }
            entry_points = candidates;
        }
        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(slot);
        }
        self.maybe_rebuild();
        Ok(())
    }

    fn link(&mut self, from: u32, to: u32, layer: usize) {
        let cap = self.max_links(layer);
        let links = &mut self.slots[from as usize].links[layer];
        if links.contains(&to) {
            return;
        }
        links.push(to);
        if links.len() <= cap {
            return;
        }
        let base = self.slots[from as usize].vector.clone();
        let mut scored: Vec<Scored> = self.slots[from as usize].links[layer]
            .iter()
            .map(|&s| Scored {
                dist: self.dist(&base, s),
                slot: s,
            })
            .collect();
        scored.sort_unstable();
        scored.truncate(cap);
        self.slots[from as usize].links[layer] = scored.into_iter().map(|s| s.slot).collect();
    }

    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[Scored],
        ef: usize,
        layer: usize,
    ) -> Vec<Scored> {
        let mut visited = vec![false; self.slots.len()];
        let mut frontier: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut best: BinaryHeap<Scored> = BinaryHeap::new();
        for ep in entry_points {
            if !visited[ep.slot as usize] {
                visited[ep.slot as usize] = true;
                frontier.push(Reverse(*ep));
                best.push(*ep);
            }
        }
        while best.len() > ef {
            best.pop();
        }
        while let Some(Reverse(current)) = frontier.pop() {
            if let Some(worst) = best.peek() {
                if current.dist > worst.dist && best.len() >= ef {
                    break;
                }
            }
            let Some(links) = self.slots[current.slot as usize].links.get(layer) else {
                continue;
            };
            for &next in links {
                if visited[next as usize] {
                    continue;
                }
                visited[next as usize] = true;
                let candidate = Scored {
                    dist: self.dist(query, next),
                    slot: next,
                };
                let admit = best.len() < ef || best.peek().is_some_and(|w| candidate < *w);
                if admit {
                    frontier.push(Reverse(candidate));
                    best.push(candidate);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        best.into_sorted_vec()
    }

    /// Returns up to `k` nearest live vectors as `(id, score)`, best first.
    /// Equal scores are ordered by ascending id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        self.check_dims(query)?;
        let Some(entry) = self.entry else {
            return Ok(Vec::new());
        };
        let k = k.min(self.slots.len());
        if k == 0 {
            return Ok(Vec::new());
        }
        let query = self.prepare(query);
        let mut entry_points = vec![Scored {
            dist: self.dist(&query, entry),
            slot: entry,
        }];
        for layer in (1..=self.max_level).rev() {
            entry_points = self.search_layer(&query, &entry_points, 1, layer);
        }
        let ef = self.params.ef_search.max(k) + self.tombstones.min(k.saturating_mul(4));
        let found = self.search_layer(&query, &entry_points, ef, 0);
        let mut hits: Vec<(NodeId, f32)> = found
            .into_iter()
            .filter(|c| !self.slots[c.slot as usize].deleted)
            .map(|c| {
                (
                    self.slots[c.slot as usize].id,
                    self.params.metric.score(c.dist),
                )
            })
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    /// Exact scan over live vectors; the baseline for recall checks.
    pub fn brute_force(&self, query: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        self.check_dims(query)?;
        let query = self.prepare(query);
        let mut hits: Vec<(NodeId, f32)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.deleted)
            .map(|(i, s)| (s.id, self.params.metric.score(self.dist(&query, i as u32))))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    /// Drops every vector and resets the level generator.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.ids.clear();
        self.entry = None;
        self.max_level = 0;
        self.tombstones = 0;
        self.rng = ChaCha8Rng::seed_from_u64(self.params.seed);
    }

    /// Removes the vector of `id`. Returns whether it was present.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let removed = self.tombstone(id);
        if removed {
            self.maybe_rebuild();
        }
        removed
    }

    fn tombstone(&mut self, id: NodeId) -> bool {
        let Some(slot) = self.ids.remove(&id) else {
            return false;
        };
        self.slots[slot as usize].deleted = true;
        self.tombstones += 1;
        true
    }

    fn maybe_rebuild(&mut self) {
        if self.tombstones * 4 > self.slots.len() && self.slots.len() >= 8 {
            self.rebuild();
        }
    }

    /// Rebuilds the graph from live vectors in id order with the original seed.
    pub fn rebuild(&mut self) {
        let mut live: Vec<(NodeId, Vec<f32>)> = self
            .slots
            .drain(..)
            .filter(|s| !s.deleted)
            .map(|s| (s.id, s.vector))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        let dropped = self.tombstones;
        self.ids.clear();
        self.entry = None;
        self.max_level = 0;
        self.tombstones = 0;
        self.rng = ChaCha8Rng::seed_from_u64(self.params.seed);
        for (id, vector) in live {
            // Stored vectors are already normalised; re-normalising is idempotent.
            if let Err(err) = self.insert(id, &vector) {
                debug!(%err, id = id.0, "hnsw.rebuild.skip");
            }
        }
        debug!(live = self.ids.len(), dropped, "hnsw.rebuild");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::kernel::ScalarKernel;

    fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    fn params(dimensions: usize) -> HnswParams {
        HnswParams {
            dimensions,
            ..HnswParams::default()
        }
    }

    #[test]
    fn recall_at_ten_matches_brute_force() {
        let data = random_vectors(1_000, 24, 7);
        let mut index = HnswIndex::new(params(24), Arc::new(ScalarKernel));
        for (i, v) in data.iter().enumerate() {
            index.insert(NodeId(i as u64), v).unwrap();
        }
        let queries = random_vectors(50, 24, 99);
        let mut hit = 0usize;
        for q in &queries {
            let exact: Vec<NodeId> = index.brute_force(q, 10).unwrap().into_iter().map(|h| h.0).collect();
            let approx = index.search(q, 10).unwrap();
            hit += approx.iter().filter(|(id, _)| exact.contains(id)).count();
        }
        let recall = hit as f64 / (queries.len() * 10) as f64;
        assert!(recall >= 0.95, "recall {recall}");
    }

    #[test]
    fn oversized_k_returns_every_live_vector() {
        let data = random_vectors(30, 8, 5);
        let mut index = HnswIndex::new(params(8), Arc::new(ScalarKernel));
        for (i, v) in data.iter().enumerate() {
            index.insert(NodeId(i as u64), v).unwrap();
        }
        for i in 0..5 {
            assert!(index.remove(NodeId(i)));
        }
        let hits = index.search(&data[7], usize::MAX).unwrap();
        assert_eq!(hits.len(), index.len());
        assert_eq!(hits[0].0, NodeId(7));
    }

    #[test]
    fn removed_ids_are_never_returned() {
        let data = random_vectors(64, 8, 3);
        let mut index = HnswIndex::new(params(8), Arc::new(ScalarKernel));
        for (i, v) in data.iter().enumerate() {
            index.insert(NodeId(i as u64), v).unwrap();
        }
        for i in 0..10 {
            assert!(index.remove(NodeId(i)));
        }
        let hits = index.search(&data[0], 64).unwrap();
        assert!(hits.iter().all(|(id, _)| id.0 >= 10));
        assert_eq!(index.len(), 54);
    }

    #[test]
    fn heavy_deletion_triggers_rebuild() {
        let data = random_vectors(40, 4, 11);
        let mut index = HnswIndex::new(params(4), Arc::new(ScalarKernel));
        for (i, v) in data.iter().enumerate() {
            index.insert(NodeId(i as u64), v).unwrap();
        }
        for i in 0..15 {
            index.remove(NodeId(i));
        }
        assert!(index.tombstones() * 4 <= index.len() + index.tombstones());
        assert_eq!(index.len(), 25);
    }

    #[test]
    fn same_seed_same_results() {
        let data = random_vectors(200, 8, 5);
        let build = || {
            let mut index = HnswIndex::new(params(8), Arc::new(ScalarKernel));
            for (i, v) in data.iter().enumerate() {
                index.insert(NodeId(i as u64), v).unwrap();
            }
            index.search(&data[17], 5).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = HnswIndex::new(params(3), Arc::new(ScalarKernel));
        let err = index.insert(NodeId(1), &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOwned(_)));
    }
}
