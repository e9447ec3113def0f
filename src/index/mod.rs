//! Vector, full-text and hybrid retrieval over committed nodes.
//!
//! Indexes are maintained synchronously by the commit path. Both indexes are
//! write-locked together for each committed batch, and hybrid readers take
//! both read locks together, so a reader observes a batch entirely or not at
//! all. Results are raw ids; the transaction layer resolves them against its
//! snapshot.

mod fulltext;
mod fusion;
mod hnsw;
mod kernel;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

pub use fulltext::{query_token_count, tokenize, FullTextIndex};
pub use fusion::{adaptive_weights, reciprocal_rank_fusion, FusionWeights};
pub use hnsw::{HnswIndex, HnswParams};
pub use kernel::{detect_kernel, normalize, ChunkedKernel, Metric, ScalarKernel, VectorKernel};

use crate::db::config::{Config, FusionConfig};
use crate::storage::{Mutation, NodeRecord};
use crate::types::{EngineError, NodeId, Result};

/// Minimum per-list candidate pool fetched for a hybrid query.
const HYBRID_MIN_POOL: usize = 50;

/// Index sizes and health counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct IndexStats {
    /// Live vectors.
    pub vectors: usize,
    /// Tombstoned vector slots.
    pub vector_tombstones: usize,
    /// Indexed text documents.
    pub documents: usize,
    /// Distinct terms.
    pub terms: usize,
    /// Index entries that pointed at missing nodes.
    pub drift_events: u64,
    /// Distance kernel in use.
    pub kernel: &'static str,
}

/// Vector and full-text indexes plus fusion settings.
pub struct IndexSubsystem {
    vector_name: String,
    fulltext_name: String,
    vector: RwLock<HnswIndex>,
    fulltext: RwLock<FullTextIndex>,
    fusion: FusionConfig,
    drift_events: AtomicU64,
}

impl IndexSubsystem {
    /// Builds empty indexes from configuration, picking the distance kernel.
    pub fn new(config: &Config) -> Self {
        Self::with_kernel(config, detect_kernel())
    }

    /// Builds empty indexes with an explicit kernel.
    pub fn with_kernel(config: &Config, kernel: Arc<dyn VectorKernel>) -> Self {
        let params = HnswParams {
            dimensions: config.vector.dimensions,
            m: config.vector.m,
            ef_construction: config.vector.ef_construction,
            ef_search: config.vector.ef_search,
            metric: config.vector.metric,
            ..HnswParams::default()
        };
        debug!(kernel = kernel.name(), dims = params.dimensions, "index.init");
        Self {
            vector_name: config.vector.name.clone(),
            fulltext_name: config.fulltext.name.clone(),
            vector: RwLock::new(HnswIndex::new(params, kernel)),
            fulltext: RwLock::new(FullTextIndex::new(
                config.fulltext.properties.clone(),
                config.fulltext.k1,
                config.fulltext.b,
            )),
            fusion: config.fusion.clone(),
            drift_events: AtomicU64::new(0),
        }
    }

    /// Embedding dimension accepted by the vector index.
    pub fn dimensions(&self) -> usize {
        self.vector.read().params().dimensions
    }

    /// Checks an embedding before it is buffered in a transaction.
    pub fn check_embedding(&self, embedding: &[f32]) -> Result<()> {
        let dims = self.dimensions();
        if embedding.len() != dims {
            return Err(EngineError::InvalidOwned(format!(
                "embedding has {} dimensions, index expects {dims}",
                embedding.len()
            )));
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(EngineError::Invalid("embedding must be finite"));
        }
        Ok(())
    }

    /// Applies a committed batch to both indexes under one pair of write
    /// locks: deletions first, then created and updated nodes.
    pub fn apply_batch(&self, mutations: &[Mutation]) {
        let touches = mutations.iter().any(|m| {
            matches!(
                m,
                Mutation::DeleteNode(_) | Mutation::CreateNode(_) | Mutation::UpdateNode(_)
            )
        });
        if !touches {
            return;
        }
        let mut vector = self.vector.write();
        let mut fulltext = self.fulltext.write();
        for mutation in mutations {
            if let Mutation::DeleteNode(id) = mutation {
                vector.remove(*id);
                fulltext.remove(*id);
            }
        }
        for mutation in mutations {
            if let Mutation::CreateNode(node) | Mutation::UpdateNode(node) = mutation {
                Self::index_node(&mut vector, &mut fulltext, node);
            }
        }
    }

    fn index_node(vector: &mut HnswIndex, fulltext: &mut FullTextIndex, node: &NodeRecord) {
        match &node.embedding {
            Some(embedding) if vector.holds(node.id, embedding) => {}
            Some(embedding) => {
                if let Err(err) = vector.insert(node.id, embedding) {
                    warn!(%err, node = node.id.0, "index.vector.skip");
                }
            }
            None => {
                vector.remove(node.id);
            }
        }
        fulltext.upsert(node.id, &node.props);
    }

    /// Replaces both indexes with entries for `nodes`.
    pub fn rebuild(&self, nodes: &[Arc<NodeRecord>]) {
        let mut vector = self.vector.write();
        let mut fulltext = self.fulltext.write();
        vector.clear();
        fulltext.clear();
        for node in nodes {
            Self::index_node(&mut vector, &mut fulltext, node);
        }
        debug!(
            vectors = vector.len(),
            documents = fulltext.len(),
            "index.rebuild"
        );
    }

    /// Fails unless `name` is the configured vector index.
    pub fn resolve_vector_index(&self, name: &str) -> Result<()> {
        if name == self.vector_name {
            Ok(())
        } else {
            Err(EngineError::InvalidOwned(format!(
                "there is no vector index named `{name}`"
            )))
        }
    }

    /// Fails unless `name` is the configured full-text index.
    pub fn resolve_fulltext_index(&self, name: &str) -> Result<()> {
        if name == self.fulltext_name {
            Ok(())
        } else {
            Err(EngineError::InvalidOwned(format!(
                "there is no full-text index named `{name}`"
            )))
        }
    }

    /// Nearest neighbours of `query`, best first.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        self.vector.read().search(query, k)
    }

    /// BM25 matches of `query`, best first.
    pub fn fulltext_search(&self, query: &str, k: usize) -> Vec<(NodeId, f32)> {
        self.fulltext.read().search(query, k)
    }

    /// Weights for a hybrid query on `query`.
    pub fn weights_for(&self, query: &str) -> FusionWeights {
        if self.fusion.adaptive {
            adaptive_weights(query_token_count(query))
        } else {
            FusionWeights {
                text: self.fusion.text_weight,
                vector: self.fusion.vector_weight,
            }
        }
    }

    /// Fused ranking of full-text and (when given) vector candidates. Returns
    /// the whole fused list so callers can filter before truncating to `k`.
    pub fn hybrid_search(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>> {
        let pool = k.saturating_mul(4).max(HYBRID_MIN_POOL);
        let vector = self.vector.read();
        let fulltext = self.fulltext.read();
        let text_ids: Vec<NodeId> = fulltext.search(query, pool).into_iter().map(|h| h.0).collect();
        let weights = self.weights_for(query);
        let fused = match embedding {
            Some(embedding) => {
                let vector_ids: Vec<NodeId> = vector
                    .search(embedding, pool)?
                    .into_iter()
                    .map(|h| h.0)
                    .collect();
                reciprocal_rank_fusion(
                    &[(&text_ids, weights.text), (&vector_ids, weights.vector)],
                    self.fusion.k,
                )
            }
            None => reciprocal_rank_fusion(&[(&text_ids, weights.text)], self.fusion.k),
        };
        Ok(fused)
    }

    /// Records an index entry that referenced a missing node and drops it.
    pub fn report_drift(&self, id: NodeId) {
        let total = self.drift_events.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(node = id.0, total, "index.drift");
        let mut vector = self.vector.write();
        let mut fulltext = self.fulltext.write();
        vector.remove(id);
        fulltext.remove(id);
    }

    /// Current sizes and counters.
    pub fn stats(&self) -> IndexStats {
        let vector = self.vector.read();
        let fulltext = self.fulltext.read();
        IndexStats {
            vectors: vector.len(),
            vector_tombstones: vector.tombstones(),
            documents: fulltext.len(),
            terms: fulltext.term_count(),
            drift_events: self.drift_events.load(Ordering::Relaxed),
            kernel: vector.kernel_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PropValue;

    fn config() -> Config {
        let mut config = Config::default();
        config.vector.dimensions = 2;
        config
    }

    fn node(id: u64, text: &str, embedding: [f32; 2]) -> Arc<NodeRecord> {
        let mut rec = NodeRecord::new(NodeId(id));
        rec.props.insert("content".into(), PropValue::from(text));
        rec.embedding = Some(embedding.to_vec());
        Arc::new(rec)
    }

    #[test]
    fn removal_then_upsert_keeps_indexes_in_step() {
        let indexes = IndexSubsystem::new(&config());
        let batch = vec![
            Mutation::CreateNode(node(1, "coffee in the morning", [1.0, 0.0])),
            Mutation::CreateNode(node(2, "tea at night", [0.0, 1.0])),
        ];
        indexes.apply_batch(&batch);
        assert_eq!(indexes.stats().vectors, 2);
        indexes.apply_batch(&[Mutation::DeleteNode(NodeId(1))]);
        assert!(indexes.fulltext_search("coffee", 5).is_empty());
        let hits = indexes.vector_search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![NodeId(2)]);
    }

    #[test]
    fn delete_and_recreate_in_one_batch_keeps_the_new_entry() {
        let indexes = IndexSubsystem::new(&config());
        indexes.apply_batch(&[Mutation::CreateNode(node(1, "old note", [1.0, 0.0]))]);
        indexes.apply_batch(&[
            Mutation::DeleteNode(NodeId(1)),
            Mutation::CreateNode(node(1, "new note", [0.0, 1.0])),
        ]);
        assert!(indexes.fulltext_search("old", 5).is_empty());
        assert_eq!(indexes.fulltext_search("new", 5)[0].0, NodeId(1));
        let hits = indexes.vector_search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].0, NodeId(1));
        assert_eq!(indexes.stats().vectors, 1);
    }

    #[test]
    fn property_only_update_keeps_the_vector_slot() {
        let indexes = IndexSubsystem::new(&config());
        indexes.apply_batch(&[Mutation::CreateNode(node(1, "draft", [3.0, 4.0]))]);
        indexes.apply_batch(&[Mutation::UpdateNode(node(1, "final", [3.0, 4.0]))]);
        let stats = indexes.stats();
        assert_eq!(stats.vectors, 1);
        assert_eq!(stats.vector_tombstones, 0);
        assert_eq!(indexes.fulltext_search("final", 5)[0].0, NodeId(1));

        indexes.apply_batch(&[Mutation::UpdateNode(node(1, "final", [4.0, 3.0]))]);
        assert_eq!(indexes.stats().vector_tombstones, 1);
    }

    #[test]
    fn hybrid_without_embedding_is_text_only() {
        let indexes = IndexSubsystem::new(&config());
        indexes.apply_batch(&[
            Mutation::CreateNode(node(1, "coffee beans", [1.0, 0.0])),
            Mutation::CreateNode(node(2, "green tea", [0.0, 1.0])),
        ]);
        let fused = indexes.hybrid_search("coffee", None, 5).unwrap();
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, NodeId(1));
    }

    #[test]
    fn unknown_index_names_are_rejected() {
        let indexes = IndexSubsystem::new(&config());
        assert!(indexes.resolve_vector_index("memory_vectors").is_ok());
        assert!(indexes.resolve_fulltext_index("nope").is_err());
    }
}
