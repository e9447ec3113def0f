//! BM25 inverted index over configured text properties.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::storage::PropertyMap;
use crate::types::{NodeId, PropValue};

/// Lowercases and splits on non-alphanumeric boundaries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Number of tokens in a search query, prefix markers ignored.
pub fn query_token_count(query: &str) -> usize {
    tokenize(query).len()
}

struct DocEntry {
    len: u32,
    terms: Vec<String>,
}

/// Okapi BM25 index with `term*` prefix expansion.
pub struct FullTextIndex {
    properties: Vec<String>,
    k1: f32,
    b: f32,
    postings: BTreeMap<String, FxHashMap<NodeId, u32>>,
    docs: FxHashMap<NodeId, DocEntry>,
    total_len: u64,
}

impl FullTextIndex {
    /// Creates an index over `properties` with BM25 parameters `k1` and `b`.
    pub fn new(properties: Vec<String>, k1: f32, b: f32) -> Self {
        Self {
            properties,
            k1,
            b,
            postings: BTreeMap::new(),
            docs: FxHashMap::default(),
            total_len: 0,
        }
    }

    /// Indexed properties.
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Distinct terms in the dictionary.
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Whether `id` is indexed.
    pub fn contains(&self, id: NodeId) -> bool {
        self.docs.contains_key(&id)
    }

    fn extract(&self, props: &PropertyMap) -> Vec<String> {
        let mut tokens = Vec::new();
        for key in &self.properties {
            match props.get(key) {
                Some(PropValue::String(text)) => tokens.extend(tokenize(text)),
                Some(PropValue::List(items)) => {
                    for item in items {
                        if let PropValue::String(text) = item {
                            tokens.extend(tokenize(text));
                        }
                    }
                }
                _ => {}
            }
        }
        tokens
    }

    /// Indexes (or re-indexes) a node's text. Nodes without text are dropped.
    pub fn upsert(&mut self, id: NodeId, props: &PropertyMap) {
        self.remove(id);
        let tokens = self.extract(props);
        if tokens.is_empty() {
            return;
        }
        let mut freqs: BTreeMap<String, u32> = BTreeMap::new();
        for token in &tokens {
            *freqs.entry(token.clone()).or_insert(0) += 1;
        }
        for (term, tf) in &freqs {
            self.postings.entry(term.clone()).or_default().insert(id, *tf);
        }
        self.total_len += tokens.len() as u64;
        self.docs.insert(
            id,
            DocEntry {
                len: tokens.len() as u32,
                terms: freqs.into_keys().collect(),
            },
        );
    }

    /// Drops every document.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.docs.clear();
        self.total_len = 0;
    }

    /// Drops a node from the index. Returns whether it was indexed.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(doc) = self.docs.remove(&id) else {
            return false;
        };
        self.total_len -= u64::from(doc.len);
        for term in doc.terms {
            if let Some(list) = self.postings.get_mut(&term) {
                list.remove(&id);
                if list.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    fn expand(&self, raw: &str) -> Vec<String> {
        if let Some(prefix) = raw.strip_suffix('*') {
            let prefix = prefix.to_lowercase();
            if prefix.is_empty() || !prefix.chars().all(char::is_alphanumeric) {
                return tokenize(&prefix);
            }
            return self
                .postings
                .range(prefix.clone()..)
                .take_while(|(term, _)| term.starts_with(&prefix))
                .map(|(term, _)| term.clone())
                .collect();
        }
        tokenize(raw)
    }

    /// Scores documents against `query`; returns up to `k` hits, best first,
    /// ties broken by ascending id.
    pub fn search(&self, query: &str, k: usize) -> Vec<(NodeId, f32)> {
        if self.docs.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut terms: Vec<String> = query
            .split_whitespace()
            .flat_map(|raw| self.expand(raw))
            .collect();
        terms.sort();
        terms.dedup();
        let n = self.docs.len() as f32;
        let avg_len = self.total_len as f32 / n;
        let mut scores: FxHashMap<NodeId, f32> = FxHashMap::default();
        for term in &terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (id, tf) in list {
                let doc_len = self.docs.get(id).map_or(0.0, |d| d.len as f32);
                let tf = *tf as f32;
                let norm = self.k1 * (1.0 - self.b + self.b * doc_len / avg_len);
                *scores.entry(*id).or_insert(0.0) += idf * tf * (self.k1 + 1.0) / (tf + norm);
            }
        }
        let mut hits: Vec<(NodeId, f32)> = scores.into_iter().collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("content".into(), PropValue::from(text));
        props
    }

    fn index() -> FullTextIndex {
        let mut idx = FullTextIndex::new(vec!["content".into()], 1.2, 0.75);
        idx.upsert(NodeId(1), &doc("Alice likes graph databases"));
        idx.upsert(NodeId(2), &doc("Bob prefers relational databases"));
        idx.upsert(NodeId(3), &doc("Graph, graph everywhere: graph theory!"));
        idx
    }

    #[test]
    fn tokenizer_lowercases_and_splits() {
        assert_eq!(tokenize("Hello, World-42!"), vec!["hello", "world", "42"]);
    }

    #[test]
    fn bm25_ranks_frequent_terms_higher() {
        let hits = index().search("graph", 10);
        assert_eq!(hits[0].0, NodeId(3));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn prefix_expansion_matches_all_forms() {
        let hits = index().search("graph*", 10);
        let ids: Vec<u64> = hits.iter().map(|h| h.0 .0).collect();
        assert!(ids.contains(&1) && ids.contains(&3));
        assert!(!ids.contains(&2));
    }

    #[test]
    fn removal_clears_postings() {
        let mut idx = index();
        assert!(idx.remove(NodeId(2)));
        assert!(idx.search("relational", 10).is_empty());
        assert!(!idx.remove(NodeId(2)));
    }
}
