use serde::Serialize;
use tracing::info;

use super::Database;
use crate::storage::PropertyFilter;
use crate::types::Result;

/// How serious a verification finding is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifySeverity {
    /// Recoverable or informational.
    Warning,
    /// The graph or an index is inconsistent.
    Error,
}

/// One verification issue.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// Severity.
    pub severity: VerifySeverity,
    /// What was found.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// What verification walked.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Visible nodes.
    pub nodes_found: u64,
    /// Visible edges.
    pub edges_found: u64,
    /// Nodes carrying an embedding.
    pub embeddings_found: u64,
    /// Live vectors in the vector index.
    pub vectors_indexed: u64,
}

/// Result of [`Database::verify`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// True when no error-level finding was recorded.
    pub success: bool,
    /// Issues discovered.
    pub findings: Vec<VerifyFinding>,
    /// Totals.
    pub counts: VerifyCounts,
}

impl Database {
    /// Checks the committed graph against itself and its indexes.
    ///
    /// Every edge must connect visible nodes, every embedding must have
    /// the configured dimension, and the vector index must hold exactly
    /// one vector per embedded node.
    pub fn verify(&self) -> Result<VerifyReport> {
        let dimensions = self.config().vector.dimensions;
        let mut report = self.read(|tx| {
            let mut report = VerifyReport::default();
            for node in tx.scan_nodes(None, PropertyFilter::any())? {
                let node = node?;
                report.counts.nodes_found += 1;
                if let Some(embedding) = &node.embedding {
                    report.counts.embeddings_found += 1;
                    if embedding.len() != dimensions {
                        report.findings.push(VerifyFinding::error(format!(
                            "node {} has a {}-dimensional embedding, expected {dimensions}",
                            node.id,
                            embedding.len()
                        )));
                    }
                }
            }
            for edge in tx.scan_edges(None, PropertyFilter::any())? {
                let edge = edge?;
                report.counts.edges_found += 1;
                for endpoint in [edge.src, edge.dst] {
                    if tx.node(endpoint)?.is_none() {
                        report.findings.push(VerifyFinding::error(format!(
                            "edge {} references missing node {endpoint}",
                            edge.id
                        )));
                    }
                }
            }
            Ok(report)
        })?;

        let stats = self.stats();
        report.counts.vectors_indexed = stats.index.vectors as u64;
        if report.counts.vectors_indexed != report.counts.embeddings_found {
            report.findings.push(VerifyFinding::error(format!(
                "vector index holds {} vectors for {} embedded nodes",
                report.counts.vectors_indexed, report.counts.embeddings_found
            )));
        }
        if stats.index.drift_events > 0 {
            report.findings.push(VerifyFinding::warning(format!(
                "{} index drift events since open",
                stats.index.drift_events
            )));
        }
        let recovery = self.recovery_report();
        if recovery.torn_tail {
            report.findings.push(VerifyFinding::warning(format!(
                "recovery truncated {} bytes of torn WAL tail",
                recovery.discarded_bytes
            )));
        }
        report.success = report
            .findings
            .iter()
            .all(|f| f.severity != VerifySeverity::Error);
        info!(
            success = report.success,
            nodes = report.counts.nodes_found,
            edges = report.counts.edges_found,
            findings = report.findings.len(),
            "db.verify"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{Config, Database};
    use crate::query::Params;

    #[test]
    fn consistent_graph_verifies() {
        let mut config = Config::default();
        config.vector.dimensions = 2;
        let db = Database::open_in_memory(config).unwrap();
        db.execute(
            "CREATE (a:Memory {text: 'a', embedding: [0.1, 0.2]})-[:RELATES_TO]->(b:Memory {text: 'b'})",
            Params::new(),
        )
        .unwrap();
        let report = db.verify().unwrap();
        assert!(report.success, "{:?}", report.findings);
        assert_eq!(report.counts.nodes_found, 2);
        assert_eq!(report.counts.edges_found, 1);
        assert_eq!(report.counts.embeddings_found, 1);
        assert_eq!(report.counts.vectors_indexed, 1);
    }
}
