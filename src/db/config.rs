//! Database configuration: defaults, TOML loading and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::Metric;
use crate::primitives::wal::WalSyncMode;
use crate::storage::DeleteMode;

/// When committed transactions are forced to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Never force a flush; the OS decides.
    None,
    /// Flush on an interval (`batch_interval_ms`).
    #[default]
    Batch,
    /// Flush before acknowledging each commit, coalescing concurrent commits.
    Immediate,
}

/// Vector index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Name used by `db.index.vector.queryNodes`.
    pub name: String,
    /// Embedding dimension; embeddings of any other size are rejected.
    pub dimensions: usize,
    /// HNSW fan-out.
    pub m: usize,
    /// Candidate list size while building.
    pub ef_construction: usize,
    /// Candidate list size while searching.
    pub ef_search: usize,
    /// Similarity metric.
    pub metric: Metric,
    /// Node property whose list value is stored as the embedding.
    pub property: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            name: "memory_vectors".into(),
            dimensions: 384,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            metric: Metric::Cosine,
            property: "embedding".into(),
        }
    }
}

/// Full-text index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FulltextConfig {
    /// Name used by `db.index.fulltext.queryNodes`.
    pub name: String,
    /// Text properties folded into each document.
    pub properties: Vec<String>,
    /// BM25 term-frequency saturation.
    pub k1: f32,
    /// BM25 length normalisation.
    pub b: f32,
}

impl Default for FulltextConfig {
    fn default() -> Self {
        Self {
            name: "memory_text".into(),
            properties: vec![
                "name".into(),
                "content".into(),
                "summary".into(),
                "fact".into(),
            ],
            k1: 1.2,
            b: 0.75,
        }
    }
}

/// Hybrid fusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// RRF rank offset.
    pub k: u32,
    /// Derive weights from the query length instead of the fixed weights.
    pub adaptive: bool,
    /// Fixed weight of the full-text list.
    pub text_weight: f32,
    /// Fixed weight of the vector list.
    pub vector_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: 60,
            adaptive: true,
            text_weight: 1.0,
            vector_weight: 1.0,
        }
    }
}

/// Query engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Upper bound for variable-length traversals.
    pub max_hops: u32,
    /// Per-query timeout; `0` disables it.
    pub timeout_ms: u64,
    /// Parsed statements kept in the LRU cache.
    pub plan_cache: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_hops: 10,
            timeout_ms: 30_000,
            plan_cache: 256,
        }
    }
}

/// Protocol server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bolt listener address.
    pub bolt_addr: String,
    /// HTTP listener address.
    pub http_addr: String,
    /// Open HTTP transactions idle longer than this are rolled back.
    pub tx_idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bolt_addr: "127.0.0.1:7687".into(),
            http_addr: "127.0.0.1:7474".into(),
            tx_idle_timeout_ms: 60_000,
        }
    }
}

/// Basic authentication credentials. Both unset means allow-all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected principal.
    pub username: Option<String>,
    /// Expected credentials.
    pub password: Option<String>,
}

/// Unique `(label, property)` pair enforced at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constrained label.
    pub label: String,
    /// Property that must be unique among nodes with `label`.
    pub property: String,
}

/// Engine configuration. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the WAL and checkpoint.
    pub data_dir: PathBuf,
    /// Durability policy.
    pub sync_mode: SyncMode,
    /// Flush interval in `batch` mode.
    pub batch_interval_ms: u64,
    /// Committed transactions between automatic checkpoints; `0` disables them.
    pub checkpoint_every: u64,
    /// What `DELETE` does to a node that still has relationships.
    pub delete_policy: DeleteMode,
    /// Internal retries of auto-commit work after a write conflict.
    pub conflict_retries: u32,
    /// Vector index.
    pub vector: VectorConfig,
    /// Full-text index.
    pub fulltext: FulltextConfig,
    /// Hybrid fusion.
    pub fusion: FusionConfig,
    /// Query engine.
    pub query: QueryConfig,
    /// Uniqueness constraints.
    pub unique_constraints: Vec<UniqueConstraint>,
    /// Protocol servers.
    pub server: ServerConfig,
    /// Authentication.
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("engramdb-data"),
            sync_mode: SyncMode::Batch,
            batch_interval_ms: 100,
            checkpoint_every: 1_000,
            delete_policy: DeleteMode::Restrict,
            conflict_retries: 3,
            vector: VectorConfig::default(),
            fulltext: FulltextConfig::default(),
            fusion: FusionConfig::default(),
            query: QueryConfig::default(),
            unique_constraints: Vec::new(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML file. A missing file at the default location yields defaults;
    /// a missing explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => read_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path)?,
                _ => Config::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.vector.dimensions == 0 {
            return Err(invalid("vector.dimensions", "must be positive"));
        }
        if self.vector.m < 2 {
            return Err(invalid("vector.m", "must be at least 2"));
        }
        if self.vector.ef_construction == 0 || self.vector.ef_search == 0 {
            return Err(invalid("vector.ef", "must be positive"));
        }
        if self.vector.name.is_empty() || self.fulltext.name.is_empty() {
            return Err(invalid("index name", "must not be empty"));
        }
        if self.vector.name == self.fulltext.name {
            return Err(invalid("index name", "vector and fulltext names must differ"));
        }
        if !(0.0..=1.0).contains(&self.fulltext.b) || self.fulltext.k1 < 0.0 {
            return Err(invalid("fulltext", "k1 must be >= 0 and b within [0, 1]"));
        }
        if self.fusion.k == 0 {
            return Err(invalid("fusion.k", "must be positive"));
        }
        if self.query.max_hops == 0 {
            return Err(invalid("query.max_hops", "must be positive"));
        }
        if matches!(self.sync_mode, SyncMode::Batch) && self.batch_interval_ms == 0 {
            return Err(invalid("batch_interval_ms", "must be positive in batch mode"));
        }
        if self.auth.username.is_some() != self.auth.password.is_some() {
            return Err(invalid("auth", "username and password must be set together"));
        }
        Ok(())
    }

    /// WAL flusher policy derived from `sync_mode`.
    pub fn wal_sync_mode(&self) -> WalSyncMode {
        match self.sync_mode {
            SyncMode::None => WalSyncMode::Off,
            SyncMode::Batch => WalSyncMode::Batch(Duration::from_millis(self.batch_interval_ms)),
            SyncMode::Immediate => WalSyncMode::Immediate,
        }
    }

    /// Query timeout, if enabled.
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query.timeout_ms > 0).then(|| Duration::from_millis(self.query.timeout_ms))
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Rendering TOML failed.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid config field {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Explanation.
        reason: String,
    },
}

/// `<config dir>/engramdb/engramdb.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("engramdb").join("engramdb.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            sync_mode = "immediate"
            delete_policy = "cascade"

            [vector]
            dimensions = 8
            metric = "euclidean"

            [[unique_constraints]]
            label = "Person"
            property = "email"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync_mode, SyncMode::Immediate);
        assert_eq!(config.delete_policy, DeleteMode::Cascade);
        assert_eq!(config.vector.dimensions, 8);
        assert_eq!(config.vector.m, 16);
        assert_eq!(config.vector.metric, Metric::Euclidean);
        assert_eq!(config.fusion.k, 60);
        assert_eq!(config.unique_constraints.len(), 1);
        assert_eq!(config.wal_sync_mode(), WalSyncMode::Immediate);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_toml("[vector]\ndimensions = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "vector.dimensions", .. }));
        let err = Config::from_toml("[auth]\nusername = \"neo4j\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "auth", .. }));
    }

    #[test]
    fn default_renders_and_reparses() {
        let text = Config::default().to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), Config::default());
    }
}
