//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use recollect::{FusionParams, ScopeTrust, DEFAULT_CATEGORIES, DEFAULT_DUPLICATE_THRESHOLD};
use serde::{Deserialize, Serialize};

use crate::MemoryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// RRF rank constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,

    /// Candidates pulled from each backend before fusion.
    #[serde(default = "default_candidate_window")]
    pub candidate_window: usize,

    /// Semantic hits below this cosine similarity are discarded.
    #[serde(default = "default_min_semantic_score")]
    pub min_semantic_score: f32,

    #[serde(default = "default_backend_timeout")]
    pub lexical_timeout_ms: u64,

    /// Covers embedding the query plus the vector search.
    #[serde(default = "default_backend_timeout")]
    pub semantic_timeout_ms: u64,

    /// Similarity at which a new fact is a near-duplicate of a stored one.
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,

    #[serde(default)]
    pub classify: ClassifyConfig,

    #[serde(default)]
    pub wal: WalConfig,

    /// Initial category registry.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    #[serde(default)]
    pub scope_trust: ScopeTrust,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_classify_timeout")]
    pub timeout_ms: u64,

    /// Neighbours shown to the decision provider.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Vector neighbours below this similarity are not candidates.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_rrf_k() -> u32 {
    recollect::DEFAULT_RRF_K
}

fn default_candidate_window() -> usize {
    50
}

fn default_min_semantic_score() -> f32 {
    0.3
}

fn default_backend_timeout() -> u64 {
    2000
}

fn default_duplicate_threshold() -> f32 {
    DEFAULT_DUPLICATE_THRESHOLD
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_classify_timeout() -> u64 {
    5000
}

fn default_max_candidates() -> usize {
    5
}

fn default_min_similarity() -> f32 {
    0.6
}

fn default_max_consecutive_failures() -> u32 {
    recollect::DEFAULT_MAX_CONSECUTIVE_FAILURES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_window: default_candidate_window(),
            min_semantic_score: default_min_semantic_score(),
            lexical_timeout_ms: default_backend_timeout(),
            semantic_timeout_ms: default_backend_timeout(),
            duplicate_threshold: default_duplicate_threshold(),
            classify: ClassifyConfig::default(),
            wal: WalConfig::default(),
            categories: default_categories(),
            scope_trust: ScopeTrust::default(),
        }
    }
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_classify_timeout(),
            max_candidates: default_max_candidates(),
            min_similarity: default_min_similarity(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MemoryError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        self.fusion_params(1)
            .validate()
            .map_err(|e| MemoryError::Config(e.to_string()))?;
        if self.candidate_window == 0 {
            return Err(MemoryError::Config("`candidate_window` must be >= 1".into()));
        }
        check_unit("min_semantic_score", self.min_semantic_score, -1.0)?;
        check_unit("duplicate_threshold", self.duplicate_threshold, 0.0)?;
        check_unit("classify.min_similarity", self.classify.min_similarity, -1.0)?;
        if self.lexical_timeout_ms == 0 || self.semantic_timeout_ms == 0 {
            return Err(MemoryError::Config("backend timeouts must be > 0 ms".into()));
        }
        if self.classify.timeout_ms == 0 {
            return Err(MemoryError::Config("`classify.timeout_ms` must be > 0".into()));
        }
        if self.classify.max_candidates == 0 {
            return Err(MemoryError::Config(
                "`classify.max_candidates` must be >= 1".into(),
            ));
        }
        if self.wal.max_consecutive_failures == 0 {
            return Err(MemoryError::Config(
                "`wal.max_consecutive_failures` must be >= 1".into(),
            ));
        }
        if self.categories.iter().all(|c| c.trim().is_empty()) {
            return Err(MemoryError::Config(
                "at least one category is required".into(),
            ));
        }
        Ok(())
    }

    pub fn fusion_params(&self, limit: usize) -> FusionParams {
        FusionParams {
            k: self.rrf_k,
            limit,
        }
    }

    pub fn lexical_timeout(&self) -> Duration {
        Duration::from_millis(self.lexical_timeout_ms)
    }

    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_millis(self.semantic_timeout_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify.timeout_ms)
    }
}

/// A similarity bound must be finite and within `[min, 1]`.
fn check_unit(name: &str, value: f32, min: f32) -> Result<(), MemoryError> {
    if !value.is_finite() || value < min || value > 1.0 {
        return Err(MemoryError::Config(format!(
            "`{name}` must be within [{min}, 1], got {value}"
        )));
    }
    Ok(())
}
