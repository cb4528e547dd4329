//! External collaborators: embedding and write-decision providers.
//!
//! Provider failures are opaque to the engine (network, model, parsing), so
//! both traits return [`anyhow::Result`]. The engine never lets a provider
//! error abort a recall or drop a write.

use async_trait::async_trait;
use recollect::{normalize_text, Candidate, Decision, DecisionAction, Fact};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Decide what storing `candidate` should do, given its nearest neighbours.
    async fn decide(&self, candidate: &Candidate, neighbors: &[Fact]) -> anyhow::Result<Decision>;
}

/// Dimension of [`HashEmbedder`] vectors.
pub const HASH_EMBEDDING_DIM: usize = 256;

/// Deterministic feature-hashed bag of words, L2-normalized.
///
/// No model, no network. Good enough for near-duplicate detection and
/// keyword-overlap similarity; swap in a real model for paraphrase recall.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn embed_sync(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dim];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let slot = (hash % self.dim as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            anyhow::bail!("text has no embeddable tokens");
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            anyhow::bail!("tokens cancelled out to a zero vector");
        }
        vector.iter_mut().for_each(|x| *x /= norm);
        Ok(vector)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HASH_EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_sync(text)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// Rule-based decisions over the structured decomposition.
///
/// - same normalized text as a neighbour: NOOP
/// - same entity and key as a neighbour but a different value: UPDATE it
/// - otherwise: ADD
#[derive(Debug, Clone, Default)]
pub struct RuleDecider;

#[async_trait]
impl DecisionProvider for RuleDecider {
    async fn decide(&self, candidate: &Candidate, neighbors: &[Fact]) -> anyhow::Result<Decision> {
        let text = normalize_text(&candidate.text);
        if let Some(same) = neighbors.iter().find(|f| f.normalized_text() == text) {
            return Ok(Decision {
                action: DecisionAction::Noop,
                target_id: Some(same.id.0.clone()),
                reason: format!("same text as {}", same.id),
            });
        }

        if let (Some(entity), Some(key)) = (&candidate.entity, &candidate.key) {
            let slot = neighbors.iter().find(|f| {
                f.entity.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(entity))
                    && f.key.as_deref().is_some_and(|k| k.eq_ignore_ascii_case(key))
            });
            if let Some(existing) = slot {
                let same_value = match (&existing.value, &candidate.value) {
                    (Some(a), Some(b)) => normalize_text(a) == normalize_text(b),
                    (None, None) => true,
                    _ => false,
                };
                let (action, reason) = if same_value {
                    (DecisionAction::Noop, format!("{entity}.{key} already recorded"))
                } else {
                    (DecisionAction::Update, format!("{entity}.{key} changed"))
                };
                return Ok(Decision {
                    action,
                    target_id: Some(existing.id.0.clone()),
                    reason,
                });
            }
        }

        Ok(Decision {
            action: DecisionAction::Add,
            target_id: None,
            reason: "no neighbour covers this fact".into(),
        })
    }
}
