//! Pre-write classification with a time-bounded decision provider.

use std::sync::Arc;

use recollect::classify::{exact_duplicate, resolve};
use recollect::{Action, Candidate, Classification, Fact};

use crate::config::EngineConfig;
use crate::provider::DecisionProvider;

/// Decides ADD / UPDATE / DELETE / NOOP for an incoming fact.
///
/// Never fails: a provider error or timeout yields ADD with the failure as
/// the reason.
pub struct WriteClassifier {
    provider: Option<Arc<dyn DecisionProvider>>,
    enabled: bool,
    timeout: std::time::Duration,
    max_candidates: usize,
}

impl WriteClassifier {
    pub fn new(provider: Option<Arc<dyn DecisionProvider>>, config: &EngineConfig) -> Self {
        Self {
            provider,
            enabled: config.classify.enabled,
            timeout: config.classify_timeout(),
            max_candidates: config.classify.max_candidates,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.provider.is_some()
    }

    pub async fn classify(&self, candidate: &Candidate, neighbors: &[Fact]) -> Classification {
        if neighbors.is_empty() {
            return Classification::add("no related facts");
        }
        if let Some(same) = exact_duplicate(candidate, neighbors) {
            return Classification {
                action: Action::Noop,
                reason: format!("identical to fact {}", same.id),
            };
        }

        let provider = match (&self.provider, self.enabled) {
            (Some(provider), true) => provider,
            _ => return Classification::add("classification disabled"),
        };
        let neighbors = &neighbors[..neighbors.len().min(self.max_candidates)];

        match tokio::time::timeout(self.timeout, provider.decide(candidate, neighbors)).await {
            Ok(Ok(decision)) => {
                let classification = resolve(decision, neighbors);
                tracing::debug!(
                    action = classification.action.as_str(),
                    reason = %classification.reason,
                    neighbors = neighbors.len(),
                    "write classified"
                );
                classification
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "decision provider failed; defaulting to add");
                Classification::add(format!("decision provider failed: {e}"))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "decision provider timed out; defaulting to add"
                );
                Classification::add(format!(
                    "decision provider timed out after {} ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}
