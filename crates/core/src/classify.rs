//! Write classification: turning a raw decision into a safe action.
//!
//! A decision backend (an LLM, a rule set) looks at a candidate fact and its
//! nearest existing neighbours and answers ADD, UPDATE, DELETE or NOOP. Its
//! answer is untrusted. [`resolve`] checks it against the neighbour set and
//! downgrades anything unusable to ADD, since a duplicate can be cleaned up
//! later but a dropped fact is gone.

use serde::{Deserialize, Serialize};

use crate::fact::{normalize_text, Fact, FactId};

/// The action a store operation takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Store as a new fact.
    Add,
    /// Store a new fact that supersedes the target.
    Update(FactId),
    /// Retract the target with no replacement.
    Delete(FactId),
    /// Already known; write nothing.
    Noop,
}

impl Action {
    pub fn target(&self) -> Option<&FactId> {
        match self {
            Action::Update(id) | Action::Delete(id) => Some(id),
            Action::Add | Action::Noop => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update(_) => "update",
            Action::Delete(_) => "delete",
            Action::Noop => "noop",
        }
    }
}

/// Action label as a decision backend emits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Add,
    Update,
    Delete,
    Noop,
}

/// Unvalidated answer from a decision backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}

/// The fact being written, as shown to a decision backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl Candidate {
    pub fn from_fact(fact: &Fact) -> Self {
        Self {
            text: fact.text.clone(),
            entity: fact.entity.clone(),
            key: fact.key.clone(),
            value: fact.value.clone(),
        }
    }
}

/// A validated action plus the reason it was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub action: Action,
    pub reason: String,
}

impl Classification {
    /// ADD with the given reason. Used whenever classification fails or is skipped.
    pub fn add(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Add,
            reason: reason.into(),
        }
    }
}

/// Validate `decision` against the neighbour set it was made over.
///
/// A target that is missing, or not one of `neighbors`, turns the decision
/// into ADD. References from outside the set are never followed.
pub fn resolve(decision: Decision, neighbors: &[Fact]) -> Classification {
    let reason = if decision.reason.trim().is_empty() {
        "decision gave no reason".to_string()
    } else {
        decision.reason.trim().to_string()
    };

    let target = match decision.target_id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            match neighbors.iter().find(|f| f.id.as_str() == raw) {
                Some(f) => Some(f.id.clone()),
                None => {
                    return Classification::add(format!(
                        "target {raw} is not among the candidates ({reason})"
                    ))
                }
            }
        }
        _ => None,
    };

    let action = match (decision.action, target) {
        (DecisionAction::Add, _) => Action::Add,
        (DecisionAction::Noop, _) => Action::Noop,
        (DecisionAction::Update, Some(id)) => Action::Update(id),
        (DecisionAction::Delete, Some(id)) => Action::Delete(id),
        (DecisionAction::Update | DecisionAction::Delete, None) => {
            return Classification::add(format!("decision named no target ({reason})"))
        }
    };

    Classification { action, reason }
}

/// The first neighbour whose normalized text equals the candidate's.
pub fn exact_duplicate<'a>(candidate: &Candidate, neighbors: &'a [Fact]) -> Option<&'a Fact> {
    let wanted = normalize_text(&candidate.text);
    neighbors.iter().find(|f| f.normalized_text() == wanted)
}
