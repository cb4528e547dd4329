//! Runtime-extensible category registry.
//!
//! Categories are an open taxonomy: the set is seeded at startup and callers
//! may register new labels while the process runs. Writes are validated
//! against the registry at the write boundary.

use std::collections::BTreeSet;
use std::sync::RwLock;

use crate::{RecollectError, Result};

/// Labels every registry starts with unless told otherwise.
pub const DEFAULT_CATEGORIES: [&str; 7] = [
    "preference",
    "fact",
    "decision",
    "entity",
    "pattern",
    "rule",
    "other",
];

#[derive(Debug)]
pub struct CategoryRegistry {
    known: RwLock<BTreeSet<String>>,
}

impl CategoryRegistry {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known = categories
            .into_iter()
            .map(|c| normalize(c.as_ref()))
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            known: RwLock::new(known),
        }
    }

    /// Add a label. Returns `false` if it was already known.
    pub fn register(&self, category: &str) -> Result<bool> {
        let category = normalize(category);
        if category.is_empty() {
            return Err(RecollectError::InvalidFact(
                "category must not be empty".into(),
            ));
        }
        Ok(self.write()?.insert(category))
    }

    /// Remove a label. Existing facts keep it; only new writes are affected.
    pub fn unregister(&self, category: &str) -> Result<bool> {
        Ok(self.write()?.remove(&normalize(category)))
    }

    pub fn contains(&self, category: &str) -> bool {
        self.known
            .read()
            .map(|set| set.contains(&normalize(category)))
            .unwrap_or(false)
    }

    /// Normalized label if known, [`RecollectError::UnknownCategory`] otherwise.
    pub fn validate(&self, category: &str) -> Result<String> {
        let normalized = normalize(category);
        if self.contains(&normalized) {
            Ok(normalized)
        } else {
            Err(RecollectError::UnknownCategory(category.to_string()))
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.known
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeSet<String>>> {
        self.known
            .write()
            .map_err(|_| RecollectError::Internal("category registry lock poisoned".into()))
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CATEGORIES)
    }
}

fn normalize(category: &str) -> String {
    category.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_knows_seed_categories() {
        let registry = CategoryRegistry::default();
        assert!(registry.contains("preference"));
        assert!(registry.contains(" Decision "));
        assert!(!registry.contains("recipe"));
    }

    #[test]
    fn categories_can_be_added_at_runtime() {
        let registry = CategoryRegistry::default();
        assert!(registry.validate("recipe").is_err());
        assert!(registry.register("Recipe").unwrap());
        assert!(!registry.register("recipe").unwrap());
        assert_eq!(registry.validate("RECIPE").unwrap(), "recipe");
    }

    #[test]
    fn unknown_category_error_names_the_label() {
        let registry = CategoryRegistry::new(["fact"]);
        let err = registry.validate("gossip").unwrap_err();
        assert!(matches!(err, RecollectError::UnknownCategory(ref c) if c == "gossip"));
    }

    #[test]
    fn unregister_removes_label() {
        let registry = CategoryRegistry::new(["fact", "rule"]);
        assert!(registry.unregister("rule").unwrap());
        assert_eq!(registry.list(), vec!["fact".to_string()]);
    }

    #[test]
    fn blank_category_cannot_be_registered() {
        let registry = CategoryRegistry::default();
        assert!(registry.register("  ").is_err());
    }
}
