//! The [`Fact`] record and its attribute types.
//!
//! A fact is one atomic statement the agent remembers. Besides its text it
//! carries an optional entity/key/value decomposition for exact lookups, a
//! decay class that sets its default lifetime, a retrieval tier, a visibility
//! [`Scope`] and the bi-temporal supersession fields.
//!
//! # Bi-temporal model
//!
//! - **Validity** (`valid_from` / `valid_until`): the window during which the
//!   fact is considered true. `valid_until` is derived from the decay class
//!   unless supplied explicitly.
//! - **Supersession** (`supersedes_id` / `superseded_by` / `superseded_at`):
//!   when a newer fact replaced this one. A superseded fact keeps its text so
//!   point-in-time reads still see it.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::scope::Scope;
use crate::{RecollectError, Result};

/// Upper bound on `text`, in bytes.
pub const MAX_TEXT_BYTES: usize = 32 * 1024;

/// A stable, time-sortable identifier for a [`Fact`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactId(pub String);

impl FactId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FactId {
    fn from(s: &str) -> Self {
        FactId(s.to_string())
    }
}

/// How long a fact stays valid when nothing supersedes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayClass {
    /// Never expires.
    Permanent,
    /// Long-lived knowledge (90 days).
    #[default]
    Stable,
    /// Ongoing work (14 days).
    Active,
    /// Relevant for the current session (24 hours).
    Session,
    /// Short-lived checkpoint (4 hours).
    Checkpoint,
}

impl DecayClass {
    /// Default time-to-live. `None` means the fact never expires.
    pub fn ttl(self) -> Option<Duration> {
        match self {
            DecayClass::Permanent => None,
            DecayClass::Stable => Some(Duration::days(90)),
            DecayClass::Active => Some(Duration::days(14)),
            DecayClass::Session => Some(Duration::hours(24)),
            DecayClass::Checkpoint => Some(Duration::hours(4)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecayClass::Permanent => "permanent",
            DecayClass::Stable => "stable",
            DecayClass::Active => "active",
            DecayClass::Session => "session",
            DecayClass::Checkpoint => "checkpoint",
        }
    }
}

impl std::str::FromStr for DecayClass {
    type Err = RecollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permanent" => Ok(DecayClass::Permanent),
            "stable" => Ok(DecayClass::Stable),
            "active" => Ok(DecayClass::Active),
            "session" => Ok(DecayClass::Session),
            "checkpoint" => Ok(DecayClass::Checkpoint),
            other => Err(RecollectError::InvalidFact(format!(
                "unknown decay class `{other}`"
            ))),
        }
    }
}

/// Retrieval-cost placement. Independent of whether the fact is still true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    #[default]
    Warm,
    Cold,
}

impl Tier {
    /// Placement for a new fact that was not given an explicit tier.
    ///
    /// Cold is never derived; only an explicit placement moves a fact there.
    pub fn derive(decay_class: DecayClass, importance: f32) -> Self {
        if importance >= 0.8 || matches!(decay_class, DecayClass::Session | DecayClass::Checkpoint)
        {
            Tier::Hot
        } else {
            Tier::Warm
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = RecollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(RecollectError::InvalidFact(format!("unknown tier `{other}`"))),
        }
    }
}

/// Caller-supplied attributes for a new fact. Everything but the text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactAttributes {
    pub category: String,
    pub importance: f32,
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub tags: BTreeSet<String>,
    pub decay_class: DecayClass,
    /// Explicit placement; derived from decay class and importance when `None`.
    pub tier: Option<Tier>,
    /// When the underlying event happened, if different from now.
    pub source_date: Option<DateTime<Utc>>,
    /// Explicit end of validity; derived from the decay class TTL when `None`.
    pub valid_until: Option<DateTime<Utc>>,
    /// Retry token: a second write with the same key returns the first fact.
    pub idempotency_key: Option<String>,
}

impl Default for FactAttributes {
    fn default() -> Self {
        Self {
            category: "other".to_string(),
            importance: 0.5,
            entity: None,
            key: None,
            value: None,
            tags: BTreeSet::new(),
            decay_class: DecayClass::default(),
            tier: None,
            source_date: None,
            valid_until: None,
            idempotency_key: None,
        }
    }
}

/// One atomic unit of stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Stable time-sortable ID. Never reused.
    pub id: FactId,
    pub text: String,
    /// Open category label, validated against the runtime registry on write.
    pub category: String,
    /// Salience \[0.0, 1.0\].
    pub importance: f32,
    /// Subject of the structured decomposition.
    pub entity: Option<String>,
    /// Attribute of the structured decomposition.
    pub key: Option<String>,
    /// Value of the structured decomposition.
    pub value: Option<String>,
    pub tags: BTreeSet<String>,
    pub decay_class: DecayClass,
    pub tier: Tier,
    /// Visibility boundary. The target is part of the variant, so a
    /// non-global fact without a target cannot be represented.
    pub scope: Scope,
    /// Start of the validity window.
    pub valid_from: DateTime<Utc>,
    /// End of the validity window. `None` = open-ended.
    pub valid_until: Option<DateTime<Utc>>,
    /// The fact this one replaced.
    pub supersedes_id: Option<FactId>,
    /// The fact that replaced this one.
    pub superseded_by: Option<FactId>,
    /// When this fact was superseded or retracted. `None` while current.
    pub superseded_at: Option<DateTime<Utc>>,
    /// When this fact was recorded.
    pub created_at: DateTime<Utc>,
    /// When the underlying event happened.
    pub source_date: Option<DateTime<Utc>>,
    pub recall_count: u32,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Fact {
    /// Build a validated fact recorded at `now`.
    pub fn new(
        text: impl Into<String>,
        attrs: FactAttributes,
        scope: Scope,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let FactAttributes {
            category,
            importance,
            entity,
            key,
            value,
            tags,
            decay_class,
            tier,
            source_date,
            valid_until,
            idempotency_key: _,
        } = attrs;

        let valid_until = valid_until.or_else(|| decay_class.ttl().map(|ttl| now + ttl));
        let fact = Self {
            id: FactId::new(),
            text: text.into(),
            category: category.trim().to_ascii_lowercase(),
            importance,
            entity: non_blank(entity),
            key: non_blank(key),
            value: non_blank(value),
            tags: tags
                .into_iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            decay_class,
            tier: tier.unwrap_or_else(|| Tier::derive(decay_class, importance)),
            scope,
            valid_from: now,
            valid_until,
            supersedes_id: None,
            superseded_by: None,
            superseded_at: None,
            created_at: now,
            source_date,
            recall_count: 0,
            last_accessed_at: None,
        };
        fact.validate()?;
        Ok(fact)
    }

    /// Check the invariants a fact must satisfy before it is written.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(RecollectError::InvalidFact("text must not be empty".into()));
        }
        if self.text.len() > MAX_TEXT_BYTES {
            return Err(RecollectError::InvalidFact(format!(
                "text exceeds {MAX_TEXT_BYTES} bytes"
            )));
        }
        if self.category.is_empty() {
            return Err(RecollectError::InvalidFact(
                "category must not be empty".into(),
            ));
        }
        if !self.importance.is_finite() || !(0.0..=1.0).contains(&self.importance) {
            return Err(RecollectError::InvalidFact(format!(
                "importance {} is outside [0, 1]",
                self.importance
            )));
        }
        if let Some(until) = self.valid_until {
            if until <= self.valid_from {
                return Err(RecollectError::InvalidFact(
                    "valid_until must be after valid_from".into(),
                ));
            }
        }
        self.scope.validate()
    }

    /// Not superseded, not retracted.
    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|t| t <= at)
    }

    /// Was this fact the valid version at `at`?
    ///
    /// Half-open on both ends of the window: a fact superseded at `t` is not
    /// returned for a read at `t`.
    pub fn was_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at
            && self.valid_until.is_none_or(|t| t > at)
            && self.superseded_at.is_none_or(|t| t > at)
    }

    /// Timestamp used for recency tie-breaks.
    pub fn recency(&self) -> DateTime<Utc> {
        self.source_date.unwrap_or(self.created_at)
    }

    /// Normalized text used for duplicate detection.
    pub fn normalized_text(&self) -> String {
        normalize_text(&self.text)
    }
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
