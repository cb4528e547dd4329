//! Recollect: an embedded fact store for agent memory.
//!
//! The core primitive is a [`Fact`]: one atomic statement with an optional
//! entity/key/value decomposition, a visibility [`Scope`] and bi-temporal
//! supersession metadata.
//!
//! **Validity** (`valid_from` / `valid_until`) captures when a fact was
//! considered true. **Supersession** (`supersedes_id` / `superseded_by` /
//! `superseded_at`) links each fact to the version it replaced. An update
//! never rewrites text in place: it writes a new fact and closes the old one,
//! so point-in-time reads keep working.
//!
//! Alongside the canonical [`FactStore`] the crate ships the pieces a hybrid
//! retrieval engine is assembled from: a derived [`VectorStore`], a
//! crash-detection [`Wal`], the pure [`fuse`] rank merger and the
//! [`classify`] helpers that validate write decisions.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use recollect::{Fact, FactAttributes, FactStore, Scope, SearchOptions};
//! use chrono::Utc;
//!
//! let db = FactStore::open("memory.redb").unwrap();
//!
//! let fact = Fact::new(
//!     "Alice prefers green tea",
//!     FactAttributes::default(),
//!     Scope::User("alice".into()),
//!     Utc::now(),
//! )
//! .unwrap();
//! db.insert(fact).unwrap();
//!
//! let hits = db.search("tea", 10, &SearchOptions::default()).unwrap();
//! ```

pub mod category;
pub mod classify;
pub mod fact;
pub mod fusion;
mod lexical;
pub mod scope;
pub mod vector;
pub mod wal;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};

pub use category::{CategoryRegistry, DEFAULT_CATEGORIES};
pub use classify::{Action, Candidate, Classification, Decision, DecisionAction};
pub use fact::{normalize_text, DecayClass, Fact, FactAttributes, FactId, Tier, MAX_TEXT_BYTES};
pub use fusion::{fuse, FusionParams, Origin, RankedFact, DEFAULT_RRF_K};
pub use scope::{
    resolve_caller, resolve_write_scope, scope_visible, visible, CallerScope, ResolvedCaller,
    Scope, ScopeKind, ScopeMismatch, ScopeTrust,
};
pub use vector::{
    VectorFilter, VectorHit, VectorIndex, VectorRecord, VectorStore, DEFAULT_DUPLICATE_THRESHOLD,
};
pub use wal::{Wal, WalEntry, WalOp, WalStats, WalToken, DEFAULT_MAX_CONSECUTIVE_FAILURES};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecollectError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0} scope requires a target")]
    ScopeTargetRequired(ScopeKind),
    #[error("global scope must not carry a target (got `{0}`)")]
    UnexpectedScopeTarget(String),
    #[error("{kind} scope target `{supplied}` disagrees with authenticated `{authenticated}`")]
    ScopeMismatch {
        kind: ScopeKind,
        supplied: String,
        authenticated: String,
    },
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    #[error("invalid fact: {0}")]
    InvalidFact(String),
    #[error("fact {0} is already superseded")]
    AlreadySuperseded(FactId),
    #[error("invalid supersession: {0}")]
    InvalidSupersession(String),
    #[error("fact {id} is still referenced by {by}")]
    StillReferenced { id: FactId, by: FactId },
}

impl From<redb::DatabaseError> for RecollectError {
    fn from(e: redb::DatabaseError) -> Self {
        RecollectError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for RecollectError {
    fn from(e: redb::TransactionError) -> Self {
        RecollectError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for RecollectError {
    fn from(e: redb::TableError) -> Self {
        RecollectError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for RecollectError {
    fn from(e: redb::StorageError) -> Self {
        RecollectError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for RecollectError {
    fn from(e: redb::CommitError) -> Self {
        RecollectError::Storage(e.to_string())
    }
}
impl From<tantivy::TantivyError> for RecollectError {
    fn from(e: tantivy::TantivyError) -> Self {
        RecollectError::Search(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecollectError>;

// ---------------------------------------------------------------------------
// Storage layout
// ---------------------------------------------------------------------------

/// Fact id -> JSON-serialized [`Fact`].
const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");

/// `entity \x1f key \x1f id` (lowercased entity and key) -> fact id.
///
/// Prefix ranges over this table answer `lookup(entity, key?)` without a scan.
const ENTITY_INDEX: TableDefinition<&str, &str> = TableDefinition::new("entity_index");

/// Idempotency key -> fact id.
const IDEMPOTENCY: TableDefinition<&str, &str> = TableDefinition::new("idempotency");

const KEY_SEP: char = '\u{1f}';

/// Upper bound on links followed when walking a supersession chain.
const MAX_CHAIN_WALK: usize = 4096;

// ---------------------------------------------------------------------------
// Query options
// ---------------------------------------------------------------------------

/// Options for single-fact reads.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Return the chain member that was valid at this instant.
    pub as_of: Option<DateTime<Utc>>,
    /// Hide facts this caller cannot see.
    pub scope: Option<CallerScope>,
}

/// Filters for multi-fact reads.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Point-in-time read. Overrides `include_superseded`.
    pub as_of: Option<DateTime<Utc>>,
    /// Include superseded, retracted and expired facts.
    pub include_superseded: bool,
    /// Include facts placed in the cold tier.
    pub include_cold: bool,
    /// Hide facts this caller cannot see. `None` disables the scope filter.
    pub scope: Option<CallerScope>,
}

impl SearchOptions {
    /// Does `fact` pass every filter, judged at `now`?
    pub fn admits(&self, fact: &Fact, now: DateTime<Utc>) -> bool {
        let temporal = match self.as_of {
            Some(at) => fact.was_valid_at(at),
            None => self.include_superseded || (fact.is_current() && !fact.is_expired_at(now)),
        };
        temporal
            && (self.include_cold || fact.tier != Tier::Cold)
            && self.scope.as_ref().is_none_or(|caller| visible(fact, caller))
    }
}

/// How a new fact is written.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Supersede this fact in the same transaction.
    pub supersedes: Option<FactId>,
    /// Supersession time. Defaults to the new fact's `valid_from`.
    pub at: Option<DateTime<Utc>>,
    /// Retry token. A second insert with the same key returns the first fact.
    pub idempotency_key: Option<String>,
}

/// Result of [`FactStore::insert_with`].
#[derive(Debug, Clone)]
pub struct Inserted {
    pub fact: Fact,
    /// `false` when an idempotency key matched an earlier write.
    pub created: bool,
}

/// A fact with a backend-native relevance score.
#[derive(Debug, Clone)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// FactStore
// ---------------------------------------------------------------------------

/// The canonical structured store.
///
/// Every mutation runs inside one redb write transaction. redb serialises
/// writers, so a supersede racing a delete on the same fact is ordered by
/// the store itself; no caller-side lock exists.
pub struct FactStore {
    db: Database,
}

impl FactStore {
    /// Open or create a fact store at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        Self::init(db)
    }

    /// Create an in-memory store. Data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(FACTS)?;
        write_txn.open_table(ENTITY_INDEX)?;
        write_txn.open_table(IDEMPOTENCY)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    // -- writes -------------------------------------------------------------

    /// Insert a new, unlinked fact.
    pub fn insert(&self, fact: Fact) -> Result<Fact> {
        Ok(self.insert_with(fact, &InsertOptions::default())?.fact)
    }

    /// Insert a new fact, optionally superseding another one and/or
    /// deduplicating on an idempotency key, all in one transaction.
    pub fn insert_with(&self, fact: Fact, opts: &InsertOptions) -> Result<Inserted> {
        fact.validate()?;
        if fact.supersedes_id.is_some() || fact.superseded_by.is_some() || !fact.is_current() {
            return Err(RecollectError::InvalidFact(
                "new facts must not carry supersession links".into(),
            ));
        }

        // Fast path: an idempotent retry only needs a read transaction.
        if let Some(key) = opts.idempotency_key.as_deref() {
            let read_txn = self.db.begin_read()?;
            let idem = read_txn.open_table(IDEMPOTENCY)?;
            let facts = read_txn.open_table(FACTS)?;
            if let Some(existing) = lookup_idempotent(&idem, &facts, key)? {
                return Ok(Inserted {
                    fact: existing,
                    created: false,
                });
            }
        }

        // Slow path. Re-check the key: another writer may have claimed it
        // between our read and this write.
        let write_txn = self.db.begin_write()?;
        if let Some(key) = opts.idempotency_key.as_deref() {
            let idem = write_txn.open_table(IDEMPOTENCY)?;
            let facts = write_txn.open_table(FACTS)?;
            if let Some(existing) = lookup_idempotent(&idem, &facts, key)? {
                return Ok(Inserted {
                    fact: existing,
                    created: false,
                });
            }
        }

        {
            let facts = write_txn.open_table(FACTS)?;
            if facts.get(fact.id.as_str())?.is_some() {
                return Err(RecollectError::InvalidFact(format!(
                    "fact id {} already exists",
                    fact.id
                )));
            }
        }

        let mut fact = fact;
        if let Some(old_id) = &opts.supersedes {
            let at = opts.at.unwrap_or(fact.valid_from);
            let old = Self::supersede_in_txn(&write_txn, old_id, Some(&mut fact), at)?;
            Self::put_fact_in_txn(&write_txn, &old)?;
        }
        Self::put_fact_in_txn(&write_txn, &fact)?;
        Self::index_fact_in_txn(&write_txn, &fact)?;

        if let Some(key) = opts.idempotency_key.as_deref() {
            let mut idem = write_txn.open_table(IDEMPOTENCY)?;
            idem.insert(key, fact.id.as_str())?;
        }

        write_txn.commit()?;
        Ok(Inserted {
            fact,
            created: true,
        })
    }

    /// Close `old_id` at `at`, optionally linking an already-stored successor.
    ///
    /// Both sides of the link are written in one transaction: either the old
    /// fact is closed and the successor points back at it, or nothing changes.
    /// With `new_id = None` the old fact is retracted with no replacement.
    pub fn supersede(
        &self,
        old_id: &FactId,
        new_id: Option<&FactId>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        let mut successor = match new_id {
            Some(id) => {
                let facts = write_txn.open_table(FACTS)?;
                Some(
                    load_fact(&facts, id.as_str())?
                        .ok_or_else(|| RecollectError::NotFound(format!("fact id {id}")))?,
                )
            }
            None => None,
        };

        let old = Self::supersede_in_txn(&write_txn, old_id, successor.as_mut(), at)?;
        Self::put_fact_in_txn(&write_txn, &old)?;
        if let Some(new) = &successor {
            Self::put_fact_in_txn(&write_txn, new)?;
        }
        write_txn.commit()?;

        tracing::debug!(
            old = %old_id,
            new = ?new_id.map(FactId::as_str),
            "fact superseded"
        );
        Ok(())
    }

    /// Validate and apply a supersession to in-memory copies. The caller
    /// persists both facts in the same transaction.
    fn supersede_in_txn(
        write_txn: &WriteTransaction,
        old_id: &FactId,
        successor: Option<&mut Fact>,
        at: DateTime<Utc>,
    ) -> Result<Fact> {
        let facts = write_txn.open_table(FACTS)?;
        let mut old = load_fact(&facts, old_id.as_str())?
            .ok_or_else(|| RecollectError::NotFound(format!("fact id {old_id}")))?;

        if !old.is_current() {
            return Err(RecollectError::AlreadySuperseded(old_id.clone()));
        }
        if at < old.valid_from {
            return Err(RecollectError::InvalidSupersession(format!(
                "supersession time {at} precedes valid_from {} of fact {old_id}",
                old.valid_from
            )));
        }
        // A successor starts at `at`; chains stay strictly ordered by valid_from.
        if successor.is_some() && at == old.valid_from {
            return Err(RecollectError::InvalidSupersession(format!(
                "successor would share valid_from {at} with fact {old_id}"
            )));
        }

        if let Some(new) = successor {
            if &new.id == old_id {
                return Err(RecollectError::InvalidSupersession(
                    "a fact cannot supersede itself".into(),
                ));
            }
            if !new.is_current() || new.supersedes_id.is_some() || new.superseded_by.is_some() {
                return Err(RecollectError::InvalidSupersession(format!(
                    "fact {} is already part of a chain",
                    new.id
                )));
            }
            if new.scope != old.scope {
                return Err(RecollectError::InvalidSupersession(format!(
                    "fact {} and {old_id} live in different scopes",
                    new.id
                )));
            }
            // Keep the successor's validity window length when moving its start.
            if let Some(until) = new.valid_until {
                new.valid_until = Some(at + (until - new.valid_from));
            }
            new.valid_from = at;
            new.supersedes_id = Some(old_id.clone());
            old.superseded_by = Some(new.id.clone());
        }

        old.superseded_at = Some(at);
        Ok(old)
    }

    /// Hard-delete a fact. Returns whether it existed.
    ///
    /// Rejected with [`RecollectError::StillReferenced`] while a newer fact
    /// supersedes it. Deleting a chain head clears its predecessor's forward
    /// pointer; the predecessor stays closed.
    pub fn delete(&self, id: &FactId) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let fact = {
            let facts = write_txn.open_table(FACTS)?;
            match load_fact(&facts, id.as_str())? {
                Some(f) => f,
                None => return Ok(false),
            }
        };

        if let Some(by) = &fact.superseded_by {
            let facts = write_txn.open_table(FACTS)?;
            if facts.get(by.as_str())?.is_some() {
                return Err(RecollectError::StillReferenced {
                    id: id.clone(),
                    by: by.clone(),
                });
            }
        }

        if let Some(prev_id) = &fact.supersedes_id {
            let prev = {
                let facts = write_txn.open_table(FACTS)?;
                load_fact(&facts, prev_id.as_str())?
            };
            if let Some(mut prev) = prev {
                prev.superseded_by = None;
                Self::put_fact_in_txn(&write_txn, &prev)?;
            }
        }

        {
            let mut facts = write_txn.open_table(FACTS)?;
            facts.remove(id.as_str())?;
        }
        if let Some(key) = entity_index_key(&fact) {
            let mut index = write_txn.open_table(ENTITY_INDEX)?;
            index.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Bump `recall_count` and set `last_accessed_at` for each id that exists.
    pub fn record_access(&self, ids: &[FactId], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut facts = write_txn.open_table(FACTS)?;
            for id in ids {
                let Some(mut fact) = load_fact(&facts, id.as_str())? else {
                    continue;
                };
                fact.recall_count = fact.recall_count.saturating_add(1);
                fact.last_accessed_at = Some(at);
                let value = serde_json::to_string(&fact)?;
                facts.insert(id.as_str(), value.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn put_fact_in_txn(write_txn: &WriteTransaction, fact: &Fact) -> Result<()> {
        let value = serde_json::to_string(fact)?;
        let mut facts = write_txn.open_table(FACTS)?;
        facts.insert(fact.id.as_str(), value.as_str())?;
        Ok(())
    }

    fn index_fact_in_txn(write_txn: &WriteTransaction, fact: &Fact) -> Result<()> {
        if let Some(key) = entity_index_key(fact) {
            let mut index = write_txn.open_table(ENTITY_INDEX)?;
            index.insert(key.as_str(), fact.id.as_str())?;
        }
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    /// Fetch a fact by id.
    ///
    /// With `as_of`, the supersession chain is walked to the member whose
    /// validity window contains that instant; a fact superseded at or before
    /// `as_of` is never returned.
    pub fn get(&self, id: &FactId, opts: &ReadOptions) -> Result<Option<Fact>> {
        let read_txn = self.db.begin_read()?;
        let facts = read_txn.open_table(FACTS)?;
        let Some(mut fact) = load_fact(&facts, id.as_str())? else {
            return Ok(None);
        };

        if let Some(at) = opts.as_of {
            let mut steps = 0;
            while !fact.was_valid_at(at) {
                let next = if at < fact.valid_from {
                    fact.supersedes_id.clone()
                } else if fact.superseded_at.is_some_and(|t| t <= at) {
                    fact.superseded_by.clone()
                } else {
                    None
                };
                let Some(next) = next else {
                    return Ok(None);
                };
                steps += 1;
                if steps > MAX_CHAIN_WALK {
                    return Err(RecollectError::Internal(format!(
                        "supersession chain from {id} exceeds {MAX_CHAIN_WALK} links"
                    )));
                }
                fact = match load_fact(&facts, next.as_str())? {
                    Some(f) => f,
                    None => return Ok(None),
                };
            }
        }

        if let Some(caller) = &opts.scope {
            if !visible(&fact, caller) {
                return Ok(None);
            }
        }
        Ok(Some(fact))
    }

    /// Fetch several facts in one read transaction. Missing ids are skipped.
    pub fn get_many(&self, ids: &[FactId]) -> Result<HashMap<FactId, Fact>> {
        let read_txn = self.db.begin_read()?;
        let facts = read_txn.open_table(FACTS)?;
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(fact) = load_fact(&facts, id.as_str())? {
                found.insert(id.clone(), fact);
            }
        }
        Ok(found)
    }

    /// Lexical search over every fact `opts` admits, best match first.
    pub fn search(&self, query: &str, limit: usize, opts: &SearchOptions) -> Result<Vec<ScoredFact>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let candidates = self.scan(|f| opts.admits(f, now))?;
        let ranked = lexical::rank(&candidates, query, limit)?;

        let mut by_id: HashMap<FactId, Fact> =
            candidates.into_iter().map(|f| (f.id.clone(), f)).collect();
        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| {
                by_id.remove(&id).map(|fact| ScoredFact {
                    fact,
                    score: f64::from(score),
                })
            })
            .collect())
    }

    /// Exact structured lookup by entity, optionally narrowed by key and tag.
    ///
    /// Matching is case-insensitive. Results carry a score of `1.0` and are
    /// ordered newest first.
    pub fn lookup(
        &self,
        entity: &str,
        key: Option<&str>,
        tag: Option<&str>,
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredFact>> {
        let entity = entity.trim().to_lowercase();
        if entity.is_empty() {
            return Ok(Vec::new());
        }
        let prefix = match key.map(|k| k.trim().to_lowercase()) {
            Some(k) if !k.is_empty() => format!("{entity}{KEY_SEP}{k}{KEY_SEP}"),
            _ => format!("{entity}{KEY_SEP}"),
        };
        let tag = tag.map(|t| t.trim().to_ascii_lowercase());
        let now = Utc::now();

        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(ENTITY_INDEX)?;
        let facts = read_txn.open_table(FACTS)?;

        let mut hits = Vec::new();
        for entry in index.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let Some(fact) = load_fact(&facts, v.value())? else {
                continue;
            };
            if tag.as_ref().is_some_and(|t| !fact.tags.contains(t)) {
                continue;
            }
            if opts.admits(&fact, now) {
                hits.push(ScoredFact { fact, score: 1.0 });
            }
        }

        hits.sort_by(|a, b| {
            b.fact
                .recency()
                .cmp(&a.fact.recency())
                .then_with(|| a.fact.id.cmp(&b.fact.id))
        });
        Ok(hits)
    }

    /// Every fact in the chain containing `id`, oldest first.
    pub fn history(&self, id: &FactId) -> Result<Vec<Fact>> {
        let read_txn = self.db.begin_read()?;
        let facts = read_txn.open_table(FACTS)?;
        let start = load_fact(&facts, id.as_str())?
            .ok_or_else(|| RecollectError::NotFound(format!("fact id {id}")))?;

        let mut chain = vec![start.clone()];
        let mut cursor = start.supersedes_id.clone();
        while let Some(prev_id) = cursor {
            if chain.len() > MAX_CHAIN_WALK {
                return Err(RecollectError::Internal(format!(
                    "supersession chain from {id} exceeds {MAX_CHAIN_WALK} links"
                )));
            }
            let Some(prev) = load_fact(&facts, prev_id.as_str())? else {
                break;
            };
            cursor = prev.supersedes_id.clone();
            chain.push(prev);
        }
        chain.reverse();

        let mut cursor = start.superseded_by.clone();
        while let Some(next_id) = cursor {
            if chain.len() > MAX_CHAIN_WALK {
                return Err(RecollectError::Internal(format!(
                    "supersession chain from {id} exceeds {MAX_CHAIN_WALK} links"
                )));
            }
            let Some(next) = load_fact(&facts, next_id.as_str())? else {
                break;
            };
            cursor = next.superseded_by.clone();
            chain.push(next);
        }

        Ok(chain)
    }

    /// A current fact in exactly `scope` whose normalized text equals `text`'s.
    pub fn find_current_by_text(&self, text: &str, scope: &Scope) -> Result<Option<Fact>> {
        let wanted = normalize_text(text);
        let now = Utc::now();
        let mut matches = self.scan(|f| {
            f.is_current()
                && !f.is_expired_at(now)
                && &f.scope == scope
                && f.normalized_text() == wanted
        })?;
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches.into_iter().next())
    }

    /// Normalized texts of closed facts visible to `caller`, minus any text
    /// that a current visible fact still carries.
    pub fn superseded_texts(&self, caller: Option<&CallerScope>) -> Result<HashSet<String>> {
        let visible_to = |f: &Fact| caller.is_none_or(|c| visible(f, c));
        let mut closed = HashSet::new();
        let mut live = HashSet::new();

        let read_txn = self.db.begin_read()?;
        let facts = read_txn.open_table(FACTS)?;
        for entry in facts.iter()? {
            let (_k, v) = entry?;
            let fact: Fact = serde_json::from_str(v.value())?;
            if !visible_to(&fact) {
                continue;
            }
            if fact.is_current() {
                live.insert(fact.normalized_text());
            } else {
                closed.insert(fact.normalized_text());
            }
        }

        closed.retain(|t| !live.contains(t));
        Ok(closed)
    }

    /// Every stored fact matching `predicate`.
    pub fn scan(&self, predicate: impl Fn(&Fact) -> bool) -> Result<Vec<Fact>> {
        let read_txn = self.db.begin_read()?;
        let facts = read_txn.open_table(FACTS)?;
        let mut results = Vec::new();

        for entry in facts.iter()? {
            let (_k, v) = entry?;
            let fact: Fact = serde_json::from_str(v.value())?;
            if predicate(&fact) {
                results.push(fact);
            }
        }

        Ok(results)
    }

    pub fn len(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let facts = read_txn.open_table(FACTS)?;
        Ok(facts.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn load_fact(
    table: &impl ReadableTable<&'static str, &'static str>,
    id: &str,
) -> Result<Option<Fact>> {
    match table.get(id)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

/// Resolve an idempotency key to its fact. A key whose fact has since been
/// deleted counts as unused.
fn lookup_idempotent(
    idem: &impl ReadableTable<&'static str, &'static str>,
    facts: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<Fact>> {
    let existing: Option<String> = idem.get(key)?.map(|guard| guard.value().to_string());
    match existing {
        Some(id) => load_fact(facts, &id),
        None => Ok(None),
    }
}

fn entity_index_key(fact: &Fact) -> Option<String> {
    let entity = fact.entity.as_deref()?.to_lowercase();
    let key = fact.key.as_deref().unwrap_or_default().to_lowercase();
    Some(format!("{entity}{KEY_SEP}{key}{KEY_SEP}{}", fact.id))
}
