//! Agent memory engine built on Recollect.
//!
//! [`MemoryEngine`] is the boundary the rest of an agent talks to. It owns
//! the write path (classify, journal, structured write, vector write) and
//! the read path (lexical and semantic search in parallel, scope filter,
//! rank fusion).
//!
//! # Usage
//!
//! ```rust,no_run
//! use recollect::{CallerScope, FactAttributes, ScopeKind};
//! use recollect_agent_memory::{EngineConfig, MemoryEngine, RecallOptions, ScopeParams};
//!
//! # async fn demo() -> recollect_agent_memory::Result<()> {
//! let engine = MemoryEngine::open("./agent-memory", EngineConfig::default())?;
//!
//! let outcome = engine
//!     .store(
//!         "Alice prefers green tea",
//!         FactAttributes::default(),
//!         ScopeParams::new(ScopeKind::User, Some("alice".into())),
//!     )
//!     .await?;
//! println!("{:?}: {}", outcome.action, outcome.reason);
//!
//! let recall = engine
//!     .recall("tea", 5, &CallerScope::user("alice"), &RecallOptions::default())
//!     .await?;
//! for hit in recall.facts {
//!     println!("{:.4} {}", hit.score, hit.fact.text);
//! }
//! # Ok(())
//! # }
//! ```

mod backend;
mod classifier;
mod config;
mod provider;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recollect::{
    fuse, resolve_caller, resolve_write_scope, Action, CallerScope, Candidate, CategoryRegistry,
    Fact, FactAttributes, FactId, FactStore, InsertOptions, RankedFact, ReadOptions,
    RecollectError, Scope, ScopeKind, ScopeMismatch, ScoredFact, SearchOptions, VectorFilter,
    VectorRecord, VectorStore, Wal, WalEntry, WalOp, WalStats,
};
use serde::Serialize;

use backend::Journal;
pub use backend::{StructuredBackend, VectorBackend};
pub use classifier::WriteClassifier;
pub use config::{ClassifyConfig, EngineConfig, WalConfig};
pub use provider::{
    DecisionProvider, EmbeddingProvider, HashEmbedder, RuleDecider, HASH_EMBEDDING_DIM,
};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Store(#[from] RecollectError),

    #[error("no retrieval backend available: {0}")]
    BackendUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Where a new fact goes.
#[derive(Debug, Clone, Default)]
pub struct ScopeParams {
    pub kind: ScopeKind,
    /// Required for every kind but global, unless the authenticated identity supplies it.
    pub target: Option<String>,
    /// Authenticated identity of the writer, when the transport knows one.
    pub identity: Option<CallerScope>,
}

impl ScopeParams {
    pub fn new(kind: ScopeKind, target: Option<String>) -> Self {
        Self {
            kind,
            target,
            identity: None,
        }
    }

    pub fn global() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: CallerScope) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Filters for [`MemoryEngine::recall`].
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    /// Include superseded, retracted and expired facts.
    pub include_superseded: bool,
    /// Point-in-time recall.
    pub as_of: Option<DateTime<Utc>>,
    /// Include cold-tier facts.
    pub include_cold: bool,
    /// Authenticated identity of the reader, when the transport knows one.
    pub identity: Option<CallerScope>,
}

/// A retrieval path that did not contribute to a recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    SemanticTimeout,
    SemanticFailed,
    EmbeddingFailed,
    LexicalTimeout,
    LexicalFailed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Recall {
    pub facts: Vec<RankedFact>,
    /// Empty when both backends answered.
    pub degraded: Vec<Degradation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreAction {
    Added,
    Updated,
    Deleted,
    Noop,
}

/// What a store call did, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreOutcome {
    pub action: StoreAction,
    /// The fact written, or the existing fact that already covers the text.
    pub id: Option<FactId>,
    /// The fact superseded or retracted.
    pub target: Option<FactId>,
    pub reason: String,
    /// `false` when the vector write did not happen; a WAL orphan remains.
    pub vector_indexed: bool,
}

impl StoreOutcome {
    fn noop(id: Option<FactId>, reason: impl Into<String>) -> Self {
        Self {
            action: StoreAction::Noop,
            id,
            target: None,
            reason: reason.into(),
            vector_indexed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Facts re-embedded into the vector store.
    pub reindexed: usize,
    /// Deletes whose vector half was finished.
    pub completed: usize,
    /// Entries left for an operator.
    pub remaining: usize,
}

/// The memory engine: classified writes and hybrid recall over two backends.
///
/// Every method takes `&self`; share one engine across tasks with an `Arc`.
pub struct MemoryEngine {
    structured: Arc<dyn StructuredBackend>,
    vectors: Arc<dyn VectorBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    classifier: WriteClassifier,
    wal: Journal,
    categories: CategoryRegistry,
    config: EngineConfig,
}

impl MemoryEngine {
    /// Open or create an engine rooted at `dir` with the local providers.
    ///
    /// Layout: `facts.redb`, `vectors.redb` and the `wal/` journal.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(RecollectError::from)?;

        let facts = Arc::new(FactStore::open(dir.join("facts.redb"))?);
        let vectors = Arc::new(
            VectorStore::open(dir.join("vectors.redb"))?
                .with_duplicate_threshold(config.duplicate_threshold),
        );
        let wal = if config.wal.enabled {
            Wal::open(dir.join("wal"), config.wal.max_consecutive_failures)
        } else {
            Wal::disabled()
        };

        Self::with_backends(
            Arc::new(facts),
            Arc::new(vectors),
            Arc::new(HashEmbedder::default()),
            Some(Arc::new(RuleDecider) as Arc<dyn DecisionProvider>),
            wal,
            config,
        )
    }

    /// Ephemeral engine with in-memory stores and no journal.
    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let facts = Arc::new(FactStore::open_in_memory()?);
        let vectors = Arc::new(
            VectorStore::open_in_memory()?.with_duplicate_threshold(config.duplicate_threshold),
        );
        Self::with_backends(
            Arc::new(facts),
            Arc::new(vectors),
            Arc::new(HashEmbedder::default()),
            Some(Arc::new(RuleDecider) as Arc<dyn DecisionProvider>),
            Wal::disabled(),
            config,
        )
    }

    /// Assemble an engine from explicit parts.
    ///
    /// Orphaned journal entries from a previous run are logged here; see
    /// [`MemoryEngine::reconcile_orphans`].
    pub fn with_backends(
        structured: Arc<dyn StructuredBackend>,
        vectors: Arc<dyn VectorBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        decider: Option<Arc<dyn DecisionProvider>>,
        wal: Wal,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let wal = Journal::new(wal);
        let orphans = wal.scan_orphans_now()?;
        if !orphans.is_empty() {
            tracing::warn!(
                count = orphans.len(),
                dir = %wal.dir().display(),
                "WAL holds entries from incomplete writes"
            );
        }

        Ok(Self {
            structured,
            vectors,
            embedder,
            classifier: WriteClassifier::new(decider, &config),
            wal,
            categories: CategoryRegistry::new(&config.categories),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The runtime category registry. New labels are accepted immediately.
    pub fn categories(&self) -> &CategoryRegistry {
        &self.categories
    }

    pub fn wal_status(&self) -> WalStats {
        self.wal.stats()
    }

    // -- read path -----------------------------------------------------------

    /// Hybrid recall: lexical and semantic search, scope filter, RRF.
    ///
    /// A backend that fails or times out is skipped and reported in
    /// [`Recall::degraded`]. Only when both fail is this an error.
    pub async fn recall(
        &self,
        query: &str,
        limit: usize,
        caller: &CallerScope,
        opts: &RecallOptions,
    ) -> Result<Recall> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Recall::default());
        }

        let resolved = resolve_caller(caller, opts.identity.as_ref(), self.config.scope_trust);
        log_mismatches("recall", &resolved.mismatches);
        let caller = resolved.caller;

        let search = SearchOptions {
            as_of: opts.as_of,
            include_superseded: opts.include_superseded,
            include_cold: opts.include_cold,
            scope: Some(caller.clone()),
        };
        let window = self.config.candidate_window.max(limit);

        let (lexical, semantic) = tokio::join!(
            self.lexical_candidates(query, window, &search),
            self.semantic_candidates(query, window, &caller),
        );

        let mut degraded = Vec::new();
        let now = Utc::now();
        let mut admitted = |side: std::result::Result<Vec<ScoredFact>, Degradation>| match side {
            Ok(mut hits) => {
                hits.retain(|hit| search.admits(&hit.fact, now));
                Some(hits)
            }
            Err(d) => {
                degraded.push(d);
                None
            }
        };
        let lexical = admitted(lexical);
        let semantic = admitted(semantic);

        let (lexical, semantic) = match (lexical, semantic) {
            (None, None) => {
                tracing::error!(?degraded, "recall failed on both backends");
                return Err(MemoryError::BackendUnavailable(format!(
                    "lexical and semantic search both failed: {degraded:?}"
                )));
            }
            (l, s) => (l.unwrap_or_default(), s.unwrap_or_default()),
        };

        let superseded = if opts.include_superseded || opts.as_of.is_some() {
            HashSet::new()
        } else {
            self.structured
                .superseded_texts(Some(&caller))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "superseded-text lookup failed; not suppressing");
                    HashSet::new()
                })
        };

        let lexical_hits = lexical.len();
        let semantic_hits = semantic.len();
        let facts = fuse(lexical, semantic, &superseded, &self.config.fusion_params(limit));
        tracing::debug!(
            lexical_hits,
            semantic_hits,
            returned = facts.len(),
            ?degraded,
            "recall fused"
        );

        let ids: Vec<FactId> = facts.iter().map(|r| r.fact.id.clone()).collect();
        if let Err(e) = self.structured.record_access(&ids, now).await {
            tracing::warn!(error = %e, "failed to record fact access");
        }

        Ok(Recall { facts, degraded })
    }

    async fn lexical_candidates(
        &self,
        query: &str,
        window: usize,
        search: &SearchOptions,
    ) -> std::result::Result<Vec<ScoredFact>, Degradation> {
        let timeout = self.config.lexical_timeout();
        match tokio::time::timeout(timeout, self.structured.search(query, window, search.clone()))
            .await
        {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "lexical search failed; semantic only");
                Err(Degradation::LexicalFailed)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "lexical search timed out; semantic only"
                );
                Err(Degradation::LexicalTimeout)
            }
        }
    }

    /// Embed, search the caller's visible scopes, then hydrate hits from the
    /// structured store. The vector index may hold facts that have since been
    /// closed or deleted; hydration returns their current state and drops the
    /// missing ones.
    async fn semantic_candidates(
        &self,
        query: &str,
        window: usize,
        caller: &CallerScope,
    ) -> std::result::Result<Vec<ScoredFact>, Degradation> {
        let filter = VectorFilter::VisibleTo(caller.clone());
        let lookup = async {
            let vector = self.embedder.embed(query).await.map_err(|e| {
                tracing::warn!(error = %e, "query embedding failed; lexical only");
                Degradation::EmbeddingFailed
            })?;
            let hits = self
                .vectors
                .search(&vector, window, self.config.min_semantic_score, &filter)
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "vector search failed; lexical only");
                    Degradation::SemanticFailed
                })?;
            let ids: Vec<FactId> = hits.iter().map(|h| h.id.clone()).collect();
            let mut facts = self.structured.get_many(&ids).await.map_err(|e| {
                tracing::warn!(error = %e, "hydrating vector hits failed; lexical only");
                Degradation::SemanticFailed
            })?;
            Ok::<_, Degradation>(
                hits.into_iter()
                    .filter_map(|hit| {
                        facts.remove(&hit.id).map(|fact| ScoredFact {
                            fact,
                            score: f64::from(hit.score),
                        })
                    })
                    .collect::<Vec<_>>(),
            )
        };

        let timeout = self.config.semantic_timeout();
        tokio::time::timeout(timeout, lookup).await.unwrap_or_else(|_| {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "semantic search timed out; lexical only"
            );
            Err(Degradation::SemanticTimeout)
        })
    }

    /// Fetch one fact, subject to the scope filter.
    pub async fn get(
        &self,
        id: &FactId,
        caller: &CallerScope,
        identity: Option<&CallerScope>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<Fact>> {
        let caller = self.reader(caller, identity, "get");
        let opts = ReadOptions {
            as_of,
            scope: Some(caller),
        };
        Ok(self.structured.get(id, opts).await?)
    }

    /// The supersession chain containing `id`, oldest first. Empty when the
    /// caller cannot see the fact.
    pub async fn history(
        &self,
        id: &FactId,
        caller: &CallerScope,
        identity: Option<&CallerScope>,
    ) -> Result<Vec<Fact>> {
        let caller = self.reader(caller, identity, "history");
        let opts = ReadOptions {
            as_of: None,
            scope: Some(caller.clone()),
        };
        if self.structured.get(id, opts).await?.is_none() {
            return Ok(Vec::new());
        }
        let chain = self.structured.history(id).await?;
        Ok(chain
            .into_iter()
            .filter(|f| recollect::visible(f, &caller))
            .collect())
    }

    fn reader(&self, caller: &CallerScope, identity: Option<&CallerScope>, op: &str) -> CallerScope {
        let resolved = resolve_caller(caller, identity, self.config.scope_trust);
        log_mismatches(op, &resolved.mismatches);
        resolved.caller
    }

    // -- write path ----------------------------------------------------------

    /// Store `text`, letting the classifier decide whether it adds, updates,
    /// retracts or is already known.
    ///
    /// Errors only for invalid input (unknown category, malformed scope,
    /// bad fact) or when the structured store cannot persist the fact. A
    /// vector-side failure after the structured write still succeeds, with
    /// `vector_indexed = false` and a WAL orphan left for
    /// [`MemoryEngine::reconcile_orphans`].
    pub async fn store(
        &self,
        text: &str,
        mut attrs: FactAttributes,
        scope: ScopeParams,
    ) -> Result<StoreOutcome> {
        attrs.category = self.categories.validate(&attrs.category)?;
        let (scope, mismatches) = resolve_write_scope(
            scope.kind,
            scope.target,
            scope.identity.as_ref(),
            self.config.scope_trust,
        )?;
        log_mismatches("store", &mismatches);

        let idempotency_key = attrs.idempotency_key.clone();
        let fact = Fact::new(text, attrs, scope, Utc::now())?;

        if let Some(existing) = self
            .structured
            .find_current_by_text(&fact.text, &fact.scope)
            .await?
        {
            let reason = format!("identical to fact {}", existing.id);
            return Ok(self.finish(StoreOutcome::noop(Some(existing.id), reason)));
        }

        let embedding = self.embed_for_store(&fact.text).await;
        if let Some(vector) = &embedding {
            if let Some(existing) = self.near_duplicate(vector, &fact.scope).await? {
                let reason = format!("near-duplicate of fact {}", existing.id);
                return Ok(self.finish(StoreOutcome::noop(Some(existing.id), reason)));
            }
        }

        let neighbors = self.neighbors(&fact, embedding.as_deref()).await?;
        let classification = self
            .classifier
            .classify(&Candidate::from_fact(&fact), &neighbors)
            .await;

        let outcome = match classification.action {
            Action::Noop => StoreOutcome::noop(None, classification.reason),
            Action::Add => {
                self.write_fact(fact, None, idempotency_key, embedding, classification.reason)
                    .await?
            }
            Action::Update(target) => {
                let fallback = (fact.clone(), idempotency_key.clone(), embedding.clone());
                match self
                    .write_fact(
                        fact,
                        Some(target.clone()),
                        idempotency_key,
                        embedding,
                        classification.reason,
                    )
                    .await
                {
                    // The target closed between classification and write.
                    Err(MemoryError::Store(
                        RecollectError::AlreadySuperseded(_) | RecollectError::NotFound(_),
                    )) => {
                        tracing::warn!(target_id = %target, "update target changed; adding instead");
                        let (fact, idempotency_key, embedding) = fallback;
                        let reason =
                            format!("update target {target} changed concurrently; added instead");
                        self.write_fact(fact, None, idempotency_key, embedding, reason)
                            .await?
                    }
                    other => other?,
                }
            }
            Action::Delete(target) => {
                match self.retract(target.clone(), classification.reason).await {
                    Err(MemoryError::Store(RecollectError::AlreadySuperseded(_))) => {
                        StoreOutcome::noop(
                            Some(target.clone()),
                            format!("fact {target} was already closed"),
                        )
                    }
                    other => other?,
                }
            }
        };
        Ok(self.finish(outcome))
    }

    fn finish(&self, outcome: StoreOutcome) -> StoreOutcome {
        tracing::info!(
            action = ?outcome.action,
            id = outcome.id.as_ref().map(|id| id.as_str()),
            target = outcome.target.as_ref().map(|id| id.as_str()),
            vector_indexed = outcome.vector_indexed,
            reason = %outcome.reason,
            "store completed"
        );
        outcome
    }

    async fn embed_for_store(&self, text: &str) -> Option<Vec<f32>> {
        let timeout = self.config.semantic_timeout();
        match tokio::time::timeout(timeout, self.embedder.embed(text)).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding failed; storing without vector");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "embedding timed out; storing without vector"
                );
                None
            }
        }
    }

    /// A current fact in `scope` at least `duplicate_threshold` similar.
    ///
    /// The index may still hold closed facts, so a positive answer is
    /// confirmed against the structured store before it counts.
    async fn near_duplicate(&self, vector: &[f32], scope: &Scope) -> Result<Option<Fact>> {
        let filter = VectorFilter::Scope(scope.clone());
        match self.vectors.has_duplicate(vector, &filter).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "duplicate check failed; skipping");
                return Ok(None);
            }
        }

        let hits = match self
            .vectors
            .search(
                vector,
                self.config.candidate_window,
                self.config.duplicate_threshold,
                &filter,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "duplicate search failed; skipping");
                return Ok(None);
            }
        };
        let ids: Vec<FactId> = hits.iter().map(|h| h.id.clone()).collect();
        let mut facts = self.structured.get_many(&ids).await?;
        let now = Utc::now();
        Ok(hits.into_iter().find_map(|hit| {
            facts
                .remove(&hit.id)
                .filter(|f| same_slot(f, scope, now))
        }))
    }

    /// Existing facts the classifier should compare against: structured
    /// entity/key matches first, then vector neighbours. Only current facts
    /// in exactly the new fact's scope qualify.
    async fn neighbors(&self, fact: &Fact, embedding: Option<&[f32]>) -> Result<Vec<Fact>> {
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut neighbors = Vec::new();

        if let Some(entity) = &fact.entity {
            let opts = SearchOptions {
                scope: Some(fact.scope.owner()),
                ..SearchOptions::default()
            };
            let hits = self
                .structured
                .lookup(entity, fact.key.as_deref(), None, opts)
                .await?;
            for hit in hits {
                if same_slot(&hit.fact, &fact.scope, now) && seen.insert(hit.fact.id.clone()) {
                    neighbors.push(hit.fact);
                }
            }
        }

        if let Some(vector) = embedding {
            match self
                .vectors
                .search(
                    vector,
                    self.config.candidate_window,
                    self.config.classify.min_similarity,
                    &VectorFilter::Scope(fact.scope.clone()),
                )
                .await
            {
                Ok(hits) => {
                    let ids: Vec<FactId> = hits
                        .iter()
                        .map(|h| h.id.clone())
                        .filter(|id| !seen.contains(id))
                        .collect();
                    let mut facts = self.structured.get_many(&ids).await?;
                    for id in ids {
                        if let Some(f) = facts.remove(&id) {
                            if same_slot(&f, &fact.scope, now) && seen.insert(f.id.clone()) {
                                neighbors.push(f);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "neighbour search failed; structured matches only");
                }
            }
        }

        neighbors.truncate(self.config.classify.max_candidates);
        Ok(neighbors)
    }

    /// Journal, structured write, vector write, journal removal, in that order.
    async fn write_fact(
        &self,
        fact: Fact,
        supersedes: Option<FactId>,
        idempotency_key: Option<String>,
        embedding: Option<Vec<f32>>,
        reason: String,
    ) -> Result<StoreOutcome> {
        let op = match &supersedes {
            Some(target) => WalOp::Update {
                target: target.clone(),
            },
            None => WalOp::Store,
        };
        let token = self.wal.write(op, &fact.id, Some(&fact)).await;

        let opts = InsertOptions {
            supersedes: supersedes.clone(),
            at: None,
            idempotency_key,
        };
        let inserted = match self.structured.insert(fact, opts).await {
            Ok(inserted) => inserted,
            Err(e) => {
                // Nothing landed; the entry would only mislead recovery.
                self.wal.remove(&token).await;
                return Err(e.into());
            }
        };
        let stored = inserted.fact;

        if !inserted.created {
            self.wal.remove(&token).await;
            return Ok(StoreOutcome::noop(
                Some(stored.id),
                "idempotency key already used",
            ));
        }

        let vector_indexed = match embedding {
            Some(vector) => {
                let record = VectorRecord {
                    id: stored.id.clone(),
                    text: stored.text.clone(),
                    scope: stored.scope.clone(),
                    vector,
                };
                match self.vectors.store(record).await {
                    Ok(()) => {
                        self.wal.remove(&token).await;
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            id = %stored.id,
                            token = %token,
                            error = %e,
                            "vector write failed; WAL entry kept for reconciliation"
                        );
                        false
                    }
                }
            }
            None => {
                tracing::warn!(
                    id = %stored.id,
                    token = %token,
                    "no embedding; WAL entry kept for reconciliation"
                );
                false
            }
        };

        let (action, target) = match supersedes {
            Some(target) => (StoreAction::Updated, Some(target)),
            None => (StoreAction::Added, None),
        };
        Ok(StoreOutcome {
            action,
            id: Some(stored.id),
            target,
            reason,
            vector_indexed,
        })
    }

    async fn retract(&self, target: FactId, reason: String) -> Result<StoreOutcome> {
        let token = self
            .wal
            .write(
                WalOp::Retract {
                    target: target.clone(),
                },
                &target,
                None,
            )
            .await;
        let result = self.structured.supersede(&target, None, Utc::now()).await;
        self.wal.remove(&token).await;
        result?;

        Ok(StoreOutcome {
            action: StoreAction::Deleted,
            id: None,
            target: Some(target),
            reason,
            vector_indexed: false,
        })
    }

    /// Hard-delete a fact from both backends.
    ///
    /// Returns `false` when the fact does not exist or the caller cannot see
    /// it. A fact that a newer one still supersedes is rejected with
    /// [`RecollectError::StillReferenced`].
    pub async fn forget(
        &self,
        id: &FactId,
        caller: &CallerScope,
        identity: Option<&CallerScope>,
    ) -> Result<bool> {
        let caller = self.reader(caller, identity, "forget");
        let opts = ReadOptions {
            as_of: None,
            scope: Some(caller),
        };
        let Some(fact) = self.structured.get(id, opts).await? else {
            return Ok(false);
        };

        let token = self.wal.write(WalOp::Delete, id, Some(&fact)).await;
        let existed = match self.structured.delete(id).await {
            Ok(existed) => existed,
            Err(e) => {
                self.wal.remove(&token).await;
                return Err(e.into());
            }
        };

        match self.vectors.delete(id).await {
            Ok(_) => self.wal.remove(&token).await,
            Err(e) => tracing::warn!(
                id = %id,
                token = %token,
                error = %e,
                "vector delete failed; WAL entry kept for reconciliation"
            ),
        }
        tracing::info!(id = %id, existed, "fact forgotten");
        Ok(existed)
    }

    // -- recovery ------------------------------------------------------------

    /// Journal entries whose operation never confirmed completion.
    pub async fn orphans(&self) -> Result<Vec<WalEntry>> {
        Ok(self.wal.scan_orphans().await?)
    }

    /// Finish what the structured store says already happened.
    ///
    /// - store/update whose fact exists: re-embed and re-index it
    /// - delete whose fact is gone: drop its vector
    ///
    /// Everything else is left in the journal. Run while no writes are in
    /// flight, since their entries look like orphans too.
    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for entry in self.wal.scan_orphans().await? {
            let landed = self
                .structured
                .get(&entry.fact_id, ReadOptions::default())
                .await?;

            let repaired = match (&entry.op, landed) {
                (WalOp::Store | WalOp::Update { .. }, Some(fact)) => {
                    let done = self.reindex(&fact).await;
                    if done {
                        report.reindexed += 1;
                    }
                    done
                }
                (WalOp::Delete, None) => match self.vectors.delete(&entry.fact_id).await {
                    Ok(_) => {
                        report.completed += 1;
                        true
                    }
                    Err(e) => {
                        tracing::warn!(id = %entry.fact_id, error = %e, "vector delete retry failed");
                        false
                    }
                },
                _ => false,
            };

            if repaired {
                self.wal.remove(&entry.token).await;
            } else {
                report.remaining += 1;
            }
        }

        tracing::info!(
            reindexed = report.reindexed,
            completed = report.completed,
            remaining = report.remaining,
            "WAL reconciliation finished"
        );
        Ok(report)
    }

    async fn reindex(&self, fact: &Fact) -> bool {
        match self.vectors.contains(&fact.id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(id = %fact.id, error = %e, "vector lookup failed");
                return false;
            }
        }
        let Some(vector) = self.embed_for_store(&fact.text).await else {
            return false;
        };
        let record = VectorRecord {
            id: fact.id.clone(),
            text: fact.text.clone(),
            scope: fact.scope.clone(),
            vector,
        };
        match self.vectors.store(record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(id = %fact.id, error = %e, "re-index failed");
                false
            }
        }
    }
}

fn same_slot(fact: &Fact, scope: &Scope, now: DateTime<Utc>) -> bool {
    fact.is_current() && !fact.is_expired_at(now) && &fact.scope == scope
}

fn log_mismatches(op: &str, mismatches: &[ScopeMismatch]) {
    for m in mismatches {
        tracing::warn!(
            op,
            kind = %m.kind,
            supplied = %m.supplied,
            authenticated = %m.authenticated,
            "caller-supplied scope disagrees with authenticated identity"
        );
    }
}
