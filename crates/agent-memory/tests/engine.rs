use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recollect::{
    CallerScope, Candidate, Decision, DecisionAction, Fact, FactAttributes, FactId, FactStore,
    InsertOptions, Inserted, ReadOptions, RecollectError, Scope, ScopeKind, ScopeTrust,
    ScoredFact, SearchOptions, VectorFilter, VectorHit, VectorRecord, VectorStore, Wal, WalOp,
};
use recollect_agent_memory::{
    DecisionProvider, Degradation, EmbeddingProvider, EngineConfig, HashEmbedder, MemoryEngine,
    MemoryError, RecallOptions, RuleDecider, ScopeParams, StoreAction, StructuredBackend,
    VectorBackend,
};
use tempfile::TempDir;

type Result<T> = recollect::Result<T>;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct FlakyStructured {
    inner: Arc<FactStore>,
    fail_search: AtomicBool,
}

#[async_trait]
impl StructuredBackend for FlakyStructured {
    async fn insert(&self, fact: Fact, opts: InsertOptions) -> Result<Inserted> {
        StructuredBackend::insert(&self.inner, fact, opts).await
    }

    async fn get(&self, id: &FactId, opts: ReadOptions) -> Result<Option<Fact>> {
        StructuredBackend::get(&self.inner, id, opts).await
    }

    async fn get_many(&self, ids: &[FactId]) -> Result<HashMap<FactId, Fact>> {
        StructuredBackend::get_many(&self.inner, ids).await
    }

    async fn search(&self, query: &str, limit: usize, opts: SearchOptions) -> Result<Vec<ScoredFact>> {
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(RecollectError::Storage("structured store offline".into()));
        }
        StructuredBackend::search(&self.inner, query, limit, opts).await
    }

    async fn lookup(
        &self,
        entity: &str,
        key: Option<&str>,
        tag: Option<&str>,
        opts: SearchOptions,
    ) -> Result<Vec<ScoredFact>> {
        StructuredBackend::lookup(&self.inner, entity, key, tag, opts).await
    }

    async fn delete(&self, id: &FactId) -> Result<bool> {
        StructuredBackend::delete(&self.inner, id).await
    }

    async fn supersede(&self, old: &FactId, new: Option<&FactId>, at: DateTime<Utc>) -> Result<()> {
        StructuredBackend::supersede(&self.inner, old, new, at).await
    }

    async fn history(&self, id: &FactId) -> Result<Vec<Fact>> {
        StructuredBackend::history(&self.inner, id).await
    }

    async fn find_current_by_text(&self, text: &str, scope: &Scope) -> Result<Option<Fact>> {
        StructuredBackend::find_current_by_text(&self.inner, text, scope).await
    }

    async fn superseded_texts(&self, caller: Option<&CallerScope>) -> Result<HashSet<String>> {
        StructuredBackend::superseded_texts(&self.inner, caller).await
    }

    async fn record_access(&self, ids: &[FactId], at: DateTime<Utc>) -> Result<()> {
        StructuredBackend::record_access(&self.inner, ids, at).await
    }
}

struct FlakyVectors {
    inner: Arc<VectorStore>,
    fail_writes: AtomicBool,
    slow_search: AtomicBool,
}

#[async_trait]
impl VectorBackend for FlakyVectors {
    async fn store(&self, record: VectorRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RecollectError::Storage("vector store offline".into()));
        }
        VectorBackend::store(&self.inner, record).await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        if self.slow_search.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        VectorBackend::search(&self.inner, vector, limit, min_score, filter).await
    }

    async fn delete(&self, id: &FactId) -> Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RecollectError::Storage("vector store offline".into()));
        }
        VectorBackend::delete(&self.inner, id).await
    }

    async fn has_duplicate(&self, vector: &[f32], filter: &VectorFilter) -> Result<bool> {
        VectorBackend::has_duplicate(&self.inner, vector, filter).await
    }

    async fn contains(&self, id: &FactId) -> Result<bool> {
        VectorBackend::contains(&self.inner, id).await
    }
}

#[derive(Default)]
struct FlakyEmbedder {
    inner: HashEmbedder,
    fail: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("embedding service unreachable");
        }
        self.inner.embed(text).await
    }
}

/// Always answers `action`, aimed at `target` or else the first neighbour.
struct Scripted {
    action: DecisionAction,
    target: Option<String>,
}

#[async_trait]
impl DecisionProvider for Scripted {
    async fn decide(&self, _: &Candidate, neighbors: &[Fact]) -> anyhow::Result<Decision> {
        Ok(Decision {
            action: self.action,
            target_id: self
                .target
                .clone()
                .or_else(|| neighbors.first().map(|f| f.id.0.clone())),
            reason: "scripted".into(),
        })
    }
}

/// Closes its first neighbour itself before answering `action` on it, like
/// a concurrent writer landing between classification and the write.
struct Racing {
    facts: Arc<FactStore>,
    action: DecisionAction,
}

#[async_trait]
impl DecisionProvider for Racing {
    async fn decide(&self, _: &Candidate, neighbors: &[Fact]) -> anyhow::Result<Decision> {
        let target = neighbors.first().map(|f| f.id.clone());
        if let Some(id) = &target {
            FactStore::supersede(&self.facts, id, None, Utc::now())?;
        }
        Ok(Decision {
            action: self.action,
            target_id: target.map(|id| id.0),
            reason: "racing".into(),
        })
    }
}

struct Harness {
    engine: Arc<MemoryEngine>,
    facts: Arc<FactStore>,
    structured: Arc<FlakyStructured>,
    vectors: Arc<FlakyVectors>,
    embedder: Arc<FlakyEmbedder>,
    _dir: TempDir,
}

fn harness_with(config: EngineConfig, decider: Arc<dyn DecisionProvider>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let facts = Arc::new(FactStore::open(dir.path().join("facts.redb")).unwrap());
    let structured = Arc::new(FlakyStructured {
        inner: Arc::clone(&facts),
        fail_search: AtomicBool::new(false),
    });
    let vectors = Arc::new(FlakyVectors {
        inner: Arc::new(VectorStore::open(dir.path().join("vectors.redb")).unwrap()),
        fail_writes: AtomicBool::new(false),
        slow_search: AtomicBool::new(false),
    });
    let embedder = Arc::new(FlakyEmbedder::default());
    let wal = Wal::open(dir.path().join("wal"), config.wal.max_consecutive_failures);

    let engine = MemoryEngine::with_backends(
        structured.clone() as Arc<dyn StructuredBackend>,
        vectors.clone() as Arc<dyn VectorBackend>,
        embedder.clone() as Arc<dyn EmbeddingProvider>,
        Some(decider),
        wal,
        config,
    )
    .unwrap();

    Harness {
        engine: Arc::new(engine),
        facts,
        structured,
        vectors,
        embedder,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::default(), Arc::new(RuleDecider))
}

fn user(id: &str) -> ScopeParams {
    ScopeParams::new(ScopeKind::User, Some(id.into()))
}

fn slot(entity: &str, key: &str, value: &str) -> FactAttributes {
    FactAttributes {
        entity: Some(entity.into()),
        key: Some(key.into()),
        value: Some(value.into()),
        ..FactAttributes::default()
    }
}

fn texts(recall: &recollect_agent_memory::Recall) -> Vec<&str> {
    recall.facts.iter().map(|r| r.fact.text.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scoped_facts_never_reach_other_callers() {
    let h = harness();
    let e = &h.engine;
    e.store("Alice door code is 4711", FactAttributes::default(), user("alice"))
        .await
        .unwrap();
    e.store(
        "Deploy agent door code is 9000",
        FactAttributes::default(),
        ScopeParams::new(ScopeKind::Agent, Some("deployer".into())),
    )
    .await
    .unwrap();
    e.store(
        "Office door code changes monthly",
        FactAttributes::default(),
        ScopeParams::global(),
    )
    .await
    .unwrap();

    let opts = RecallOptions::default();
    let bob = e.recall("door code", 10, &CallerScope::user("bob"), &opts).await.unwrap();
    assert_eq!(texts(&bob), vec!["Office door code changes monthly"]);

    let alice = e.recall("door code", 10, &CallerScope::user("alice"), &opts).await.unwrap();
    let alice_texts = texts(&alice);
    assert_eq!(alice_texts.len(), 2);
    assert!(alice_texts.contains(&"Alice door code is 4711"));
    assert!(!alice_texts.iter().any(|t| t.contains("9000")));

    let agent = e
        .recall("door code", 10, &CallerScope::agent("deployer"), &opts)
        .await
        .unwrap();
    assert!(texts(&agent).contains(&"Deploy agent door code is 9000"));
}

#[tokio::test]
async fn user_scope_without_target_is_rejected() {
    let h = harness();
    let err = h
        .engine
        .store(
            "Alice likes jazz",
            FactAttributes::default(),
            ScopeParams::new(ScopeKind::User, None),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::Store(RecollectError::ScopeTargetRequired(ScopeKind::User))
    ));
    assert!(h.facts.is_empty().unwrap());
}

#[tokio::test]
async fn authenticated_identity_supplies_missing_target() {
    let h = harness();
    let outcome = h
        .engine
        .store(
            "Alice likes jazz",
            FactAttributes::default(),
            ScopeParams::new(ScopeKind::User, None).with_identity(CallerScope::user("alice")),
        )
        .await
        .unwrap();
    let id = outcome.id.unwrap();
    let fact = FactStore::get(&h.facts, &id, &ReadOptions::default()).unwrap().unwrap();
    assert_eq!(fact.scope, Scope::User("alice".into()));
}

#[tokio::test]
async fn authenticated_only_ignores_supplied_identity() {
    let config = EngineConfig {
        scope_trust: ScopeTrust::AuthenticatedOnly,
        ..EngineConfig::default()
    };
    let h = harness_with(config, Arc::new(RuleDecider));
    let e = &h.engine;

    let err = e
        .store(
            "Alice likes jazz",
            FactAttributes::default(),
            user("alice").with_identity(CallerScope::user("mallory")),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::Store(RecollectError::ScopeMismatch { .. })
    ));

    e.store(
        "Alice likes jazz",
        FactAttributes::default(),
        user("alice").with_identity(CallerScope::user("alice")),
    )
    .await
    .unwrap();

    let spoofed = RecallOptions {
        identity: Some(CallerScope::user("mallory")),
        ..RecallOptions::default()
    };
    let hits = e
        .recall("jazz", 10, &CallerScope::user("alice"), &spoofed)
        .await
        .unwrap();
    assert!(hits.facts.is_empty());
}

// ---------------------------------------------------------------------------
// Write classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn storing_identical_text_twice_is_noop() {
    let h = harness();
    let first = h
        .engine
        .store("Bob drinks oat milk", FactAttributes::default(), user("bob"))
        .await
        .unwrap();
    let second = h
        .engine
        .store("Bob drinks oat milk", FactAttributes::default(), user("bob"))
        .await
        .unwrap();
    assert_eq!(first.action, StoreAction::Added);
    assert_eq!(second.action, StoreAction::Noop);
    assert_eq!(second.id, first.id);
    assert_eq!(h.facts.len().unwrap(), 1);
}

#[tokio::test]
async fn identical_text_in_another_scope_is_stored() {
    let h = harness();
    h.engine
        .store("Prefers dark mode", FactAttributes::default(), user("alice"))
        .await
        .unwrap();
    let other = h
        .engine
        .store("Prefers dark mode", FactAttributes::default(), user("bob"))
        .await
        .unwrap();
    assert_eq!(other.action, StoreAction::Added);
    assert_eq!(h.facts.len().unwrap(), 2);
}

#[tokio::test]
async fn idempotency_key_makes_retries_noop() {
    let h = harness();
    let attrs = |key: &str| FactAttributes {
        idempotency_key: Some(key.into()),
        ..FactAttributes::default()
    };
    let first = h
        .engine
        .store("Standup moved to 10am", attrs("req-1"), ScopeParams::global())
        .await
        .unwrap();
    let retry = h
        .engine
        .store("Standup now happens at ten", attrs("req-1"), ScopeParams::global())
        .await
        .unwrap();
    assert_eq!(retry.action, StoreAction::Noop);
    assert_eq!(retry.id, first.id);
    assert_eq!(h.facts.len().unwrap(), 1);
    assert!(h.engine.orphans().await.unwrap().is_empty());
}

#[tokio::test]
async fn update_supersedes_and_point_in_time_recall_sees_old_value() {
    let h = harness();
    let e = &h.engine;
    let acme = e
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let between = Utc::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let beta = e
        .store("Alice works at Beta", slot("alice", "works_at", "Beta"), user("alice"))
        .await
        .unwrap();

    assert_eq!(beta.action, StoreAction::Updated);
    assert_eq!(beta.target, acme.id);

    let alice = CallerScope::user("alice");
    let now = e
        .recall("works", 10, &alice, &RecallOptions::default())
        .await
        .unwrap();
    assert_eq!(texts(&now), vec!["Alice works at Beta"]);

    let then = RecallOptions {
        as_of: Some(between),
        ..RecallOptions::default()
    };
    let past = e.recall("works", 10, &alice, &then).await.unwrap();
    assert_eq!(texts(&past), vec!["Alice works at Acme"]);

    let beta_id = beta.id.unwrap();
    let at_between = e.get(&beta_id, &alice, None, Some(between)).await.unwrap().unwrap();
    assert_eq!(Some(&at_between.id), acme.id.as_ref());

    let everything = RecallOptions {
        include_superseded: true,
        ..RecallOptions::default()
    };
    let all = e.recall("works", 10, &alice, &everything).await.unwrap();
    assert_eq!(all.facts.len(), 2);
}

#[tokio::test]
async fn delete_decision_retracts_target() {
    let decider = Arc::new(Scripted {
        action: DecisionAction::Delete,
        target: None,
    });
    let h = harness_with(EngineConfig::default(), decider);
    let e = &h.engine;
    let acme = e
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap();
    let acme_id = acme.id.unwrap();

    let retracted = e
        .store(
            "Alice left her job",
            slot("alice", "works_at", "none"),
            user("alice"),
        )
        .await
        .unwrap();
    assert_eq!(retracted.action, StoreAction::Deleted);
    assert_eq!(retracted.target.as_ref(), Some(&acme_id));
    assert!(retracted.id.is_none());

    let closed = FactStore::get(&h.facts, &acme_id, &ReadOptions::default()).unwrap().unwrap();
    assert!(closed.superseded_at.is_some());
    assert!(closed.superseded_by.is_none());

    let hits = e
        .recall("Acme", 10, &CallerScope::user("alice"), &RecallOptions::default())
        .await
        .unwrap();
    assert!(hits.facts.is_empty());
}

#[tokio::test]
async fn decision_naming_foreign_fact_becomes_add() {
    let h = harness();
    let elsewhere = h
        .engine
        .store("Bob works at Acme", slot("bob", "works_at", "Acme"), user("bob"))
        .await
        .unwrap()
        .id
        .unwrap();

    let decider = Arc::new(Scripted {
        action: DecisionAction::Delete,
        target: Some(elsewhere.0.clone()),
    });
    let h2 = harness_with(EngineConfig::default(), decider);
    h2.engine
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap();
    let outcome = h2
        .engine
        .store("Alice works at Beta", slot("alice", "works_at", "Beta"), user("alice"))
        .await
        .unwrap();
    assert_eq!(outcome.action, StoreAction::Added);
    assert!(outcome.reason.contains(elsewhere.as_str()));
    assert_eq!(h2.facts.len().unwrap(), 2);
}

#[tokio::test]
async fn update_losing_a_race_falls_back_to_add() {
    let h = harness();
    let acme = h
        .engine
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap()
        .id
        .unwrap();

    let decider = Arc::new(Racing {
        facts: Arc::clone(&h.facts),
        action: DecisionAction::Update,
    }) as Arc<dyn DecisionProvider>;
    let racing = MemoryEngine::with_backends(
        h.structured.clone() as Arc<dyn StructuredBackend>,
        h.vectors.clone() as Arc<dyn VectorBackend>,
        h.embedder.clone() as Arc<dyn EmbeddingProvider>,
        Some(decider),
        Wal::open(h._dir.path().join("racing-wal"), 10),
        EngineConfig::default(),
    )
    .unwrap();

    let outcome = racing
        .store("Alice works at Beta", slot("alice", "works_at", "Beta"), user("alice"))
        .await
        .unwrap();
    assert_eq!(outcome.action, StoreAction::Added);
    assert!(outcome.target.is_none());
    assert!(outcome.reason.contains(acme.as_str()));
    assert!(outcome.vector_indexed);

    let beta = FactStore::get(&h.facts, &outcome.id.unwrap(), &ReadOptions::default())
        .unwrap()
        .unwrap();
    assert!(beta.supersedes_id.is_none());
    let old = FactStore::get(&h.facts, &acme, &ReadOptions::default()).unwrap().unwrap();
    assert!(old.superseded_by.is_none());
    assert!(racing.orphans().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_of_an_already_closed_fact_is_noop() {
    let h = harness();
    let acme = h
        .engine
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap()
        .id
        .unwrap();

    let decider = Arc::new(Racing {
        facts: Arc::clone(&h.facts),
        action: DecisionAction::Delete,
    }) as Arc<dyn DecisionProvider>;
    let racing = MemoryEngine::with_backends(
        h.structured.clone() as Arc<dyn StructuredBackend>,
        h.vectors.clone() as Arc<dyn VectorBackend>,
        h.embedder.clone() as Arc<dyn EmbeddingProvider>,
        Some(decider),
        Wal::open(h._dir.path().join("racing-wal"), 10),
        EngineConfig::default(),
    )
    .unwrap();

    let outcome = racing
        .store("Alice left Acme", slot("alice", "works_at", "none"), user("alice"))
        .await
        .unwrap();
    assert_eq!(outcome.action, StoreAction::Noop);
    assert_eq!(outcome.id.as_ref(), Some(&acme));
    assert!(racing.orphans().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Crowded vector index
// ---------------------------------------------------------------------------

#[tokio::test]
async fn other_tenants_cannot_crowd_out_own_duplicates() {
    let h = harness();
    let e = &h.engine;
    let window = EngineConfig::default().candidate_window;
    for i in 0..window + 10 {
        let outcome = e
            .store("coffee is hot", FactAttributes::default(), user(&format!("user{i}")))
            .await
            .unwrap();
        assert_eq!(outcome.action, StoreAction::Added);
    }

    let first = e
        .store("coffee is hot", FactAttributes::default(), user("alice"))
        .await
        .unwrap();
    assert_eq!(first.action, StoreAction::Added);

    let again = e
        .store("coffee is hot!", FactAttributes::default(), user("alice"))
        .await
        .unwrap();
    assert_eq!(again.action, StoreAction::Noop);
    assert_eq!(again.id, first.id);
    assert!(again.reason.contains("near-duplicate"));

    let recall = e
        .recall("coffee is hot", 5, &CallerScope::user("alice"), &RecallOptions::default())
        .await
        .unwrap();
    assert_eq!(recall.facts.len(), 1);
    assert_eq!(Some(&recall.facts[0].fact.id), first.id.as_ref());
    assert_eq!(recall.facts[0].semantic_rank, Some(1));
}

#[tokio::test]
async fn slot_update_fires_amid_other_tenants() {
    let h = harness();
    let e = &h.engine;
    for i in 0..EngineConfig::default().candidate_window + 5 {
        e.store(
            "Alice works at Acme",
            slot("alice", "works_at", "Acme"),
            user(&format!("user{i}")),
        )
        .await
        .unwrap();
    }
    let acme = e
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap();
    assert_eq!(acme.action, StoreAction::Added);

    let beta = e
        .store("Alice works at Beta", slot("alice", "works_at", "Beta"), user("alice"))
        .await
        .unwrap();
    assert_eq!(beta.action, StoreAction::Updated);
    assert_eq!(beta.target, acme.id);
}

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn semantic_timeout_degrades_to_lexical() {
    let config = EngineConfig {
        semantic_timeout_ms: 100,
        ..EngineConfig::default()
    };
    let h = harness_with(config, Arc::new(RuleDecider));
    h.engine
        .store("Carol owns a red bicycle", FactAttributes::default(), ScopeParams::global())
        .await
        .unwrap();

    h.vectors.slow_search.store(true, Ordering::SeqCst);
    let recall = h
        .engine
        .recall("bicycle", 5, &CallerScope::default(), &RecallOptions::default())
        .await
        .unwrap();
    assert_eq!(recall.degraded, vec![Degradation::SemanticTimeout]);
    assert_eq!(texts(&recall), vec!["Carol owns a red bicycle"]);
    assert!(recall.facts[0].semantic_rank.is_none());
}

#[tokio::test]
async fn lexical_failure_degrades_to_semantic() {
    let h = harness();
    h.engine
        .store("Carol owns a red bicycle", FactAttributes::default(), ScopeParams::global())
        .await
        .unwrap();
    h.structured.fail_search.store(true, Ordering::SeqCst);
    let recall = h
        .engine
        .recall("red bicycle", 5, &CallerScope::default(), &RecallOptions::default())
        .await
        .unwrap();
    assert_eq!(recall.degraded, vec![Degradation::LexicalFailed]);
    assert_eq!(texts(&recall), vec!["Carol owns a red bicycle"]);
}

#[tokio::test]
async fn both_backends_down_is_an_error() {
    let h = harness();
    h.structured.fail_search.store(true, Ordering::SeqCst);
    h.embedder.fail.store(true, Ordering::SeqCst);
    let err = h
        .engine
        .recall("anything", 5, &CallerScope::default(), &RecallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::BackendUnavailable(_)));
}

#[tokio::test]
async fn no_match_is_not_an_error() {
    let h = harness();
    let recall = h
        .engine
        .recall("nothing stored yet", 5, &CallerScope::default(), &RecallOptions::default())
        .await
        .unwrap();
    assert!(recall.facts.is_empty());
    assert!(recall.degraded.is_empty());
}

// ---------------------------------------------------------------------------
// WAL and reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_writes_leave_no_orphans() {
    let h = harness();
    h.engine
        .store("Dana runs on Tuesdays", FactAttributes::default(), ScopeParams::global())
        .await
        .unwrap();
    assert!(h.engine.orphans().await.unwrap().is_empty());
    assert!(h.engine.wal_status().enabled);
    assert_eq!(h.engine.wal_status().total_failures, 0);
}

#[tokio::test]
async fn vector_failure_leaves_orphan_until_reconciled() {
    let h = harness();
    h.vectors.fail_writes.store(true, Ordering::SeqCst);
    let outcome = h
        .engine
        .store("Dana runs on Tuesdays", FactAttributes::default(), ScopeParams::global())
        .await
        .unwrap();
    assert_eq!(outcome.action, StoreAction::Added);
    assert!(!outcome.vector_indexed);
    let id = outcome.id.unwrap();

    let orphans = h.engine.orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].op, WalOp::Store);
    assert_eq!(orphans[0].fact_id, id);

    // Still failing: the entry stays.
    let report = h.engine.reconcile_orphans().await.unwrap();
    assert_eq!(report.remaining, 1);

    h.vectors.fail_writes.store(false, Ordering::SeqCst);
    let report = h.engine.reconcile_orphans().await.unwrap();
    assert_eq!(report.reindexed, 1);
    assert_eq!(report.remaining, 0);
    assert!(h.engine.orphans().await.unwrap().is_empty());
    assert!(VectorStore::contains(&h.vectors.inner, &id).unwrap());
}

#[tokio::test]
async fn embedding_failure_still_persists_fact() {
    let h = harness();
    h.embedder.fail.store(true, Ordering::SeqCst);
    let outcome = h
        .engine
        .store("Erin speaks Portuguese", FactAttributes::default(), ScopeParams::global())
        .await
        .unwrap();
    assert_eq!(outcome.action, StoreAction::Added);
    assert!(!outcome.vector_indexed);

    let recall = h
        .engine
        .recall("Portuguese", 5, &CallerScope::default(), &RecallOptions::default())
        .await
        .unwrap();
    assert_eq!(recall.degraded, vec![Degradation::EmbeddingFailed]);
    assert_eq!(recall.facts.len(), 1);

    h.embedder.fail.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.reconcile_orphans().await.unwrap().reindexed, 1);

    let recall = h
        .engine
        .recall("Erin speaks Portuguese", 5, &CallerScope::default(), &RecallOptions::default())
        .await
        .unwrap();
    assert!(recall.degraded.is_empty());
    assert_eq!(recall.facts[0].semantic_rank, Some(1));
}

#[tokio::test]
async fn orphans_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = Wal::open(dir.path().join("wal"), 10);
        wal.write(WalOp::Store, &FactId::new(), None);
    }
    let engine = MemoryEngine::open(dir.path(), EngineConfig::default()).unwrap();
    assert_eq!(engine.orphans().await.unwrap().len(), 1);
    // Its fact never landed, so nothing can be repaired.
    let report = engine.reconcile_orphans().await.unwrap();
    assert_eq!(report.remaining, 1);
}

// ---------------------------------------------------------------------------
// Forget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forget_is_scope_checked_and_clears_both_backends() {
    let h = harness();
    let id = h
        .engine
        .store("Frank is allergic to peanuts", FactAttributes::default(), user("frank"))
        .await
        .unwrap()
        .id
        .unwrap();

    assert!(!h.engine.forget(&id, &CallerScope::user("eve"), None).await.unwrap());
    assert!(VectorStore::contains(&h.vectors.inner, &id).unwrap());

    let frank = CallerScope::user("frank");
    assert!(h.engine.forget(&id, &frank, None).await.unwrap());
    assert!(h.engine.get(&id, &frank, None, None).await.unwrap().is_none());
    assert!(!VectorStore::contains(&h.vectors.inner, &id).unwrap());
    assert!(h.engine.orphans().await.unwrap().is_empty());
}

#[tokio::test]
async fn forget_refuses_superseded_fact_until_head_is_gone() {
    let h = harness();
    let e = &h.engine;
    let acme = e
        .store("Alice works at Acme", slot("alice", "works_at", "Acme"), user("alice"))
        .await
        .unwrap()
        .id
        .unwrap();
    let beta = e
        .store("Alice works at Beta", slot("alice", "works_at", "Beta"), user("alice"))
        .await
        .unwrap()
        .id
        .unwrap();
    let alice = CallerScope::user("alice");

    let err = e.forget(&acme, &alice, None).await.unwrap_err();
    assert!(matches!(
        err,
        MemoryError::Store(RecollectError::StillReferenced { .. })
    ));
    assert!(h.engine.orphans().await.unwrap().is_empty());

    assert!(e.forget(&beta, &alice, None).await.unwrap());
    let old = FactStore::get(&h.facts, &acme, &ReadOptions::default()).unwrap().unwrap();
    assert!(old.superseded_by.is_none());
    assert!(e.forget(&acme, &alice, None).await.unwrap());
}

#[tokio::test]
async fn failed_vector_delete_is_completed_by_reconcile() {
    let h = harness();
    let id = h
        .engine
        .store("Gina collects stamps", FactAttributes::default(), ScopeParams::global())
        .await
        .unwrap()
        .id
        .unwrap();

    h.vectors.fail_writes.store(true, Ordering::SeqCst);
    assert!(h.engine.forget(&id, &CallerScope::default(), None).await.unwrap());
    assert_eq!(h.engine.orphans().await.unwrap().len(), 1);

    h.vectors.fail_writes.store(false, Ordering::SeqCst);
    let report = h.engine.reconcile_orphans().await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(!VectorStore::contains(&h.vectors.inner, &id).unwrap());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stores_on_unrelated_facts() {
    let h = harness();
    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&h.engine);
        tasks.push(tokio::spawn(async move {
            engine
                .store(
                    &format!("sensor{i} reported reading{i} from zone{i}"),
                    FactAttributes::default(),
                    ScopeParams::global(),
                )
                .await
        }));
    }
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.action, StoreAction::Added);
        assert!(outcome.vector_indexed);
    }
    assert_eq!(h.facts.len().unwrap(), 16);
    assert_eq!(h.vectors.inner.len().unwrap(), 16);
    assert!(h.engine.orphans().await.unwrap().is_empty());
}
