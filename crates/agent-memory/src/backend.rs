//! Storage backends behind the engine.
//!
//! The structured store is the source of truth; the vector store is a
//! derived index the engine can rebuild by re-embedding fact text. Both sit
//! behind async traits so a remote or test implementation can stand in for
//! the embedded redb stores. The embedded stores are synchronous, so their
//! adapters run each call on tokio's blocking pool, keeping backend timeouts
//! effective.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recollect::{
    CallerScope, Fact, FactId, FactStore, InsertOptions, Inserted, ReadOptions, RecollectError,
    Scope, ScoredFact, SearchOptions, VectorFilter, VectorHit, VectorRecord, VectorStore, Wal,
    WalEntry, WalOp, WalStats, WalToken,
};

type Result<T> = recollect::Result<T>;

/// Canonical fact storage.
#[async_trait]
pub trait StructuredBackend: Send + Sync {
    async fn insert(&self, fact: Fact, opts: InsertOptions) -> Result<Inserted>;

    async fn get(&self, id: &FactId, opts: ReadOptions) -> Result<Option<Fact>>;

    async fn get_many(&self, ids: &[FactId]) -> Result<HashMap<FactId, Fact>>;

    async fn search(&self, query: &str, limit: usize, opts: SearchOptions) -> Result<Vec<ScoredFact>>;

    async fn lookup(
        &self,
        entity: &str,
        key: Option<&str>,
        tag: Option<&str>,
        opts: SearchOptions,
    ) -> Result<Vec<ScoredFact>>;

    async fn delete(&self, id: &FactId) -> Result<bool>;

    async fn supersede(&self, old: &FactId, new: Option<&FactId>, at: DateTime<Utc>) -> Result<()>;

    async fn history(&self, id: &FactId) -> Result<Vec<Fact>>;

    async fn find_current_by_text(&self, text: &str, scope: &Scope) -> Result<Option<Fact>>;

    async fn superseded_texts(&self, caller: Option<&CallerScope>) -> Result<HashSet<String>>;

    async fn record_access(&self, ids: &[FactId], at: DateTime<Utc>) -> Result<()>;
}

/// Similarity index over fact embeddings.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn store(&self, record: VectorRecord) -> Result<()>;

    /// `filter` is applied before the `limit` cut, so one tenant's hits are
    /// never crowded out by another's.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>>;

    async fn delete(&self, id: &FactId) -> Result<bool>;

    async fn has_duplicate(&self, vector: &[f32], filter: &VectorFilter) -> Result<bool>;

    async fn contains(&self, id: &FactId) -> Result<bool>;
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RecollectError::Internal(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl StructuredBackend for Arc<FactStore> {
    async fn insert(&self, fact: Fact, opts: InsertOptions) -> Result<Inserted> {
        let store = Arc::clone(self);
        blocking(move || FactStore::insert_with(&store, fact, &opts)).await
    }

    async fn get(&self, id: &FactId, opts: ReadOptions) -> Result<Option<Fact>> {
        let store = Arc::clone(self);
        let id = id.clone();
        blocking(move || FactStore::get(&store, &id, &opts)).await
    }

    async fn get_many(&self, ids: &[FactId]) -> Result<HashMap<FactId, Fact>> {
        let store = Arc::clone(self);
        let ids = ids.to_vec();
        blocking(move || FactStore::get_many(&store, &ids)).await
    }

    async fn search(&self, query: &str, limit: usize, opts: SearchOptions) -> Result<Vec<ScoredFact>> {
        let store = Arc::clone(self);
        let query = query.to_string();
        blocking(move || FactStore::search(&store, &query, limit, &opts)).await
    }

    async fn lookup(
        &self,
        entity: &str,
        key: Option<&str>,
        tag: Option<&str>,
        opts: SearchOptions,
    ) -> Result<Vec<ScoredFact>> {
        let store = Arc::clone(self);
        let entity = entity.to_string();
        let key = key.map(str::to_string);
        let tag = tag.map(str::to_string);
        blocking(move || {
            FactStore::lookup(&store, &entity, key.as_deref(), tag.as_deref(), &opts)
        })
        .await
    }

    async fn delete(&self, id: &FactId) -> Result<bool> {
        let store = Arc::clone(self);
        let id = id.clone();
        blocking(move || FactStore::delete(&store, &id)).await
    }

    async fn supersede(&self, old: &FactId, new: Option<&FactId>, at: DateTime<Utc>) -> Result<()> {
        let store = Arc::clone(self);
        let old = old.clone();
        let new = new.cloned();
        blocking(move || FactStore::supersede(&store, &old, new.as_ref(), at)).await
    }

    async fn history(&self, id: &FactId) -> Result<Vec<Fact>> {
        let store = Arc::clone(self);
        let id = id.clone();
        blocking(move || FactStore::history(&store, &id)).await
    }

    async fn find_current_by_text(&self, text: &str, scope: &Scope) -> Result<Option<Fact>> {
        let store = Arc::clone(self);
        let text = text.to_string();
        let scope = scope.clone();
        blocking(move || FactStore::find_current_by_text(&store, &text, &scope)).await
    }

    async fn superseded_texts(&self, caller: Option<&CallerScope>) -> Result<HashSet<String>> {
        let store = Arc::clone(self);
        let caller = caller.cloned();
        blocking(move || FactStore::superseded_texts(&store, caller.as_ref())).await
    }

    async fn record_access(&self, ids: &[FactId], at: DateTime<Utc>) -> Result<()> {
        let store = Arc::clone(self);
        let ids = ids.to_vec();
        blocking(move || FactStore::record_access(&store, &ids, at)).await
    }
}

#[async_trait]
impl VectorBackend for Arc<VectorStore> {
    async fn store(&self, record: VectorRecord) -> Result<()> {
        let store = Arc::clone(self);
        blocking(move || VectorStore::store(&store, record)).await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        let store = Arc::clone(self);
        let vector = vector.to_vec();
        let filter = filter.clone();
        blocking(move || VectorStore::search(&store, &vector, limit, min_score, &filter)).await
    }

    async fn delete(&self, id: &FactId) -> Result<bool> {
        let store = Arc::clone(self);
        let id = id.clone();
        blocking(move || VectorStore::delete(&store, &id)).await
    }

    async fn has_duplicate(&self, vector: &[f32], filter: &VectorFilter) -> Result<bool> {
        let store = Arc::clone(self);
        let vector = vector.to_vec();
        let filter = filter.clone();
        blocking(move || VectorStore::has_duplicate(&store, &vector, &filter)).await
    }

    async fn contains(&self, id: &FactId) -> Result<bool> {
        let store = Arc::clone(self);
        let id = id.clone();
        blocking(move || VectorStore::contains(&store, &id)).await
    }
}

/// The write-ahead log with its file I/O moved onto the blocking pool.
///
/// Journal failures never fail the caller: a write that cannot be scheduled
/// gets a synthetic token, the same as one the breaker refused.
#[derive(Clone)]
pub(crate) struct Journal(Arc<Wal>);

impl Journal {
    pub(crate) fn new(wal: Wal) -> Self {
        Self(Arc::new(wal))
    }

    pub(crate) async fn write(&self, op: WalOp, fact_id: &FactId, fact: Option<&Fact>) -> WalToken {
        if !self.0.is_active() {
            return WalToken::synthetic();
        }
        let wal = Arc::clone(&self.0);
        let fact_id = fact_id.clone();
        let fact = fact.cloned();
        match blocking(move || Ok(wal.write(op, &fact_id, fact.as_ref()))).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "WAL write task failed; continuing unjournalled");
                WalToken::synthetic()
            }
        }
    }

    pub(crate) async fn remove(&self, token: &WalToken) {
        if token.is_synthetic() {
            return;
        }
        let wal = Arc::clone(&self.0);
        let token = token.clone();
        let task_token = token.clone();
        if let Err(e) = blocking(move || {
            wal.remove(&task_token);
            Ok(())
        })
        .await
        {
            tracing::warn!(token = %token, error = %e, "WAL remove task failed");
        }
    }

    pub(crate) async fn scan_orphans(&self) -> Result<Vec<WalEntry>> {
        let wal = Arc::clone(&self.0);
        blocking(move || wal.scan_orphans()).await
    }

    /// For construction paths that are synchronous already.
    pub(crate) fn scan_orphans_now(&self) -> Result<Vec<WalEntry>> {
        self.0.scan_orphans()
    }

    pub(crate) fn stats(&self) -> WalStats {
        self.0.stats()
    }

    pub(crate) fn dir(&self) -> &Path {
        self.0.dir()
    }
}
