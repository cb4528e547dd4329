//! Vector store: similarity search over fact embeddings.
//!
//! The store owns no canonical state. Every entry can be rebuilt from the
//! structured store by re-embedding the fact text, so it is safe for this
//! index to lag behind supersession or deletion; readers hydrate hits from
//! the structured store and drop what no longer qualifies.
//!
//! Embeddings are persisted in their own redb file (raw little-endian f32
//! bytes) and mirrored into an in-memory flat index that is rebuilt on open.
//! Each entry carries the scope of its fact so searches can be restricted to
//! one tenant before the top-k cut.
//!
//! # Complexity
//! - `insert`: O(n) for the replace check
//! - `remove`: O(n) swap-remove
//! - `search`: O(n·d) where d is the embedding dimension
//!
//! When corpora grow to tens of thousands of entries an HNSW index should
//! replace the flat scan.

use std::sync::{Mutex, MutexGuard};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::fact::FactId;
use crate::scope::{scope_visible, CallerScope, Scope};
use crate::{RecollectError, Result};

/// Raw little-endian f32 bytes keyed by fact id.
const EMBEDDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");

/// Text the embedding was computed from, keyed by fact id.
const EMBEDDING_TEXT: TableDefinition<&str, &str> = TableDefinition::new("embedding_text");

/// JSON-encoded [`Scope`] of the fact, keyed by fact id.
const EMBEDDING_SCOPE: TableDefinition<&str, &str> = TableDefinition::new("embedding_scope");

/// Single-row metadata table. Key `"dim"` stores the established dimension.
const EMBEDDING_META: TableDefinition<&str, u64> = TableDefinition::new("embedding_meta");

/// Cosine similarity at or above which two embeddings count as duplicates.
pub const DEFAULT_DUPLICATE_THRESHOLD: f32 = 0.95;

#[derive(Debug, Clone)]
struct Entry {
    id: FactId,
    text: String,
    scope: Scope,
    embedding: Vec<f32>,
}

/// Which entries a search may return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VectorFilter {
    #[default]
    Any,
    /// Entries stored under exactly this scope.
    Scope(Scope),
    /// Entries the caller may see: global plus the caller's own scopes.
    VisibleTo(CallerScope),
}

impl VectorFilter {
    pub fn admits(&self, scope: &Scope) -> bool {
        match self {
            VectorFilter::Any => true,
            VectorFilter::Scope(s) => s == scope,
            VectorFilter::VisibleTo(caller) => scope_visible(scope, caller),
        }
    }
}

/// Flat in-memory index keyed by [`FactId`].
#[derive(Debug, Default, Clone)]
pub struct VectorIndex {
    entries: Vec<Entry>,
    /// Set on first insert; later inserts are validated against it.
    dim: Option<usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the embedding for `id`.
    pub fn insert(
        &mut self,
        id: FactId,
        text: String,
        scope: Scope,
        embedding: Vec<f32>,
    ) -> Result<()> {
        self.check_dim(&embedding)?;
        if self.dim.is_none() {
            self.dim = Some(embedding.len());
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.embedding = embedding;
            entry.text = text;
            entry.scope = scope;
        } else {
            self.entries.push(Entry {
                id,
                text,
                scope,
                embedding,
            });
        }
        Ok(())
    }

    /// Remove the entry for `id`. Returns whether it was present.
    pub fn remove(&mut self, id: &FactId) -> bool {
        match self.entries.iter().position(|e| &e.id == id) {
            Some(pos) => {
                self.entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Top-`k` entries admitted by `filter` with a cosine similarity of at
    /// least `min_score`, most similar first.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> Vec<(FactId, String, f32)> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let query_norm = l2_norm(query);
        if query_norm == 0.0 || !query_norm.is_finite() {
            return Vec::new();
        }

        let mut scored: Vec<(FactId, String, f32)> = self
            .entries
            .iter()
            .filter(|e| filter.admits(&e.scope))
            .map(|e| {
                let score = cosine_similarity(query, &e.embedding, query_norm);
                (e.id.clone(), e.text.clone(), score)
            })
            .filter(|(_, _, score)| *score >= min_score)
            .collect();

        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    /// Highest similarity of any admitted entry to `query`.
    pub fn best_score(&self, query: &[f32], filter: &VectorFilter) -> Option<f32> {
        let query_norm = l2_norm(query);
        if query_norm == 0.0 || !query_norm.is_finite() {
            return None;
        }
        self.entries
            .iter()
            .filter(|e| filter.admits(&e.scope))
            .map(|e| cosine_similarity(query, &e.embedding, query_norm))
            .max_by(|a, b| a.total_cmp(b))
    }

    pub fn contains(&self, id: &FactId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub(crate) fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        check_components(embedding)?;
        match self.dim {
            Some(d) if d != embedding.len() => Err(RecollectError::InvalidEmbedding(format!(
                "embedding dimension mismatch: expected {d}, got {}",
                embedding.len()
            ))),
            _ => Ok(()),
        }
    }
}

/// A record handed to [`VectorStore::store`].
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: FactId,
    pub text: String,
    /// Scope of the fact, used by [`VectorFilter`].
    pub scope: Scope,
    pub vector: Vec<f32>,
}

/// One similarity hit. Scores are cosine similarities in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: FactId,
    pub text: String,
    pub score: f32,
}

/// Persisted vector index.
///
/// The redb tables are the source of truth; the in-memory [`VectorIndex`] is
/// rebuilt from them on open and updated only after a successful commit.
pub struct VectorStore {
    db: Database,
    index: Mutex<VectorIndex>,
    duplicate_threshold: f32,
}

impl VectorStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    /// Override the similarity used by [`VectorStore::has_duplicate`].
    pub fn with_duplicate_threshold(mut self, threshold: f32) -> Self {
        self.duplicate_threshold = threshold;
        self
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(EMBEDDINGS)?;
            write_txn.open_table(EMBEDDING_TEXT)?;
            write_txn.open_table(EMBEDDING_SCOPE)?;
            write_txn.open_table(EMBEDDING_META)?;
            write_txn.commit()?;
        }
        let index = Self::rebuild_index(&db)?;
        tracing::debug!(entries = index.len(), "vector index rebuilt");
        Ok(Self {
            db,
            index: Mutex::new(index),
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
        })
    }

    fn rebuild_index(db: &Database) -> Result<VectorIndex> {
        let mut idx = VectorIndex::new();
        let read_txn = db.begin_read()?;
        let emb_table = read_txn.open_table(EMBEDDINGS)?;
        let text_table = read_txn.open_table(EMBEDDING_TEXT)?;
        let scope_table = read_txn.open_table(EMBEDDING_SCOPE)?;

        for entry in emb_table.iter()? {
            let (key, value) = entry?;
            let fact_id = FactId(key.value().to_string());
            let embedding = decode_embedding(&fact_id, value.value())?;
            let text = text_table
                .get(key.value())?
                .map(|g| g.value().to_string())
                .unwrap_or_default();
            let scope = match scope_table.get(key.value())? {
                Some(g) => serde_json::from_str(g.value())?,
                None => Scope::Global,
            };
            if let Err(e) = idx.insert(fact_id.clone(), text, scope, embedding) {
                tracing::warn!(id = %fact_id, error = %e, "skipping unusable stored embedding");
            }
        }

        Ok(idx)
    }

    /// Persist an embedding and add it to the in-memory index.
    ///
    /// The dimension check-and-set, the embedding bytes and the text are
    /// written in one transaction; redb serialises writers, so two first
    /// inserts cannot establish different dimensions.
    pub fn store(&self, record: VectorRecord) -> Result<()> {
        let VectorRecord {
            id,
            text,
            scope,
            vector,
        } = record;
        check_components(&vector)?;
        let scope_json = serde_json::to_string(&scope)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(EMBEDDING_META)?;
            let stored_dim: Option<u64> = meta.get("dim")?.map(|g| g.value());
            match stored_dim {
                None => {
                    meta.insert("dim", vector.len() as u64)?;
                }
                Some(d) if d as usize != vector.len() => {
                    return Err(RecollectError::InvalidEmbedding(format!(
                        "embedding dimension mismatch: expected {d}, got {}",
                        vector.len()
                    )));
                }
                Some(_) => {}
            }
        }
        {
            let bytes: Vec<u8> = vector.iter().flat_map(|x| x.to_le_bytes()).collect();
            let mut emb_table = write_txn.open_table(EMBEDDINGS)?;
            emb_table.insert(id.as_str(), bytes.as_slice())?;
            let mut text_table = write_txn.open_table(EMBEDDING_TEXT)?;
            text_table.insert(id.as_str(), text.as_str())?;
            let mut scope_table = write_txn.open_table(EMBEDDING_SCOPE)?;
            scope_table.insert(id.as_str(), scope_json.as_str())?;
        }
        write_txn.commit()?;

        // A crash between commit and here is repaired by the rebuild on open.
        self.lock()?.insert(id, text, scope, vector)
    }

    /// Top `limit` hits admitted by `filter` with similarity of at least `min_score`.
    pub fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f32,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        let idx = self.lock()?;
        if let Some(d) = idx.dim() {
            if vector.len() != d {
                return Err(RecollectError::InvalidEmbedding(format!(
                    "query dimension mismatch: index has dim {d}, query has {}",
                    vector.len()
                )));
            }
        }
        Ok(idx
            .search(vector, limit, min_score, filter)
            .into_iter()
            .map(|(id, text, score)| VectorHit { id, text, score })
            .collect())
    }

    /// Remove the embedding for `id`. Returns whether one existed.
    pub fn delete(&self, id: &FactId) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut emb_table = write_txn.open_table(EMBEDDINGS)?;
            let existed = emb_table.remove(id.as_str())?.is_some();
            let mut text_table = write_txn.open_table(EMBEDDING_TEXT)?;
            text_table.remove(id.as_str())?;
            let mut scope_table = write_txn.open_table(EMBEDDING_SCOPE)?;
            scope_table.remove(id.as_str())?;
            existed
        };
        write_txn.commit()?;
        self.lock()?.remove(id);
        Ok(existed)
    }

    /// Is any admitted embedding at least `duplicate_threshold` similar to `vector`?
    pub fn has_duplicate(&self, vector: &[f32], filter: &VectorFilter) -> Result<bool> {
        let idx = self.lock()?;
        if let Some(d) = idx.dim() {
            if vector.len() != d {
                return Err(RecollectError::InvalidEmbedding(format!(
                    "query dimension mismatch: index has dim {d}, query has {}",
                    vector.len()
                )));
            }
        }
        Ok(idx
            .best_score(vector, filter)
            .is_some_and(|best| best >= self.duplicate_threshold))
    }

    pub fn contains(&self, id: &FactId) -> Result<bool> {
        Ok(self.lock()?.contains(id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    pub fn duplicate_threshold(&self) -> f32 {
        self.duplicate_threshold
    }

    fn lock(&self) -> Result<MutexGuard<'_, VectorIndex>> {
        self.index
            .lock()
            .map_err(|_| RecollectError::Internal("vector index lock poisoned".into()))
    }
}

fn decode_embedding(fact_id: &FactId, bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(RecollectError::Storage(format!(
            "corrupt embedding for fact {fact_id}: byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Non-empty and every component finite. A NaN would outrank every real
/// score under `total_cmp`.
fn check_components(embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(RecollectError::InvalidEmbedding(
            "embedding must not be empty".into(),
        ));
    }
    if let Some(pos) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(RecollectError::InvalidEmbedding(format!(
            "embedding component {pos} is not finite"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Math helpers
// ---------------------------------------------------------------------------

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with a pre-computed norm for `a`.
///
/// Returns `0.0` on length mismatch or when `b` is the zero vector.
fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_id() -> FactId {
        FactId::new()
    }

    fn record(id: &FactId, text: &str, vector: Vec<f32>) -> VectorRecord {
        scoped(id, text, Scope::Global, vector)
    }

    fn scoped(id: &FactId, text: &str, scope: Scope, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.clone(),
            text: text.to_string(),
            scope,
            vector,
        }
    }

    const ANY: VectorFilter = VectorFilter::Any;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        let norm = l2_norm(&v);
        assert!((cosine_similarity(&v, &v, norm) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_and_opposite_vectors() {
        let a = vec![1.0f32, 0.0];
        let norm_a = l2_norm(&a);
        assert!(cosine_similarity(&a, &[0.0, 1.0], norm_a).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0], norm_a) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0], norm_a), 0.0);
    }

    #[test]
    fn index_insert_replaces_existing_id() {
        let mut idx = VectorIndex::new();
        let id = new_id();
        idx.insert(id.clone(), "a".into(), Scope::Global, vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(id.clone(), "b".into(), Scope::Global, vec![0.0, 1.0, 0.0]).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn index_rejects_empty_and_mismatched_embeddings() {
        let mut idx = VectorIndex::new();
        assert!(idx.insert(new_id(), String::new(), Scope::Global, vec![]).is_err());
        idx.insert(new_id(), String::new(), Scope::Global, vec![1.0, 0.0]).unwrap();
        let err = idx.insert(new_id(), String::new(), Scope::Global, vec![1.0, 0.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, RecollectError::InvalidEmbedding(_)));
    }

    #[test]
    fn index_remove_reports_presence() {
        let mut idx = VectorIndex::new();
        let id = new_id();
        idx.insert(id.clone(), String::new(), Scope::Global, vec![1.0, 0.0]).unwrap();
        assert!(!idx.remove(&new_id()));
        assert!(idx.remove(&id));
        assert!(idx.is_empty());
    }

    #[test]
    fn index_search_orders_and_truncates() {
        let mut idx = VectorIndex::new();
        let ids: Vec<FactId> = (0..3).map(|_| new_id()).collect();
        idx.insert(ids[0].clone(), "x".into(), Scope::Global, vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(ids[1].clone(), "y".into(), Scope::Global, vec![0.0, 1.0, 0.0]).unwrap();
        idx.insert(ids[2].clone(), "z".into(), Scope::Global, vec![-1.0, 0.0, 0.0]).unwrap();

        let all = idx.search(&[1.0, 0.0, 0.0], 3, -1.0, &ANY);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, ids[0]);
        assert_eq!(all[1].0, ids[1]);
        assert_eq!(all[2].0, ids[2]);

        let top = idx.search(&[1.0, 0.0, 0.0], 1, -1.0, &ANY);
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn index_search_applies_min_score() {
        let mut idx = VectorIndex::new();
        let close = new_id();
        idx.insert(close.clone(), "close".into(), Scope::Global, vec![1.0, 0.1]).unwrap();
        idx.insert(new_id(), "far".into(), Scope::Global, vec![0.0, 1.0]).unwrap();

        let hits = idx.search(&[1.0, 0.0], 10, 0.5, &ANY);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, close);
    }

    #[test]
    fn index_search_zero_query_returns_empty() {
        let mut idx = VectorIndex::new();
        idx.insert(new_id(), String::new(), Scope::Global, vec![1.0, 0.0]).unwrap();
        assert!(idx.search(&[0.0, 0.0], 5, -1.0, &ANY).is_empty());
        assert!(idx.search(&[1.0, 0.0], 0, -1.0, &ANY).is_empty());
    }

    #[test]
    fn store_search_and_delete() {
        let store = VectorStore::open_in_memory().unwrap();
        let a = new_id();
        let b = new_id();
        store.store(record(&a, "rust", vec![1.0, 0.0])).unwrap();
        store.store(record(&b, "python", vec![0.0, 1.0])).unwrap();

        let hits = store.search(&[1.0, 0.0], 5, 0.5, &ANY).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a);
        assert_eq!(hits[0].text, "rust");

        assert!(store.delete(&a).unwrap());
        assert!(!store.delete(&a).unwrap());
        assert!(store.search(&[1.0, 0.0], 5, 0.5, &ANY).unwrap().is_empty());
    }

    #[test]
    fn store_rejects_dimension_mismatch_and_keeps_index_intact() {
        let store = VectorStore::open_in_memory().unwrap();
        store.store(record(&new_id(), "a", vec![1.0, 0.0, 0.0])).unwrap();

        let err = store.store(record(&new_id(), "b", vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, RecollectError::InvalidEmbedding(_)));
        assert_eq!(store.len().unwrap(), 1);

        let err = store.search(&[1.0, 0.0], 5, 0.0, &ANY).unwrap_err();
        assert!(matches!(err, RecollectError::InvalidEmbedding(_)));
    }

    #[test]
    fn has_duplicate_uses_threshold() {
        let store = VectorStore::open_in_memory()
            .unwrap()
            .with_duplicate_threshold(0.99);
        assert!(!store.has_duplicate(&[1.0, 0.0], &ANY).unwrap());

        store.store(record(&new_id(), "a", vec![1.0, 0.0])).unwrap();
        assert!(store.has_duplicate(&[2.0, 0.0], &ANY).unwrap());
        assert!(!store.has_duplicate(&[1.0, 1.0], &ANY).unwrap());
    }

    #[test]
    fn embeddings_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");
        let rust = new_id();

        {
            let store = VectorStore::open(&path).unwrap();
            store.store(record(&rust, "rust", vec![1.0, 0.0, 0.0])).unwrap();
            store
                .store(record(&new_id(), "python", vec![0.0, 1.0, 0.0]))
                .unwrap();
        }

        let store = VectorStore::open(&path).unwrap();
        let hits = store.search(&[1.0, 0.0, 0.0], 2, -1.0, &ANY).unwrap();
        assert_eq!(hits.len(), 2, "both embeddings must survive reopen");
        assert_eq!(hits[0].id, rust);
        assert_eq!(hits[0].text, "rust");
    }

    #[test]
    fn store_rejects_non_finite_components() {
        let store = VectorStore::open_in_memory().unwrap();
        for bad in [vec![f32::NAN, 1.0], vec![f32::INFINITY, 0.0]] {
            let err = store.store(record(&new_id(), "bad", bad)).unwrap_err();
            assert!(matches!(err, RecollectError::InvalidEmbedding(_)));
        }
        assert!(store.is_empty().unwrap());

        store.store(record(&new_id(), "ok", vec![1.0, 0.0])).unwrap();
        assert!(store.has_duplicate(&[1.0, 0.0], &ANY).unwrap());
        assert!(!store.has_duplicate(&[f32::NAN, 0.0], &ANY).unwrap());
    }

    #[test]
    fn scope_filter_applies_before_the_top_k_cut() {
        let store = VectorStore::open_in_memory().unwrap();
        for i in 0..20 {
            let scope = Scope::User(format!("user-{i}"));
            store
                .store(scoped(&new_id(), "coffee", scope, vec![1.0, 0.0]))
                .unwrap();
        }
        let alice = new_id();
        let alice_scope = Scope::User("alice".into());
        store
            .store(scoped(&alice, "coffee", alice_scope.clone(), vec![0.9, 0.1]))
            .unwrap();

        let unfiltered = store.search(&[1.0, 0.0], 5, 0.5, &ANY).unwrap();
        assert!(unfiltered.iter().all(|h| h.id != alice));

        let exact = store
            .search(&[1.0, 0.0], 5, 0.5, &VectorFilter::Scope(alice_scope.clone()))
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].id, alice);

        let visible = VectorFilter::VisibleTo(CallerScope::user("alice"));
        let hits = store.search(&[1.0, 0.0], 5, 0.5, &visible).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, alice);

        let other = VectorFilter::Scope(Scope::User("bob".into()));
        assert!(!store.has_duplicate(&[1.0, 0.0], &other).unwrap());
        assert!(store
            .has_duplicate(&[1.0, 0.0], &VectorFilter::Scope(Scope::User("user-3".into())))
            .unwrap());
    }

    #[test]
    fn scopes_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");
        let id = new_id();
        {
            let store = VectorStore::open(&path).unwrap();
            store
                .store(scoped(&id, "tea", Scope::Session("s1".into()), vec![1.0, 0.0]))
                .unwrap();
        }

        let store = VectorStore::open(&path).unwrap();
        let mine = VectorFilter::VisibleTo(CallerScope::session("s1"));
        let theirs = VectorFilter::VisibleTo(CallerScope::session("s2"));
        assert_eq!(store.search(&[1.0, 0.0], 5, 0.0, &mine).unwrap().len(), 1);
        assert!(store.search(&[1.0, 0.0], 5, 0.0, &theirs).unwrap().is_empty());
    }
}
