//! Lexical ranking over a candidate set of facts.
//!
//! Builds an in-RAM tantivy index per query over exactly the facts the caller
//! is allowed to see, so temporal and scope filtering happen before ranking
//! and never leak through BM25 statistics of hidden facts.

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser};
use tantivy::schema::{Field, Schema, TantivyDocument, Value as TantivyValueTrait, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexWriter, Term};

use crate::fact::{Fact, FactId};
use crate::Result;

const WRITER_HEAP_BYTES: usize = 50_000_000;

struct SearchIndex {
    index: Index,
    id_field: Field,
    content_field: Field,
}

/// Rank `facts` against `query`. Highest score first, at most `limit` hits.
///
/// Falls back to a fuzzy (edit distance 1) match when the parsed query finds
/// nothing, so short typo-heavy queries still hit.
pub(crate) fn rank(facts: &[Fact], query: &str, limit: usize) -> Result<Vec<(FactId, f32)>> {
    if query.trim().is_empty() || limit == 0 || facts.is_empty() {
        return Ok(Vec::new());
    }

    let SearchIndex {
        index,
        id_field,
        content_field,
    } = build_index(facts)?;
    let reader = index.reader()?;
    let searcher = reader.searcher();

    // Fact text is free-form; lenient parsing keeps stray `:` or quotes from
    // turning a recall into an error.
    let parser = QueryParser::for_index(&index, vec![content_field]);
    let (parsed, _errors) = parser.parse_query_lenient(query);
    let mut top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

    if top_docs.is_empty() {
        let fuzzy = fuzzy_query(query, content_field);
        top_docs = searcher.search(&fuzzy, &TopDocs::with_limit(limit))?;
    }

    let mut ranked = Vec::with_capacity(top_docs.len());
    for (score, addr) in top_docs {
        let retrieved = searcher.doc::<TantivyDocument>(addr)?;
        if let Some(id) = retrieved.get_first(id_field).and_then(|v| v.as_str()) {
            ranked.push((FactId::from(id), score));
        }
    }
    Ok(ranked)
}

fn build_index(facts: &[Fact]) -> Result<SearchIndex> {
    let mut schema_builder = Schema::builder();
    let id_field = schema_builder.add_text_field("id", STRING | STORED);
    let content_field = schema_builder.add_text_field("content", TEXT);
    let index = Index::create_in_ram(schema_builder.build());
    let mut writer: IndexWriter = index.writer(WRITER_HEAP_BYTES)?;

    for fact in facts {
        writer.add_document(doc!(
            id_field => fact.id.0.clone(),
            content_field => searchable_content(fact),
        ))?;
    }

    writer.commit()?;
    Ok(SearchIndex {
        index,
        id_field,
        content_field,
    })
}

/// Text plus the structured decomposition and tags, so `entity`/`key` hits
/// rank even when the prose phrases them differently.
fn searchable_content(fact: &Fact) -> String {
    let mut parts: Vec<&str> = vec![fact.text.as_str()];
    parts.extend(fact.entity.as_deref());
    parts.extend(fact.value.as_deref());
    parts.extend(fact.tags.iter().map(String::as_str));

    let mut content = parts.join(" ");
    // "favourite_color" should match "favourite color".
    if let Some(key) = &fact.key {
        content.push(' ');
        content.push_str(&key.replace('_', " "));
    }
    content
}

fn fuzzy_query(query: &str, content_field: Field) -> BooleanQuery {
    let terms: Vec<(Occur, Box<dyn Query>)> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| {
            let term = Term::from_field_text(content_field, &token.to_lowercase());
            (
                Occur::Should,
                Box::new(FuzzyTermQuery::new(term, 1, true)) as Box<dyn Query>,
            )
        })
        .collect();
    BooleanQuery::new(terms)
}
