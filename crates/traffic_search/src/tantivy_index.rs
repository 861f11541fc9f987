//! Tantivy-based secondary index.
//!
//! Each record kind gets its own RAM index whose schema follows the kind's
//! search fields:
//! - `id`: i64, indexed and fast, used for upsert/delete and id ordering
//! - `doc`: the stored [`SearchDocument`] as JSON, never searched
//! - `<field>`: trigram tokenized, for fuzzy (substring) lookups
//! - `<field>_exact`: the whole lowercased value as one term, for exact and
//!   prefix lookups
//!
//! Writes commit immediately and reload the reader, so a document is
//! visible to the next search once `upsert` returns.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use strum::IntoEnumIterator;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{
    AllQuery, BooleanQuery, FuzzyTermQuery, Occur, Query, RegexQuery, TermQuery,
};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, INDEXED, STORED,
};
use tantivy::tokenizer::{LowerCaser, NgramTokenizer, RawTokenizer, TextAnalyzer};
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, Searcher, TantivyDocument,
    Term,
};

use traffic_core::document::SearchDocument;
use traffic_core::ports::{IndexError, IndexHits, SearchIndex};
use traffic_core::records::search_fields;
use traffic_core::types::{EntityKind, FieldFilter, MatchMode, RecordQuery, SearchField};

/// Trigram tokenizer for substring search.
const NGRAM_TOKENIZER: &str = "ngram3";
/// Whole-value, lowercased tokenizer for exact and prefix search.
const EXACT_TOKENIZER: &str = "raw_lower";

const ID_FIELD: &str = "id";
const DOC_FIELD: &str = "doc";

/// Per-writer heap. Tantivy's floor is 15 MB per indexing thread.
const WRITER_HEAP_BYTES: usize = 20_000_000;

/// Deepest `offset + limit` served from the index. `TopDocs` allocates for
/// the whole window, so deeper pages are left to the primary store.
pub const MAX_RESULT_WINDOW: usize = 10_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Index for a single record kind.
struct KindIndex {
    kind: EntityKind,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    id_field: Field,
    doc_field: Field,
    /// Search field name → trigram field
    ngram_fields: HashMap<&'static str, Field>,
    /// Search field name → whole-value field
    exact_fields: HashMap<&'static str, Field>,
}

impl KindIndex {
    fn new(kind: EntityKind, fields: &'static [SearchField]) -> Result<Self, IndexError> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_i64_field(ID_FIELD, INDEXED | STORED | FAST);
        let doc_field = schema_builder.add_text_field(DOC_FIELD, STORED);

        let ngram_opts = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(NGRAM_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );
        let exact_opts = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(EXACT_TOKENIZER)
                .set_index_option(IndexRecordOption::Basic),
        );

        let mut ngram_fields = HashMap::new();
        let mut exact_fields = HashMap::new();
        for field in fields {
            if field.mode == MatchMode::Fuzzy {
                let ngram = schema_builder.add_text_field(field.name, ngram_opts.clone());
                ngram_fields.insert(field.name, ngram);
            }
            let exact =
                schema_builder.add_text_field(&format!("{}_exact", field.name), exact_opts.clone());
            exact_fields.insert(field.name, exact);
        }

        let index = Index::create_in_ram(schema_builder.build());

        let ngram = NgramTokenizer::new(3, 3, false)
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;
        index.tokenizers().register(
            NGRAM_TOKENIZER,
            TextAnalyzer::builder(ngram).filter(LowerCaser).build(),
        );
        index.tokenizers().register(
            EXACT_TOKENIZER,
            TextAnalyzer::builder(RawTokenizer::default())
                .filter(LowerCaser)
                .build(),
        );

        let writer = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e: tantivy::TantivyError| IndexError::Unavailable(e.to_string()))?;

        Ok(Self {
            kind,
            reader,
            writer: Mutex::new(writer),
            id_field,
            doc_field,
            ngram_fields,
            exact_fields,
        })
    }

    fn id_term(&self, id: i64) -> Term {
        Term::from_field_i64(self.id_field, id)
    }

    fn to_tantivy(&self, document: &SearchDocument) -> Result<TantivyDocument, IndexError> {
        let json =
            serde_json::to_string(document).map_err(|e| IndexError::Write(e.to_string()))?;
        let mut doc = TantivyDocument::default();
        doc.add_i64(self.id_field, document.id);
        doc.add_text(self.doc_field, &json);
        for (name, value) in &document.fields {
            let value = value.to_lowercase();
            if let Some(field) = self.ngram_fields.get(name.as_str()) {
                doc.add_text(*field, &value);
            }
            if let Some(field) = self.exact_fields.get(name.as_str()) {
                doc.add_text(*field, &value);
            }
        }
        Ok(doc)
    }

    /// Apply `apply` under the writer lock, then commit and make the result
    /// searchable.
    fn write<F>(&self, apply: F) -> Result<(), IndexError>
    where
        F: FnOnce(&mut IndexWriter) -> Result<(), IndexError>,
    {
        let mut writer = lock(&self.writer);
        if let Err(e) = apply(&mut writer) {
            if let Err(rollback) = writer.rollback() {
                tracing::warn!(kind = %self.kind, error = %rollback, "index rollback failed");
            }
            return Err(e);
        }
        writer
            .commit()
            .map_err(|e| IndexError::Write(e.to_string()))?;
        self.reader
            .reload()
            .map_err(|e| IndexError::Write(e.to_string()))
    }

    fn upsert(&self, documents: &[SearchDocument]) -> Result<(), IndexError> {
        self.write(|writer| {
            for document in documents {
                writer.delete_term(self.id_term(document.id));
                writer
                    .add_document(self.to_tantivy(document)?)
                    .map_err(|e| IndexError::Write(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn load(&self, searcher: &Searcher, address: DocAddress) -> Result<SearchDocument, IndexError> {
        let doc: TantivyDocument = searcher
            .doc(address)
            .map_err(|e| IndexError::Query(e.to_string()))?;
        let json = doc
            .get_first(self.doc_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| IndexError::Query("stored document missing".into()))?;
        serde_json::from_str(json).map_err(|e| IndexError::Query(e.to_string()))
    }

    fn get(&self, id: i64) -> Result<Option<SearchDocument>, IndexError> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(self.id_term(id), IndexRecordOption::Basic);
        let top = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(|e| IndexError::Query(e.to_string()))?;
        match top.first() {
            Some((_, address)) => self.load(&searcher, *address).map(Some),
            None => Ok(None),
        }
    }

    fn search(&self, query: &RecordQuery) -> Result<IndexHits, IndexError> {
        let window = query.page.offset().saturating_add(query.page.limit());
        if window > MAX_RESULT_WINDOW {
            return Err(IndexError::Query(format!(
                "result window {window} exceeds {MAX_RESULT_WINDOW}"
            )));
        }
        let tantivy_query = self.build_query(&query.filters)?;
        let searcher = self.reader.searcher();
        let collector = (
            Count,
            TopDocs::with_limit(query.page.limit())
                .and_offset(query.page.offset())
                .order_by_fast_field::<i64>(ID_FIELD, Order::Asc),
        );
        let (total, top) = searcher
            .search(&tantivy_query, &collector)
            .map_err(|e| IndexError::Query(e.to_string()))?;

        let documents = top
            .into_iter()
            .map(|(_, address)| self.load(&searcher, address))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IndexHits {
            documents,
            total: total as u64,
        })
    }

    fn build_query(&self, filters: &[FieldFilter]) -> Result<Box<dyn Query>, IndexError> {
        if filters.is_empty() {
            return Ok(Box::new(AllQuery));
        }
        let mut clauses = Vec::with_capacity(filters.len());
        for filter in filters {
            let exact_field = *self
                .exact_fields
                .get(filter.field.as_str())
                .ok_or_else(|| IndexError::Query(format!("{} is not searchable", filter.field)))?;
            let value = filter.value.trim().to_lowercase();
            let clause: Box<dyn Query> = match filter.mode {
                MatchMode::Exact => Box::new(TermQuery::new(
                    Term::from_field_text(exact_field, &value),
                    IndexRecordOption::Basic,
                )),
                MatchMode::Prefix => {
                    if value.is_empty() {
                        continue;
                    }
                    Box::new(FuzzyTermQuery::new_prefix(
                        Term::from_field_text(exact_field, &value),
                        0,
                        true,
                    ))
                }
                MatchMode::Fuzzy => {
                    if value.is_empty() {
                        continue;
                    }
                    match self.ngram_fields.get(filter.field.as_str()) {
                        Some(ngram) => fuzzy_query(*ngram, exact_field, &value)?,
                        None => substring_query(exact_field, &value)?,
                    }
                }
            };
            clauses.push((Occur::Must, clause));
        }
        if clauses.is_empty() {
            return Ok(Box::new(AllQuery));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn clear(&self) -> Result<(), IndexError> {
        self.write(|writer| {
            writer
                .delete_all_documents()
                .map(|_| ())
                .map_err(|e| IndexError::Write(e.to_string()))
        })
    }
}

/// Substring lookup on the whole trimmed input, whitespace included. Every
/// trigram of the input must be indexed for the document, and the
/// whole value must contain the input. Inputs shorter than one trigram only
/// scan the whole-value terms.
fn fuzzy_query(
    ngram_field: Field,
    exact_field: Field,
    input: &str,
) -> Result<Box<dyn Query>, IndexError> {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() < 3 {
        return substring_query(exact_field, input);
    }
    let grams: BTreeSet<String> = chars.windows(3).map(|w| w.iter().collect()).collect();
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = grams
        .iter()
        .map(|gram| {
            let term = TermQuery::new(
                Term::from_field_text(ngram_field, gram),
                IndexRecordOption::Basic,
            );
            (Occur::Must, Box::new(term) as Box<dyn Query>)
        })
        .collect();
    clauses.push((Occur::Must, substring_query(exact_field, input)?));
    Ok(Box::new(BooleanQuery::new(clauses)))
}

fn substring_query(field: Field, input: &str) -> Result<Box<dyn Query>, IndexError> {
    let pattern = format!(".*{}.*", escape_regex(input));
    RegexQuery::from_pattern(&pattern, field)
        .map(|q| Box::new(q) as Box<dyn Query>)
        .map_err(|e| IndexError::Query(e.to_string()))
}

fn escape_regex(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if "\\.+*?()|[]{}^$#&-~".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Secondary index covering every record kind.
pub struct TantivySearchIndex {
    kinds: HashMap<EntityKind, KindIndex>,
}

impl TantivySearchIndex {
    pub fn new() -> Result<Self, IndexError> {
        let kinds = EntityKind::iter()
            .map(|kind| KindIndex::new(kind, search_fields(kind)).map(|idx| (kind, idx)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        tracing::info!(kinds = kinds.len(), "tantivy index ready");
        Ok(Self { kinds })
    }

    fn kind(&self, kind: EntityKind) -> Result<&KindIndex, IndexError> {
        self.kinds
            .get(&kind)
            .ok_or_else(|| IndexError::Unavailable(format!("no index for {kind}")))
    }

    /// Documents currently searchable for `kind`.
    pub fn len(&self, kind: EntityKind) -> u64 {
        self.kinds
            .get(&kind)
            .map_or(0, |idx| idx.reader.searcher().num_docs())
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.keys().all(|kind| self.len(*kind) == 0)
    }
}

#[async_trait]
impl SearchIndex for TantivySearchIndex {
    async fn upsert(&self, document: SearchDocument) -> Result<(), IndexError> {
        self.kind(document.kind)?.upsert(std::slice::from_ref(&document))
    }

    async fn upsert_many(&self, documents: Vec<SearchDocument>) -> Result<(), IndexError> {
        let mut by_kind: HashMap<EntityKind, Vec<SearchDocument>> = HashMap::new();
        for document in documents {
            by_kind.entry(document.kind).or_default().push(document);
        }
        for (kind, documents) in by_kind {
            self.kind(kind)?.upsert(&documents)?;
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> Result<(), IndexError> {
        let index = self.kind(kind)?;
        index.write(|writer| {
            writer.delete_term(index.id_term(id));
            Ok(())
        })
    }

    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<SearchDocument>, IndexError> {
        self.kind(kind)?.get(id)
    }

    async fn search(&self, kind: EntityKind, query: &RecordQuery) -> Result<IndexHits, IndexError> {
        self.kind(kind)?.search(query)
    }

    async fn clear(&self, kind: EntityKind) -> Result<(), IndexError> {
        self.kind(kind)?.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use traffic_core::types::PageRequest;

    fn offense(id: i64, number: &str, location: &str, driver: i64) -> SearchDocument {
        let fields = BTreeMap::from([
            ("offenseNumber".to_string(), number.to_string()),
            ("offenseLocation".to_string(), location.to_string()),
            ("driverId".to_string(), driver.to_string()),
            ("processStatus".to_string(), "Unprocessed".to_string()),
        ]);
        SearchDocument {
            kind: EntityKind::Offense,
            id,
            fields,
            body: json!({
                "offenseId": id,
                "offenseNumber": number,
                "offenseLocation": location,
                "driverId": driver,
            }),
        }
    }

    async fn seeded() -> TantivySearchIndex {
        let index = TantivySearchIndex::new().unwrap();
        index
            .upsert_many(vec![
                offense(3, "OF-2024-0003", "South Ring Road", 7),
                offense(1, "OF-2024-0001", "Ring Road North", 7),
                offense(2, "OF-2023-0002", "Harbour Bridge", 8),
            ])
            .await
            .unwrap();
        index
    }

    fn ids(hits: &IndexHits) -> Vec<i64> {
        hits.documents.iter().map(|d| d.id).collect()
    }

    fn query(filters: &[(&str, &str, MatchMode)]) -> RecordQuery {
        filters
            .iter()
            .fold(RecordQuery::all(PageRequest::default()), |q, (f, v, m)| {
                let field = search_fields(EntityKind::Offense)
                    .iter()
                    .find(|sf| sf.name == *f)
                    .copied()
                    .unwrap_or(SearchField::new("unknown", *m));
                q.with_filter(&field, *v)
            })
    }

    #[tokio::test]
    async fn test_get_round_trips_document() {
        let index = seeded().await;
        let doc = index.get(EntityKind::Offense, 2).await.unwrap().unwrap();
        assert_eq!(doc, offense(2, "OF-2023-0002", "Harbour Bridge", 8));
        assert!(index.get(EntityKind::Offense, 99).await.unwrap().is_none());
        assert!(index.get(EntityKind::Fine, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let index = seeded().await;
        index
            .upsert(offense(2, "OF-2023-0002", "Old Town Square", 8))
            .await
            .unwrap();
        assert_eq!(index.len(EntityKind::Offense), 3);
        let doc = index.get(EntityKind::Offense, 2).await.unwrap().unwrap();
        assert_eq!(doc.fields["offenseLocation"], "Old Town Square");
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id_and_paged() {
        let index = seeded().await;
        let all = index
            .search(EntityKind::Offense, &RecordQuery::all(PageRequest::default()))
            .await
            .unwrap();
        assert_eq!(ids(&all), vec![1, 2, 3]);
        assert_eq!(all.total, 3);

        let second = index
            .search(
                EntityKind::Offense,
                &RecordQuery::all(PageRequest::new(2, 2).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(ids(&second), vec![3]);
        assert_eq!(second.total, 3);
    }

    #[tokio::test]
    async fn test_deep_pages_are_refused() {
        let index = seeded().await;
        let deep = PageRequest::new(101, 100).unwrap();
        let err = index
            .search(EntityKind::Offense, &RecordQuery::all(deep))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Query(_)));

        let last = PageRequest::new(100, 100).unwrap();
        let hits = index
            .search(EntityKind::Offense, &RecordQuery::all(last))
            .await
            .unwrap();
        assert!(hits.documents.is_empty());
        assert_eq!(hits.total, 3);
    }

    #[tokio::test]
    async fn test_exact_match_is_case_insensitive() {
        let index = seeded().await;
        let hits = index
            .search(EntityKind::Offense, &query(&[("driverId", "7", MatchMode::Exact)]))
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 3]);

        let hits = index
            .search(
                EntityKind::Offense,
                &query(&[("processStatus", "UNPROCESSED", MatchMode::Exact)]),
            )
            .await
            .unwrap();
        assert_eq!(hits.total, 3);
    }

    #[tokio::test]
    async fn test_prefix_match() {
        let index = seeded().await;
        let hits = index
            .search(
                EntityKind::Offense,
                &query(&[("offenseNumber", "of-2024", MatchMode::Prefix)]),
            )
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fuzzy_substring_match() {
        let index = seeded().await;
        let hits = index
            .search(
                EntityKind::Offense,
                &query(&[("offenseLocation", "ring", MatchMode::Fuzzy)]),
            )
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 3]);

        let short = index
            .search(
                EntityKind::Offense,
                &query(&[("offenseLocation", "br", MatchMode::Fuzzy)]),
            )
            .await
            .unwrap();
        assert_eq!(ids(&short), vec![2]);
    }

    #[tokio::test]
    async fn test_fuzzy_matches_whole_input_like_the_store() {
        let index = seeded().await;
        for input in ["north ring", "ring road north", "RING ROAD", "road  north"] {
            let q = query(&[("offenseLocation", input, MatchMode::Fuzzy)]);
            let hits = index.search(EntityKind::Offense, &q).await.unwrap();
            let expected: Vec<i64> = [
                (1, "Ring Road North"),
                (2, "Harbour Bridge"),
                (3, "South Ring Road"),
            ]
            .iter()
            .filter(|(_, location)| q.filters[0].matches(location))
            .map(|(id, _)| *id)
            .collect();
            assert_eq!(ids(&hits), expected, "filter {input:?}");
        }
        let q = query(&[("offenseLocation", "north ring", MatchMode::Fuzzy)]);
        assert!(index.search(EntityKind::Offense, &q).await.unwrap().documents.is_empty());
        let q = query(&[("offenseLocation", "ring road", MatchMode::Fuzzy)]);
        assert_eq!(ids(&index.search(EntityKind::Offense, &q).await.unwrap()), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_filters_combine_with_and() {
        let index = seeded().await;
        let hits = index
            .search(
                EntityKind::Offense,
                &query(&[
                    ("driverId", "7", MatchMode::Exact),
                    ("offenseNumber", "OF-2024-0001", MatchMode::Prefix),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_field_is_query_error() {
        let index = seeded().await;
        let err = index
            .search(
                EntityKind::Offense,
                &query(&[("unknown", "x", MatchMode::Exact)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Query(_)));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let index = seeded().await;
        index.delete(EntityKind::Offense, 1).await.unwrap();
        assert!(index.get(EntityKind::Offense, 1).await.unwrap().is_none());
        assert_eq!(index.len(EntityKind::Offense), 2);

        index.clear(EntityKind::Offense).await.unwrap();
        assert_eq!(index.len(EntityKind::Offense), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a.b"), "a\\.b");
        assert_eq!(escape_regex("no-3"), "no\\-3");
    }
}
