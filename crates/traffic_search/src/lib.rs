//! Secondary index adapter backed by tantivy.
//!
//! One in-RAM index per record kind. Fuzzy fields are trigram-tokenized at
//! index time so substring lookups stay cheap; exact and prefix fields keep
//! the whole lowercased value as a single term.

mod tantivy_index;

pub use tantivy_index::TantivySearchIndex;
