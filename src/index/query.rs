//! Query construction for whole-file document search, including the
//! `"*"` match-all convention.

use tantivy::query::{AllQuery, BooleanQuery, BoostQuery, Occur, Query, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::Term;

use super::schema::DocumentFields;

/// Tokenizes `raw_query` the same way the index's `code` tokenizer would,
/// splitting on whitespace as a stand-in for full analysis (the index
/// itself applies the registered tokenizer to indexed text; queries only
/// need term boundaries here).
fn split_terms(raw_query: &str) -> Vec<String> {
    raw_query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

/// Builds the query for a text search, boosting filename matches over
/// directory matches over body content. `"*"` means match-all.
pub fn build_document_query(
    raw_query: &str,
    fields: &DocumentFields,
    language_filter: Option<&str>,
) -> Box<dyn Query> {
    let mut subqueries: Vec<(Occur, Box<dyn Query>)> = Vec::new();

    if let Some(lang) = language_filter {
        let term = Term::from_field_text(fields.language, lang);
        subqueries.push((
            Occur::Must,
            Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
        ));
    }

    if raw_query.trim() == "*" {
        if subqueries.is_empty() {
            return Box::new(AllQuery);
        }
        subqueries.push((Occur::Must, Box::new(AllQuery)));
        return Box::new(BooleanQuery::new(subqueries));
    }

    let terms = split_terms(raw_query);
    let mut term_clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

    for term in &terms {
        let filename_term = Term::from_field_text(fields.filename_text, term);
        term_clauses.push((
            Occur::Should,
            Box::new(BoostQuery::new(
                Box::new(TermQuery::new(filename_term, IndexRecordOption::Basic)),
                3.0,
            )),
        ));

        let directory_term = Term::from_field_text(fields.directory_text, term);
        term_clauses.push((
            Occur::Should,
            Box::new(BoostQuery::new(
                Box::new(TermQuery::new(directory_term, IndexRecordOption::Basic)),
                1.5,
            )),
        ));

        let content_term = Term::from_field_text(fields.content, term);
        term_clauses.push((
            Occur::Should,
            Box::new(TermQuery::new(content_term, IndexRecordOption::Basic)),
        ));
    }

    // Nested so at least one term must match; a bare Should list at the top
    // level becomes optional once a Must filter is present.
    subqueries.push((Occur::Must, Box::new(BooleanQuery::new(term_clauses))));
    Box::new(BooleanQuery::new(subqueries))
}
