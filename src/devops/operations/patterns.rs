//! Pattern memory: reusable notes injected into task cards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::devops::error::{EngineError, EngineResult};
use crate::devops::store::Store;

/// Scope that every search includes
pub const GLOBAL_SCOPE: &str = "global";

/// A named, scoped note with a confidence score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    /// Unique within its scope
    pub name: String,
    /// Text added to task card notes
    pub body: String,
    /// Stage name or "global"
    pub scope: String,
    /// 0.0 to 1.0
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Storage for patterns
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Patterns in `scope` (plus global) relevant to `query`, best first.
    async fn search(&self, query: &str, scope: &str) -> EngineResult<Vec<PatternRecord>>;

    /// Insert or replace by (name, scope). Returns true when the record is new.
    async fn store(&self, record: PatternRecord) -> EngineResult<bool>;
}

/// Pattern store backed by the engine database.
pub struct SqlitePatternStore {
    store: Arc<Store>,
    limit: usize,
}

impl SqlitePatternStore {
    pub fn new(store: Arc<Store>, limit: usize) -> Self {
        Self { store, limit }
    }
}

/// Count query terms (3+ chars) found in the record's name or body.
fn relevance(terms: &[String], record: &PatternRecord) -> usize {
    let name = record.name.to_lowercase();
    let body = record.body.to_lowercase();
    terms
        .iter()
        .filter(|term| name.contains(term.as_str()) || body.contains(term.as_str()))
        .count()
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[async_trait]
impl PatternStore for SqlitePatternStore {
    async fn search(&self, query: &str, scope: &str) -> EngineResult<Vec<PatternRecord>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.store.patterns_in_scopes(&[scope, GLOBAL_SCOPE])?;
        let mut scored: Vec<(usize, PatternRecord)> = candidates
            .into_iter()
            .map(|record| (relevance(&terms, &record), record))
            .filter(|(score, _)| *score > 0)
            .collect();

        // Stable sort keeps the store's confidence order within a score
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(self.limit)
            .map(|(_, record)| record)
            .collect())
    }

    async fn store(&self, record: PatternRecord) -> EngineResult<bool> {
        if record.name.trim().is_empty() {
            return Err(EngineError::config("Pattern name cannot be empty"));
        }
        if !(0.0..=1.0).contains(&record.confidence) {
            return Err(EngineError::config(format!(
                "Pattern confidence {} is outside 0.0..=1.0",
                record.confidence
            )));
        }
        let created = self.store.upsert_pattern(&record)?;
        log::info!(
            "{} pattern '{}' in scope {}",
            if created { "Stored" } else { "Updated" },
            record.name,
            record.scope
        );
        Ok(created)
    }
}

/// Render patterns as task card notes.
pub fn render_notes(patterns: &[PatternRecord]) -> String {
    patterns
        .iter()
        .map(|p| format!("- **{}** ({:.2}): {}", p.name, p.confidence, p.body.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, body: &str, scope: &str, confidence: f64) -> PatternRecord {
        PatternRecord {
            name: name.to_string(),
            body: body.to_string(),
            scope: scope.to_string(),
            confidence,
        }
    }

    #[tokio::test]
    async fn test_search_scopes_and_ranks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let patterns = SqlitePatternStore::new(store, 2);
        patterns
            .store(record("flaky-tests", "rerun flaky integration tests once", "BUILD", 0.4))
            .await
            .unwrap();
        patterns
            .store(record("lint-first", "run the linter before tests", "global", 0.9))
            .await
            .unwrap();
        patterns
            .store(record("release-notes", "update the changelog", "RELEASE", 0.9))
            .await
            .unwrap();

        let found = patterns.search("fix flaky integration tests", "BUILD").await.unwrap();
        let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["flaky-tests", "lint-first"]);

        assert!(patterns.search("changelog", "BUILD").await.unwrap().is_empty());
        assert!(patterns.search("a b", "BUILD").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_rejects_bad_records() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let patterns = SqlitePatternStore::new(store, 5);
        assert!(patterns.store(record(" ", "x", "global", 0.5)).await.is_err());
        assert!(patterns.store(record("x", "x", "global", 1.5)).await.is_err());
        assert!(patterns.store(record("x", "x", "global", 1.0)).await.unwrap());
        assert!(!patterns.store(record("x", "y", "global", 1.0)).await.unwrap());
    }

    #[test]
    fn test_render_notes() {
        let notes = render_notes(&[record("a", " body ", "global", 0.5)]);
        assert_eq!(notes, "- **a** (0.50): body");
    }
}
