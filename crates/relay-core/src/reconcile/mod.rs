//! Reference reconciliation against the record store.
//!
//! For one migrated asset, find every document that references it, classify
//! each with the first matching [`MatchStrategy`], and rewrite the reference
//! to the destination locator. Preview runs the same matching and patch
//! computation without writing.

pub mod strategy;

pub use strategy::{filename_segment, ReconcileTarget};

use crate::config::FieldSet;
use crate::error::Result;
use crate::ledger::ReconciliationRow;
use crate::models::{ExecutionMode, MatchStrategy};
use crate::store::{Document, Patch, RecordStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which collections a reconciliation scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    Collection(String),
    AllCollections,
}

/// What happened to one matched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Updated,
    /// The document already referenced the new locator; no write issued.
    AlreadyCurrent,
    /// The update matched but reported no modification.
    NotApplied,
    Previewed,
    Failed(String),
}

impl MatchOutcome {
    /// Counts towards `docs_updated`.
    pub fn counts_as_updated(&self) -> bool {
        matches!(self, MatchOutcome::Updated | MatchOutcome::Previewed)
    }
}

/// One document matched during reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMatch {
    pub collection: String,
    pub doc_id: String,
    pub strategy: MatchStrategy,
    pub fields_changed: Vec<String>,
    pub outcome: MatchOutcome,
}

/// Per-collection totals of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSummary {
    pub collection: String,
    pub docs_found: u64,
    pub docs_updated: u64,
    pub notes: String,
}

/// Result of reconciling one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub asset_id: String,
    /// Collections scanned, in scan order.
    pub collections: Vec<String>,
    /// Matches ordered by strategy priority, then scan order.
    pub matches: Vec<DocumentMatch>,
}

impl ReconcileReport {
    pub fn docs_found(&self) -> u64 {
        self.matches.len() as u64
    }

    pub fn docs_updated(&self) -> u64 {
        self.matches
            .iter()
            .filter(|m| m.outcome.counts_as_updated())
            .count() as u64
    }

    pub fn is_no_match(&self) -> bool {
        self.matches.is_empty()
    }

    /// Totals per scanned collection, including collections without matches.
    pub fn by_collection(&self) -> Vec<CollectionSummary> {
        self.collections
            .iter()
            .map(|collection| {
                let matches: Vec<&DocumentMatch> = self
                    .matches
                    .iter()
                    .filter(|m| &m.collection == collection)
                    .collect();
                CollectionSummary {
                    collection: collection.clone(),
                    docs_found: matches.len() as u64,
                    docs_updated: matches.iter().filter(|m| m.outcome.counts_as_updated()).count()
                        as u64,
                    notes: format_notes(&matches),
                }
            })
            .collect()
    }

    /// Ledger row for a single-collection reconciliation.
    pub fn ledger_row(&self, collection: &str) -> ReconciliationRow {
        let matches: Vec<&DocumentMatch> = self.matches.iter().collect();
        ReconciliationRow {
            identifier: self.asset_id.clone(),
            collection: collection.to_string(),
            docs_found: self.docs_found(),
            docs_updated: self.docs_updated(),
            notes: format_notes(&matches),
        }
    }

    /// Rows for a multi-collection pass: one per collection with matches, or
    /// a single `no_match` row with an empty collection.
    pub fn ledger_rows(&self) -> Vec<ReconciliationRow> {
        let rows: Vec<ReconciliationRow> = self
            .by_collection()
            .into_iter()
            .filter(|s| s.docs_found > 0)
            .map(|s| ReconciliationRow {
                identifier: self.asset_id.clone(),
                collection: s.collection,
                docs_found: s.docs_found,
                docs_updated: s.docs_updated,
                notes: s.notes,
            })
            .collect();
        if rows.is_empty() {
            vec![ReconciliationRow {
                identifier: self.asset_id.clone(),
                collection: String::new(),
                docs_found: 0,
                docs_updated: 0,
                notes: NO_MATCH.to_string(),
            }]
        } else {
            rows
        }
    }
}

pub const NO_MATCH: &str = "no_match";

/// `strategy=count` pairs plus non-zero outcome counters, `;`-separated.
pub fn format_notes(matches: &[&DocumentMatch]) -> String {
    if matches.is_empty() {
        return NO_MATCH.to_string();
    }

    let mut by_strategy: BTreeMap<MatchStrategy, usize> = BTreeMap::new();
    let (mut not_applied, mut already_current, mut failed) = (0, 0, 0);
    for m in matches {
        *by_strategy.entry(m.strategy).or_insert(0) += 1;
        match m.outcome {
            MatchOutcome::NotApplied => not_applied += 1,
            MatchOutcome::AlreadyCurrent => already_current += 1,
            MatchOutcome::Failed(_) => failed += 1,
            MatchOutcome::Updated | MatchOutcome::Previewed => {}
        }
    }

    let mut parts: Vec<String> = by_strategy
        .into_iter()
        .map(|(s, n)| format!("{}={}", s, n))
        .collect();
    for (label, n) in [
        ("not_applied", not_applied),
        ("already_current", already_current),
        ("failed", failed),
    ] {
        if n > 0 {
            parts.push(format!("{}={}", label, n));
        }
    }
    parts.join(";")
}

/// Write a patch (or log it in preview) and classify the result.
pub(crate) async fn apply_document_patch(
    store: &dyn RecordStore,
    collection: &str,
    doc: &Document,
    patch: &Patch,
    mode: ExecutionMode,
) -> MatchOutcome {
    if patch.is_empty() {
        return MatchOutcome::AlreadyCurrent;
    }
    if mode.is_preview() {
        debug!(
            "[preview] {}/{} would set {:?}",
            collection,
            doc.id,
            patch.keys().collect::<Vec<_>>()
        );
        return MatchOutcome::Previewed;
    }

    match store.update_by_id(collection, &doc.id, patch).await {
        Ok(res) if res.modified_count > 0 => MatchOutcome::Updated,
        Ok(res) => {
            warn!(
                "Update of {}/{} matched {} but modified nothing",
                collection, doc.id, res.matched_count
            );
            MatchOutcome::NotApplied
        }
        Err(e) => {
            warn!("Update of {}/{} failed: {}", collection, doc.id, e);
            MatchOutcome::Failed(e.to_string())
        }
    }
}

/// Resolve a scope into collection names.
pub(crate) async fn scope_collections(
    store: &dyn RecordStore,
    scope: &ReconcileScope,
) -> Result<Vec<String>> {
    match scope {
        ReconcileScope::Collection(name) => Ok(vec![name.clone()]),
        ReconcileScope::AllCollections => store.list_collections().await,
    }
}

/// Rewrites references to migrated assets.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    fields: FieldSet,
    mode: ExecutionMode,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, fields: FieldSet, mode: ExecutionMode) -> Self {
        Self { store, fields, mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Reconcile one asset across `scope`.
    ///
    /// A failed query against a single named collection is an error. With
    /// `AllCollections`, a collection that cannot be queried is skipped.
    /// Per-document update failures are recorded in the report.
    pub async fn reconcile(
        &self,
        target: &ReconcileTarget,
        scope: &ReconcileScope,
    ) -> Result<ReconcileReport> {
        let store = self.store.as_ref();
        let collections = scope_collections(store, scope).await?;
        let filter = strategy::candidate_filter(target, &self.fields);

        let mut matches = Vec::new();
        for collection in &collections {
            let docs = match store.find_by_filter(collection, &filter).await {
                Ok(docs) => docs,
                Err(e) if *scope == ReconcileScope::AllCollections => {
                    warn!("Skipping collection {}: {}", collection, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for doc in docs {
                let Some(strategy) = strategy::classify(&doc.body, target, &self.fields) else {
                    continue;
                };
                let patch = strategy::build_patch(&doc.body, strategy, target, &self.fields);
                debug!(
                    "{} matched {}/{} via {}",
                    target.id, collection, doc.id, strategy
                );
                let outcome =
                    apply_document_patch(store, collection, &doc, &patch, self.mode).await;

                matches.push(DocumentMatch {
                    collection: collection.clone(),
                    doc_id: doc.id.clone(),
                    strategy,
                    fields_changed: patch.keys().cloned().collect(),
                    outcome,
                });
            }
        }

        matches.sort_by_key(|m| m.strategy);

        let report = ReconcileReport {
            asset_id: target.id.clone(),
            collections,
            matches,
        };
        info!(
            "{} {}: found {}, updated {}",
            self.mode,
            target.id,
            report.docs_found(),
            report.docs_updated()
        );
        Ok(report)
    }
}
