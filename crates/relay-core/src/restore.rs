//! Restore pass: put the source locators back into the record store.
//!
//! Driven purely by the migration ledger. For every `ok` row the documents
//! referencing the destination locator (or carrying the asset id) have the
//! source locator written back. Re-running it changes nothing further.

use crate::config::FieldSet;
use crate::error::Result;
use crate::ledger::{read_migration_ledger, LedgerWriter, ReconciliationRow, RESTORE_NOTES_PREFIX};
use crate::models::{ExecutionMode, MatchStrategy, PassSummary};
use crate::reconcile::strategy::replace_locator;
use crate::reconcile::{
    apply_document_patch, scope_collections, DocumentMatch, ReconcileReport, ReconcileScope,
    ReconcileTarget,
};
use crate::store::{Filter, Patch, RecordStore};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Query for documents that reference the destination locator.
pub fn restore_filter(target: &ReconcileTarget, fields: &FieldSet) -> Filter {
    let mut any = vec![Filter::eq(fields.external_id.as_str(), target.id.as_str())];
    for field in fields.locator_fields() {
        any.push(Filter::contains(field, target.new_locator.as_str()));
    }
    any.push(Filter::contains(fields.content.as_str(), target.new_locator.as_str()));
    Filter::Any(any)
}

fn revert_string(value: &str, target: &ReconcileTarget) -> Option<String> {
    let reverted = replace_locator(value, &target.new_locator, &target.old_locator);
    (reverted != value).then_some(reverted)
}

/// Changes that write the source locator back.
pub fn build_restore_patch(body: &Value, target: &ReconcileTarget, fields: &FieldSet) -> Patch {
    let mut patch = Patch::new();
    let mut referenced = false;

    for field in fields.locator_fields() {
        match body.get(field) {
            Some(Value::String(s)) => {
                if let Some(reverted) = revert_string(s, target) {
                    patch.insert(field.to_string(), Value::String(reverted));
                    referenced = true;
                }
            }
            Some(Value::Array(items)) => {
                let mut modified = false;
                let reverted: Vec<Value> = items
                    .iter()
                    .map(|v| match v.as_str().and_then(|s| revert_string(s, target)) {
                        Some(r) => {
                            modified = true;
                            Value::String(r)
                        }
                        None => v.clone(),
                    })
                    .collect();
                if modified {
                    patch.insert(field.to_string(), Value::Array(reverted));
                    referenced = true;
                }
            }
            _ => {}
        }
    }

    if let Some(content) = body.get(&fields.content).and_then(Value::as_str) {
        if let Some(reverted) = revert_string(content, target) {
            patch.insert(fields.content.clone(), Value::String(reverted));
            referenced = true;
        }
    }

    if !referenced {
        patch.insert(
            fields.primary.clone(),
            Value::String(target.old_locator.clone()),
        );
    }

    patch.retain(|field, value| body.get(field) != Some(value));
    patch
}

/// Strategy recorded for a restored document.
fn restore_strategy(body: &Value, target: &ReconcileTarget, fields: &FieldSet) -> MatchStrategy {
    if Filter::eq(fields.external_id.as_str(), target.id.as_str()).matches(body) {
        MatchStrategy::ExactId
    } else if fields
        .locator_fields()
        .any(|f| Filter::eq(f, target.new_locator.as_str()).matches(body))
    {
        MatchStrategy::ExactUrl
    } else {
        MatchStrategy::ContentScan
    }
}

pub struct RestorePass {
    store: Arc<dyn RecordStore>,
    fields: FieldSet,
    mode: ExecutionMode,
    scope: ReconcileScope,
}

impl RestorePass {
    pub fn new(
        store: Arc<dyn RecordStore>,
        fields: FieldSet,
        mode: ExecutionMode,
        scope: ReconcileScope,
    ) -> Self {
        Self {
            store,
            fields,
            mode,
            scope,
        }
    }

    /// Restore a single asset.
    pub async fn restore_one(&self, target: &ReconcileTarget) -> Result<ReconcileReport> {
        let store = self.store.as_ref();
        let collections = scope_collections(store, &self.scope).await?;
        let filter = restore_filter(target, &self.fields);

        let mut matches = Vec::new();
        for collection in &collections {
            let docs = match store.find_by_filter(collection, &filter).await {
                Ok(docs) => docs,
                Err(e) if self.scope == ReconcileScope::AllCollections => {
                    warn!("Skipping collection {}: {}", collection, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for doc in docs {
                let strategy = restore_strategy(&doc.body, target, &self.fields);
                let patch = build_restore_patch(&doc.body, target, &self.fields);
                debug!("restore {} in {}/{} via {}", target.id, collection, doc.id, strategy);
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

        Ok(ReconcileReport {
            asset_id: target.id.clone(),
            collections,
            matches,
        })
    }

    fn rows_for(&self, report: &ReconcileReport) -> Vec<ReconciliationRow> {
        let mut rows = match &self.scope {
            ReconcileScope::Collection(name) => vec![report.ledger_row(name)],
            ReconcileScope::AllCollections => report.ledger_rows(),
        };
        for row in &mut rows {
            row.notes = format!("{};{}", RESTORE_NOTES_PREFIX, row.notes);
        }
        rows
    }

    /// Restore every `ok` row of the migration ledger.
    pub async fn run(
        &self,
        migration_ledger: &Path,
        out: &LedgerWriter<ReconciliationRow>,
    ) -> Result<PassSummary> {
        let rows = read_migration_ledger(migration_ledger)?;
        let mut summary = PassSummary::default();

        for row in rows.iter().filter(|r| {
            r.is_ok() && !r.source_locator.is_empty() && !r.destination_locator.is_empty()
        }) {
            summary.rows_considered += 1;
            let target = ReconcileTarget::from(row);

            match self.restore_one(&target).await {
                Ok(report) => {
                    summary.docs_found += report.docs_found();
                    summary.docs_updated += report.docs_updated();
                    for ledger_row in self.rows_for(&report) {
                        out.append(&ledger_row)?;
                    }
                }
                Err(e) => {
                    warn!("Restore of {} failed: {}", row.identifier, e);
                    out.append(&ReconciliationRow {
                        identifier: row.identifier.clone(),
                        collection: String::new(),
                        docs_found: 0,
                        docs_updated: 0,
                        notes: format!("{};error={}", RESTORE_NOTES_PREFIX, e),
                    })?;
                }
            }
        }

        info!(
            "Restore complete: {} rows, {} docs found, {} restored ({})",
            summary.rows_considered, summary.docs_found, summary.docs_updated, self.mode
        );
        Ok(summary)
    }
}
