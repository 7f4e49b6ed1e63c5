//! Host rewrite pass.
//!
//! Replaces an old host prefix with a new one in every string of every
//! document, descending into arrays and nested objects, and optionally
//! collapses a doubled folder segment left behind by earlier uploads.

use crate::config::HostRewrite;
use crate::error::Result;
use crate::ledger::{LedgerWriter, ReconciliationRow};
use crate::models::{ExecutionMode, PassSummary};
use crate::reconcile::{apply_document_patch, scope_collections, MatchOutcome, ReconcileScope};
use crate::store::{Patch, RecordStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

fn rewrite_str(s: &str, rewrite: &HostRewrite) -> String {
    let mut out = if rewrite.old_host.is_empty() {
        s.to_string()
    } else {
        s.replace(&rewrite.old_host, &rewrite.new_host)
    };
    if let Some(folder) = rewrite.collapse_folder.as_deref().filter(|f| !f.is_empty()) {
        let doubled = format!("/{0}/{0}/", folder);
        let single = format!("/{}/", folder);
        while out.contains(&doubled) {
            out = out.replace(&doubled, &single);
        }
    }
    out
}

/// Rewritten copy of `value`.
pub fn rewrite_value(value: &Value, rewrite: &HostRewrite) -> Value {
    match value {
        Value::String(s) => Value::String(rewrite_str(s, rewrite)),
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_value(v, rewrite)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_value(v, rewrite)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Top-level fields whose rewritten value differs.
pub fn rewrite_patch(body: &Value, rewrite: &HostRewrite) -> Patch {
    let Some(object) = body.as_object() else {
        return Patch::new();
    };
    object
        .iter()
        .filter_map(|(field, value)| {
            let rewritten = rewrite_value(value, rewrite);
            (rewritten != *value).then(|| (field.clone(), rewritten))
        })
        .collect()
}

pub struct RewritePass {
    store: Arc<dyn RecordStore>,
    rewrite: HostRewrite,
    mode: ExecutionMode,
    scope: ReconcileScope,
}

impl RewritePass {
    pub fn new(
        store: Arc<dyn RecordStore>,
        rewrite: HostRewrite,
        mode: ExecutionMode,
        scope: ReconcileScope,
    ) -> Self {
        Self {
            store,
            rewrite,
            mode,
            scope,
        }
    }

    /// Rewrite every document in scope; one ledger row per changed document.
    pub async fn run(&self, out: &LedgerWriter<ReconciliationRow>) -> Result<PassSummary> {
        let store = self.store.as_ref();
        let mut summary = PassSummary::default();
        info!(
            "Rewriting {} -> {} ({})",
            self.rewrite.old_host, self.rewrite.new_host, self.mode
        );

        for collection in scope_collections(store, &self.scope).await? {
            let docs = match store.scan(&collection).await {
                Ok(docs) => docs,
                Err(e) if self.scope == ReconcileScope::AllCollections => {
                    warn!("Skipping collection {}: {}", collection, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for doc in docs {
                summary.rows_considered += 1;
                let patch = rewrite_patch(&doc.body, &self.rewrite);
                if patch.is_empty() {
                    continue;
                }
                summary.docs_found += 1;

                let outcome =
                    apply_document_patch(store, &collection, &doc, &patch, self.mode).await;
                let updated = outcome.counts_as_updated();
                if updated {
                    summary.docs_updated += 1;
                }

                let fields = patch.keys().cloned().collect::<Vec<_>>().join("|");
                let notes = match outcome {
                    MatchOutcome::NotApplied => format!("{};not_applied", fields),
                    MatchOutcome::Failed(e) => format!("{};failed={}", fields, e),
                    _ => fields,
                };
                out.append(&ReconciliationRow {
                    identifier: doc.id.clone(),
                    collection: collection.clone(),
                    docs_found: 1,
                    docs_updated: u64::from(updated),
                    notes,
                })?;
            }
        }

        info!(
            "Rewrite complete: {} scanned, {} to change, {} updated",
            summary.rows_considered, summary.docs_found, summary.docs_updated
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::read_reconciliation_ledger;
    use crate::store::MemoryRecordStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn hosts() -> HostRewrite {
        HostRewrite {
            old_host: "res.example.com/old".to_string(),
            new_host: "res.example.com/new".to_string(),
            collapse_folder: Some("jmn".to_string()),
        }
    }

    #[test]
    fn test_rewrite_nested_and_collapse() {
        let body = json!({
            "image": "https://res.example.com/old/jmn/jmn/a.jpg",
            "meta": {"thumbs": ["https://res.example.com/old/t.jpg", 3]},
            "title": "unchanged",
        });
        let patch = rewrite_patch(&body, &hosts());
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["image"], "https://res.example.com/new/jmn/a.jpg");
        assert_eq!(
            patch["meta"],
            json!({"thumbs": ["https://res.example.com/new/t.jpg", 3]})
        );
    }

    #[tokio::test]
    async fn test_pass_writes_rows_and_converges() {
        let tmp = TempDir::new().unwrap();
        let out = LedgerWriter::open(tmp.path().join("rewrite.csv")).unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        store
            .insert(
                "news",
                "1",
                json!({"image": "https://res.example.com/old/a.jpg", "content": "x"}),
            )
            .unwrap();
        store.insert("news", "2", json!({"image": "https://other/b.jpg"})).unwrap();

        let pass = RewritePass::new(
            store.clone(),
            hosts(),
            ExecutionMode::Apply,
            ReconcileScope::Collection("news".into()),
        );
        let first = pass.run(&out).await.unwrap();
        assert_eq!(first.rows_considered, 2);
        assert_eq!(first.docs_updated, 1);
        assert_eq!(
            store.get("news", "1").unwrap().body["image"],
            "https://res.example.com/new/a.jpg"
        );

        let second = pass.run(&out).await.unwrap();
        assert_eq!(second.docs_found, 0);

        let rows = read_reconciliation_ledger(out.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, "1");
        assert_eq!(rows[0].notes, "image");
    }
}
