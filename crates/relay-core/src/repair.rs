//! Repair pass for transferred assets whose references were never updated.
//!
//! Selects migration ledger rows with status `ok` and zero downstream
//! updates, and reconciles each one against every collection. Running it
//! again against a consistent store updates nothing.

use crate::config::FieldSet;
use crate::error::Result;
use crate::ledger::{read_migration_ledger, LedgerWriter, ReconciliationRow};
use crate::models::{ExecutionMode, PassSummary};
use crate::reconcile::{ReconcileScope, ReconcileTarget, Reconciler};
use crate::store::RecordStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RepairPass {
    reconciler: Reconciler,
}

impl RepairPass {
    pub fn new(store: Arc<dyn RecordStore>, fields: FieldSet, mode: ExecutionMode) -> Self {
        Self {
            reconciler: Reconciler::new(store, fields, mode),
        }
    }

    /// Repair every eligible row of `migration_ledger`, appending results to `out`.
    pub async fn run(
        &self,
        migration_ledger: &Path,
        out: &LedgerWriter<ReconciliationRow>,
    ) -> Result<PassSummary> {
        let rows = read_migration_ledger(migration_ledger)?;
        let to_fix: Vec<_> = rows.iter().filter(|r| r.needs_repair()).collect();
        info!(
            "Repair: {} of {} ledger rows need attention",
            to_fix.len(),
            rows.len()
        );

        let mut summary = PassSummary::default();
        for row in to_fix {
            summary.rows_considered += 1;
            let target = ReconcileTarget::from(row);

            match self
                .reconciler
                .reconcile(&target, &ReconcileScope::AllCollections)
                .await
            {
                Ok(report) => {
                    summary.docs_found += report.docs_found();
                    summary.docs_updated += report.docs_updated();
                    for ledger_row in report.ledger_rows() {
                        out.append(&ledger_row)?;
                    }
                    info!(
                        "Repaired {}: found {}, updated {}",
                        row.identifier,
                        report.docs_found(),
                        report.docs_updated()
                    );
                }
                Err(e) => {
                    warn!("Repair of {} failed: {}", row.identifier, e);
                    out.append(&ReconciliationRow {
                        identifier: row.identifier.clone(),
                        collection: String::new(),
                        docs_found: 0,
                        docs_updated: 0,
                        notes: format!("error={}", e),
                    })?;
                }
            }
        }

        info!(
            "Repair complete: {} rows, {} docs found, {} updated ({})",
            summary.rows_considered,
            summary.docs_found,
            summary.docs_updated,
            self.reconciler.mode()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{read_reconciliation_ledger, MigrationRow};
    use crate::models::TransferStatus;
    use crate::store::MemoryRecordStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn migration_row(id: &str, status: TransferStatus, docs: i64) -> MigrationRow {
        MigrationRow {
            identifier: id.to_string(),
            source_locator: format!("https://old/{}.jpg", id),
            destination_locator: format!("https://new/{}.jpg", id),
            status,
            error: String::new(),
            downstream_docs_updated: docs,
        }
    }

    #[tokio::test]
    async fn test_repair_selects_only_pending_rows_and_converges() {
        let tmp = TempDir::new().unwrap();
        let mig_path = tmp.path().join("migration.csv");
        let rec_path = tmp.path().join("repair.csv");

        let mig = LedgerWriter::<MigrationRow>::open(&mig_path).unwrap();
        mig.append(&migration_row("img-a", TransferStatus::Ok, 0)).unwrap();
        mig.append(&migration_row("img-b", TransferStatus::Ok, 2)).unwrap();
        mig.append(&migration_row("img-c", TransferStatus::Failed, 0)).unwrap();
        mig.append(&migration_row("img-d", TransferStatus::Ok, 0)).unwrap();

        let store = Arc::new(MemoryRecordStore::new());
        store
            .insert("events", "e1", json!({"gallery": ["https://old/img-a.jpg"]}))
            .unwrap();
        store.insert("news", "n1", json!({"image": "https://old/img-b.jpg"})).unwrap();

        let pass = RepairPass::new(store.clone(), FieldSet::default(), ExecutionMode::Apply);
        let out = LedgerWriter::open(&rec_path).unwrap();

        let first = pass.run(&mig_path, &out).await.unwrap();
        assert_eq!(first.rows_considered, 2);
        assert_eq!(first.docs_updated, 1);
        assert_eq!(
            store.get("events", "e1").unwrap().body["gallery"],
            json!(["https://new/img-a.jpg"])
        );
        assert_eq!(store.get("news", "n1").unwrap().body["image"], "https://old/img-b.jpg");

        let second = pass.run(&mig_path, &out).await.unwrap();
        assert_eq!(second.docs_updated, 0);

        let rows = read_reconciliation_ledger(&rec_path).unwrap();
        assert_eq!(rows[0].identifier, "img-a");
        assert_eq!(rows[0].collection, "events");
        assert_eq!(rows[1].identifier, "img-d");
        assert_eq!(rows[1].notes, "no_match");
    }
}
