//! Pipeline facade wiring configuration, stores and passes together.

use crate::config::{RecordStoreTarget, RunConfig};
use crate::enumerate::Enumerator;
use crate::error::{RelayError, Result};
use crate::ledger::{read_migration_ledger, LedgerWriter, MigrationRow, ReconciliationRow, RunLock};
use crate::models::{ExecutionMode, PassSummary, TransferOutcome};
use crate::reconcile::{ReconcileScope, ReconcileTarget, Reconciler};
use crate::repair::RepairPass;
use crate::restore::RestorePass;
use crate::rewrite::RewritePass;
use crate::store::{
    CloudinaryStore, DestinationStore, RecordStore, SourceStore, SqliteRecordStore,
};
use crate::transfer::{OutcomeSink, TransferExecutor, TransferSummary};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Totals for one migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub transfer: TransferSummary,
    pub docs_found: u64,
    pub docs_updated: u64,
    /// Transferred assets whose reconciliation raised an error.
    pub reconcile_errors: usize,
}

/// Open the record store a target points at.
pub async fn connect_record_store(target: &RecordStoreTarget) -> Result<Arc<dyn RecordStore>> {
    match target {
        RecordStoreTarget::Sqlite { path } => Ok(Arc::new(SqliteRecordStore::open(path.clone())?)),
        #[cfg(feature = "mongo")]
        RecordStoreTarget::Mongo { uri, database } => Ok(Arc::new(
            crate::store::MongoRecordStore::connect(uri, database).await?,
        )),
        #[cfg(not(feature = "mongo"))]
        RecordStoreTarget::Mongo { .. } => Err(RelayError::config(
            "MongoDB support is not compiled in (enable the `mongo` feature)",
        )),
    }
}

/// Builder for [`MigrationPipeline`].
///
/// Stores not supplied explicitly are created from the configuration:
/// Cloudinary clients for source and destination, and the configured
/// record store target.
///
/// # Example
///
/// ```rust,ignore
/// use asset_relay::{MigrationPipeline, RunConfig};
///
/// let pipeline = MigrationPipeline::builder(config).build().await?;
/// let summary = pipeline.migrate().await?;
/// ```
pub struct MigrationPipelineBuilder {
    config: RunConfig,
    source: Option<Arc<dyn SourceStore>>,
    destination: Option<Arc<dyn DestinationStore>>,
    records: Option<Arc<dyn RecordStore>>,
}

impl MigrationPipelineBuilder {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            source: None,
            destination: None,
            records: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceStore>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_destination(mut self, destination: Arc<dyn DestinationStore>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub async fn build(self) -> Result<MigrationPipeline> {
        let source = match self.source {
            Some(s) => Some(s),
            None if self.config.source.missing_parts().is_empty() => Some(Arc::new(
                CloudinaryStore::new(self.config.source.clone())?
                    .with_list_kind(self.config.source_kind),
            ) as Arc<dyn SourceStore>),
            None => None,
        };
        let destination = match self.destination {
            Some(d) => Some(d),
            None if self.config.destination.missing_parts().is_empty() => Some(Arc::new(
                CloudinaryStore::new(self.config.destination.clone())?,
            ) as Arc<dyn DestinationStore>),
            None => None,
        };
        let records = match (self.records, &self.config.record_store) {
            (Some(r), _) => Some(r),
            (None, Some(target)) => Some(connect_record_store(target).await?),
            (None, None) => None,
        };

        Ok(MigrationPipeline {
            config: Arc::new(self.config),
            source,
            destination,
            records,
        })
    }
}

/// Runs migrations and the follow-up passes for one configuration.
pub struct MigrationPipeline {
    config: Arc<RunConfig>,
    source: Option<Arc<dyn SourceStore>>,
    destination: Option<Arc<dyn DestinationStore>>,
    records: Option<Arc<dyn RecordStore>>,
}

impl MigrationPipeline {
    pub fn builder(config: RunConfig) -> MigrationPipelineBuilder {
        MigrationPipelineBuilder::new(config)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn record_store(&self) -> Result<Arc<dyn RecordStore>> {
        self.records
            .clone()
            .ok_or_else(|| RelayError::config("no record store configured"))
    }

    fn collection_scope(&self) -> ReconcileScope {
        ReconcileScope::Collection(self.config.collection.clone())
    }

    /// Enumerate, transfer and reconcile every source asset.
    ///
    /// Per-asset failures end up in the ledgers; only configuration,
    /// lock, ledger-open and enumeration errors fail the run.
    pub async fn migrate(&self) -> Result<RunSummary> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| RelayError::config("source store credentials are missing"))?;
        let destination = self
            .destination
            .clone()
            .ok_or_else(|| RelayError::config("destination store credentials are missing"))?;

        let lock = RunLock::acquire(&self.config.migration_ledger)?;
        let reconcile = match &self.records {
            Some(records) => Some(ReconcileStage {
                _lock: RunLock::acquire(&self.config.reconciliation_ledger)?,
                gate: Mutex::new(()),
                ledger: LedgerWriter::open(&self.config.reconciliation_ledger)?,
                reconciler: Reconciler::new(
                    Arc::clone(records),
                    self.config.fields.clone(),
                    self.config.mode,
                ),
                collection: self.config.collection.clone(),
            }),
            None => {
                warn!("No record store configured; references will not be reconciled");
                None
            }
        };

        let sink = Arc::new(LedgerSink {
            migration: LedgerWriter::open(&self.config.migration_ledger)?,
            reconcile,
            docs_found: AtomicU64::new(0),
            docs_updated: AtomicU64::new(0),
            reconcile_errors: AtomicUsize::new(0),
        });

        info!(
            "Starting migration run {} ({} mode, concurrency {})",
            lock.run_id(),
            self.config.mode,
            self.config.concurrency
        );

        let enumerator =
            Enumerator::new(source, self.config.page_size).with_limit(self.config.limit);
        let executor = TransferExecutor::new(
            destination,
            self.config.concurrency,
            self.config.retry.clone(),
        );
        let transfer = executor
            .run(enumerator.stream(), Arc::clone(&sink) as Arc<dyn OutcomeSink>)
            .await?;

        let summary = RunSummary {
            run_id: lock.run_id().to_string(),
            mode: self.config.mode,
            transfer,
            docs_found: sink.docs_found.load(Ordering::SeqCst),
            docs_updated: sink.docs_updated.load(Ordering::SeqCst),
            reconcile_errors: sink.reconcile_errors.load(Ordering::SeqCst),
        };
        info!(
            "Migration run {} complete: {} ok, {} failed, {} docs updated",
            summary.run_id, transfer.succeeded, transfer.failed, summary.docs_updated
        );
        Ok(summary)
    }

    /// Reconcile the `ok` rows of an existing migration ledger against the
    /// configured collection.
    pub async fn reconcile_ledger(&self, migration_ledger: &Path) -> Result<PassSummary> {
        let records = self.record_store()?;
        let _lock = RunLock::acquire(&self.config.reconciliation_ledger)?;
        let out = LedgerWriter::<ReconciliationRow>::open(&self.config.reconciliation_ledger)?;
        let reconciler = Reconciler::new(records, self.config.fields.clone(), self.config.mode);
        let scope = self.collection_scope();

        let mut summary = PassSummary::default();
        for row in read_migration_ledger(migration_ledger)?
            .iter()
            .filter(|r| r.is_ok() && !r.destination_locator.is_empty())
        {
            summary.rows_considered += 1;
            let target = ReconcileTarget::from(row);
            match reconciler.reconcile(&target, &scope).await {
                Ok(report) => {
                    summary.docs_found += report.docs_found();
                    summary.docs_updated += report.docs_updated();
                    out.append(&report.ledger_row(&self.config.collection))?;
                }
                Err(e) => {
                    warn!("Reconciliation of {} failed: {}", row.identifier, e);
                    out.append(&error_row(&row.identifier, &self.config.collection, &e))?;
                }
            }
        }
        info!(
            "Reconciled {} rows: {} docs found, {} updated",
            summary.rows_considered, summary.docs_found, summary.docs_updated
        );
        Ok(summary)
    }

    pub async fn repair(&self, migration_ledger: &Path) -> Result<PassSummary> {
        let records = self.record_store()?;
        let _lock = RunLock::acquire(&self.config.reconciliation_ledger)?;
        let out = LedgerWriter::open(&self.config.reconciliation_ledger)?;
        RepairPass::new(records, self.config.fields.clone(), self.config.mode)
            .run(migration_ledger, &out)
            .await
    }

    pub async fn restore(&self, migration_ledger: &Path) -> Result<PassSummary> {
        let records = self.record_store()?;
        let _lock = RunLock::acquire(&self.config.reconciliation_ledger)?;
        let out = LedgerWriter::open(&self.config.reconciliation_ledger)?;
        let scope = if self.config.restore_all_collections {
            ReconcileScope::AllCollections
        } else {
            self.collection_scope()
        };
        RestorePass::new(records, self.config.fields.clone(), self.config.mode, scope)
            .run(migration_ledger, &out)
            .await
    }

    /// Rewrite hosts in the configured collection, or in every collection
    /// when `all_collections` is set.
    pub async fn rewrite_hosts(&self, all_collections: bool) -> Result<PassSummary> {
        let records = self.record_store()?;
        let rewrite = self
            .config
            .host_rewrite
            .clone()
            .ok_or_else(|| RelayError::config("old and new hosts are required"))?;
        let _lock = RunLock::acquire(&self.config.reconciliation_ledger)?;
        let out = LedgerWriter::open(&self.config.reconciliation_ledger)?;
        let scope = if all_collections {
            ReconcileScope::AllCollections
        } else {
            self.collection_scope()
        };
        RewritePass::new(records, rewrite, self.config.mode, scope)
            .run(&out)
            .await
    }
}

fn error_row(identifier: &str, collection: &str, err: &RelayError) -> ReconciliationRow {
    ReconciliationRow {
        identifier: identifier.to_string(),
        collection: collection.to_string(),
        docs_found: 0,
        docs_updated: 0,
        notes: format!("error={}", err),
    }
}

struct ReconcileStage {
    _lock: RunLock,
    /// Serializes reconciliation so read-modify-write patches on a shared
    /// document never interleave.
    gate: Mutex<()>,
    ledger: LedgerWriter<ReconciliationRow>,
    reconciler: Reconciler,
    collection: String,
}

/// Reconciles each transferred asset and writes both ledger rows.
struct LedgerSink {
    migration: LedgerWriter<MigrationRow>,
    reconcile: Option<ReconcileStage>,
    docs_found: AtomicU64,
    docs_updated: AtomicU64,
    reconcile_errors: AtomicUsize,
}

#[async_trait]
impl OutcomeSink for LedgerSink {
    async fn record(&self, mut outcome: TransferOutcome) -> Result<()> {
        let Some(stage) = &self.reconcile else {
            return self.migration.append(&MigrationRow::from(&outcome));
        };
        // Held across both appends so each migration row lands after its
        // reconciliation row.
        let _turn = stage.gate.lock().await;

        if outcome.is_ok() {
            let target = ReconcileTarget::new(
                outcome.id.clone(),
                outcome.source_locator.clone(),
                outcome.dest_locator.clone(),
            );
            let scope = ReconcileScope::Collection(stage.collection.clone());

            match stage.reconciler.reconcile(&target, &scope).await {
                Ok(report) => {
                    outcome.docs_updated = report.docs_updated() as i64;
                    self.docs_found.fetch_add(report.docs_found(), Ordering::SeqCst);
                    self.docs_updated
                        .fetch_add(report.docs_updated(), Ordering::SeqCst);
                    stage.ledger.append(&report.ledger_row(&stage.collection))?;
                }
                Err(e) => {
                    warn!("Reconciliation of {} failed: {}", outcome.id, e);
                    outcome.docs_updated = -1;
                    self.reconcile_errors.fetch_add(1, Ordering::SeqCst);
                    stage
                        .ledger
                        .append(&error_row(&outcome.id, &stage.collection, &e))?;
                }
            }
        }

        self.migration.append(&MigrationRow::from(&outcome))
    }
}
