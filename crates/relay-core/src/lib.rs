//! Asset Relay - Headless library for migrating hosted assets between
//! storage providers and reconciling the references a record store keeps to
//! them.
//!
//! A run enumerates the source provider, copies every asset to the
//! destination under the same identifier, records each outcome in an
//! append-only CSV ledger, and rewrites matching documents in the record
//! store. The ledger drives the follow-up passes: repair, restore and host
//! rewrite.
//!
//! # Example
//!
//! ```rust,ignore
//! use asset_relay::{ExecutionMode, MigrationPipeline, RunConfig};
//!
//! #[tokio::main]
//! async fn main() -> asset_relay::Result<()> {
//!     let config = RunConfig {
//!         mode: ExecutionMode::Preview,
//!         ..RunConfig::default()
//!     };
//!     config.validate_for_migration()?;
//!
//!     let pipeline = MigrationPipeline::builder(config).build().await?;
//!     let summary = pipeline.migrate().await?;
//!     println!(
//!         "{} transferred, {} failed, {} documents updated",
//!         summary.transfer.succeeded, summary.transfer.failed, summary.docs_updated
//!     );
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod enumerate;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod repair;
pub mod restore;
pub mod retry;
pub mod rewrite;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::{FieldSet, HostRewrite, RecordStoreTarget, RunConfig};
pub use enumerate::Enumerator;
pub use error::{RelayError, Result};
pub use ledger::{
    read_migration_ledger, read_reconciliation_ledger, LedgerSchema, LedgerWriter, MigrationRow,
    ReconciliationRow, RunLock,
};
pub use models::{
    AssetDescriptor, AssetKind, AssetState, ExecutionMode, MatchStrategy, PassSummary,
    TransferOutcome, TransferStatus,
};
pub use pipeline::{connect_record_store, MigrationPipeline, MigrationPipelineBuilder, RunSummary};
pub use reconcile::{
    DocumentMatch, MatchOutcome, ReconcileReport, ReconcileScope, ReconcileTarget, Reconciler,
};
pub use repair::RepairPass;
pub use restore::RestorePass;
pub use retry::{Backoff, RetryPolicy};
pub use rewrite::RewritePass;
pub use store::{
    CloudCredentials, CloudinaryStore, DestinationStore, Document, Filter, MemoryDestination,
    MemoryRecordStore, MemorySource, RecordStore, SourceStore, SqliteRecordStore,
};
pub use transfer::{OutcomeSink, TransferExecutor, TransferSummary};
