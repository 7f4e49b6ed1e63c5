//! Configuration for asset-relay.
//!
//! Constants live on unit structs grouped by concern; the per-run settings
//! are carried by `RunConfig`, built once and shared read-only.

use crate::error::{RelayError, Result};
use crate::models::{AssetKind, ExecutionMode};
use crate::retry::RetryPolicy;
use crate::store::CloudCredentials;
use std::path::PathBuf;
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    pub const USER_AGENT: &'static str = "asset-relay/0.1";
    pub const CLOUDINARY_API_BASE: &'static str = "https://api.cloudinary.com";
}

/// Transfer executor defaults.
pub struct TransferConfig;

impl TransferConfig {
    pub const DEFAULT_CONCURRENCY: usize = 6;
    pub const MAX_PAGE_SIZE: usize = 500;
    pub const DEFAULT_RETRY_LIMIT: u32 = 2;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
}

/// Ledger file defaults.
pub struct LedgerConfig;

impl LedgerConfig {
    pub const MIGRATION_LEDGER: &'static str = "migration-ledger.csv";
    pub const RECONCILIATION_LEDGER: &'static str = "reconciliation-ledger.csv";
    pub const LOCK_SUFFIX: &'static str = "lock";
}

/// Field names the reconciler inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    /// Canonical external-id field, rewritten to the asset id on every match.
    pub external_id: String,
    /// Field that receives the new locator when the match came from the
    /// external id or the content scan.
    pub primary: String,
    /// Fields that may hold a locator (string or array of strings).
    pub candidates: Vec<String>,
    /// Free-text field scanned last and patched by substring replacement.
    pub content: String,
}

impl Default for FieldSet {
    fn default() -> Self {
        Self {
            external_id: "imgId".to_string(),
            primary: "image".to_string(),
            candidates: ["image", "images", "imgId", "photo", "photos", "gallery"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            content: "content".to_string(),
        }
    }
}

impl FieldSet {
    /// Candidate fields excluding the external-id field.
    pub fn locator_fields(&self) -> impl Iterator<Item = &str> {
        self.candidates
            .iter()
            .map(String::as_str)
            .filter(move |f| *f != self.external_id)
    }
}

/// Which record store to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStoreTarget {
    Sqlite { path: PathBuf },
    Mongo { uri: String, database: String },
}

impl RecordStoreTarget {
    /// MongoDB target; without an explicit database the URI path segment is used.
    pub fn mongo(uri: impl Into<String>, database: Option<String>) -> Result<Self> {
        let uri = uri.into();
        let database = database
            .filter(|d| !d.trim().is_empty())
            .or_else(|| database_from_uri(&uri))
            .ok_or_else(|| {
                RelayError::config("unable to determine the database name; set DB_NAME")
            })?;
        Ok(RecordStoreTarget::Mongo { uri, database })
    }
}

/// Database name from the path segment of a MongoDB URI.
pub fn database_from_uri(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let name = parsed.path().trim_start_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}

/// Host rewrite settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostRewrite {
    pub old_host: String,
    pub new_host: String,
    /// Folder whose doubled segment (`/f/f/`) is collapsed to `/f/`.
    pub collapse_folder: Option<String>,
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: CloudCredentials,
    pub destination: CloudCredentials,
    pub record_store: Option<RecordStoreTarget>,
    /// Collection targeted by migrate, reconcile and restore.
    pub collection: String,
    pub fields: FieldSet,
    pub concurrency: usize,
    pub page_size: usize,
    pub retry: RetryPolicy,
    pub mode: ExecutionMode,
    pub migration_ledger: PathBuf,
    pub reconciliation_ledger: PathBuf,
    /// Resource type listed at the source store.
    pub source_kind: AssetKind,
    /// Only migrate the first N assets; `Some(0)` means no cap.
    pub limit: Option<usize>,
    /// Restore every collection instead of only `collection`.
    pub restore_all_collections: bool,
    pub host_rewrite: Option<HostRewrite>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source: CloudCredentials::default(),
            destination: CloudCredentials::default(),
            record_store: None,
            collection: "news".to_string(),
            fields: FieldSet::default(),
            concurrency: TransferConfig::DEFAULT_CONCURRENCY,
            page_size: TransferConfig::MAX_PAGE_SIZE,
            retry: RetryPolicy::default(),
            mode: ExecutionMode::Preview,
            migration_ledger: PathBuf::from(LedgerConfig::MIGRATION_LEDGER),
            reconciliation_ledger: PathBuf::from(LedgerConfig::RECONCILIATION_LEDGER),
            source_kind: AssetKind::Image,
            limit: None,
            restore_all_collections: false,
            host_rewrite: None,
        }
    }
}

impl RunConfig {
    /// Checks shared by every command.
    fn validate_common(&self) -> Result<()> {
        if self.migration_ledger.as_os_str().is_empty() {
            return Err(RelayError::config("migration ledger path is required"));
        }
        if self.reconciliation_ledger.as_os_str().is_empty() {
            return Err(RelayError::config("reconciliation ledger path is required"));
        }
        if self.migration_ledger == self.reconciliation_ledger {
            return Err(RelayError::config(
                "migration and reconciliation ledgers must be different files",
            ));
        }
        if self.fields.external_id.is_empty() || self.fields.primary.is_empty() {
            return Err(RelayError::config("external-id and primary fields are required"));
        }
        Ok(())
    }

    fn require_record_store(&self) -> Result<()> {
        if self.record_store.is_none() {
            return Err(RelayError::config(
                "a record store (SQLITE_PATH or MONGODB_URI) is required",
            ));
        }
        if self.collection.trim().is_empty() {
            return Err(RelayError::config("collection name is required"));
        }
        Ok(())
    }

    /// Validate settings needed by a migration run.
    pub fn validate_for_migration(&self) -> Result<()> {
        self.validate_common()?;

        let missing_source = self.source.missing_parts();
        if !missing_source.is_empty() {
            return Err(RelayError::config(format!(
                "missing source credentials: {}",
                missing_source.join(", ")
            )));
        }
        let missing_dest = self.destination.missing_parts();
        if !missing_dest.is_empty() {
            return Err(RelayError::config(format!(
                "missing destination credentials: {}",
                missing_dest.join(", ")
            )));
        }
        if self.concurrency == 0 {
            return Err(RelayError::config("concurrency must be at least 1"));
        }
        if self.page_size == 0 || self.page_size > TransferConfig::MAX_PAGE_SIZE {
            return Err(RelayError::config(format!(
                "page size must be between 1 and {}",
                TransferConfig::MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Validate settings needed by reconcile, repair, restore and rewrite.
    pub fn validate_for_records(&self) -> Result<()> {
        self.validate_common()?;
        self.require_record_store()
    }

    /// Validate settings needed by the host rewrite pass.
    pub fn validate_for_rewrite(&self) -> Result<()> {
        self.validate_for_records()?;
        match &self.host_rewrite {
            Some(rw) if !rw.old_host.is_empty() && !rw.new_host.is_empty() => Ok(()),
            _ => Err(RelayError::config("old and new hosts are required")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> RunConfig {
        RunConfig {
            source: CloudCredentials::new("old", "k", "s"),
            destination: CloudCredentials::new("new", "k", "s"),
            record_store: Some(RecordStoreTarget::Sqlite {
                path: PathBuf::from("records.db"),
            }),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_transfer_settings() {
        let config = RunConfig::default();
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.page_size, 500);
        assert_eq!(config.retry.max_retries, TransferConfig::DEFAULT_RETRY_LIMIT);
        assert!(config.mode.is_preview());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = RunConfig {
            destination: CloudCredentials::default(),
            ..complete()
        };
        let err = config.validate_for_migration().unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
        assert!(err.to_string().contains("destination"));
        assert!(complete().validate_for_migration().is_ok());
    }

    #[test]
    fn test_records_require_store() {
        let config = RunConfig {
            record_store: None,
            ..complete()
        };
        assert!(config.validate_for_records().is_err());
        assert!(complete().validate_for_records().is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        let config = RunConfig {
            page_size: 501,
            ..complete()
        };
        assert!(config.validate_for_migration().is_err());
    }

    #[test]
    fn test_mongo_database_from_uri() {
        assert_eq!(
            database_from_uri("mongodb://host:27017/school?retryWrites=true"),
            Some("school".to_string())
        );
        assert_eq!(database_from_uri("mongodb://host:27017"), None);

        let target = RecordStoreTarget::mongo("mongodb://host/school", None).unwrap();
        assert_eq!(
            target,
            RecordStoreTarget::Mongo {
                uri: "mongodb://host/school".to_string(),
                database: "school".to_string(),
            }
        );
        assert!(RecordStoreTarget::mongo("mongodb://host", None).is_err());
    }

    #[test]
    fn test_locator_fields_skip_external_id() {
        let fields = FieldSet::default();
        let locators: Vec<&str> = fields.locator_fields().collect();
        assert!(!locators.contains(&"imgId"));
        assert!(locators.contains(&"image"));
    }
}
