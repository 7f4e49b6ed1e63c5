//! Command-line arguments and their mapping onto `RunConfig`.
//!
//! Every option can also come from the environment (or a `.env` file), using
//! the same variable names existing `.env` files already define. `CSV_FILE`
//! and `CSV_IN` name the migration ledger; `CSV_OUT` only ever names a
//! reconciliation-shaped ledger.

use asset_relay::config::{LedgerConfig, TransferConfig};
use asset_relay::{
    AssetKind, Backoff, CloudCredentials, ExecutionMode, FieldSet, HostRewrite, RecordStoreTarget, Result,
    RetryPolicy, RunConfig,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "asset-relay")]
#[command(about = "Migrate hosted assets between providers and reconcile record-store references")]
pub struct Cli {
    /// Preview computes matches without writing to the record store
    #[arg(long, global = true, env = "RELAY_MODE", value_enum)]
    pub mode: Option<ModeArg>,

    /// Legacy switch; `false` selects apply mode when --mode is not given
    #[arg(long, global = true, env = "PREVIEW_ONLY", hide = true)]
    pub preview_only: Option<bool>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Preview,
    Apply,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTypeArg {
    Image,
    Video,
    Raw,
}

impl From<ResourceTypeArg> for AssetKind {
    fn from(arg: ResourceTypeArg) -> Self {
        match arg {
            ResourceTypeArg::Image => AssetKind::Image,
            ResourceTypeArg::Video => AssetKind::Video,
            ResourceTypeArg::Raw => AssetKind::Raw,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy every source asset to the destination and update references
    Migrate(MigrateArgs),
    /// Apply an existing migration ledger to the configured collection
    Reconcile(PassArgs),
    /// Re-reconcile transferred assets that updated no documents
    Repair(PassArgs),
    /// Write the source locators from a migration ledger back
    Restore(RestoreArgs),
    /// Replace a host prefix in every string of every document
    RewriteHosts(RewriteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CredentialArgs {
    #[arg(long, env = "OLD_CLOUD_NAME", default_value = "")]
    pub old_cloud_name: String,
    #[arg(long, env = "OLD_API_KEY", default_value = "")]
    pub old_api_key: String,
    #[arg(long, env = "OLD_API_SECRET", default_value = "", hide_env_values = true)]
    pub old_api_secret: String,
    #[arg(long, env = "NEW_CLOUD_NAME", default_value = "")]
    pub new_cloud_name: String,
    #[arg(long, env = "NEW_API_KEY", default_value = "")]
    pub new_api_key: String,
    #[arg(long, env = "NEW_API_SECRET", default_value = "", hide_env_values = true)]
    pub new_api_secret: String,
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite record store file
    #[arg(long, env = "SQLITE_PATH")]
    pub sqlite_path: Option<PathBuf>,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", hide_env_values = true)]
    pub mongodb_uri: Option<String>,

    /// MongoDB database (defaults to the URI path)
    #[arg(long, env = "DB_NAME")]
    pub db_name: Option<String>,

    /// Collection holding the references
    #[arg(long, env = "COLLECTION_NAME", default_value = "news")]
    pub collection: String,
}

impl StoreArgs {
    fn target(&self) -> Result<Option<RecordStoreTarget>> {
        if let Some(path) = &self.sqlite_path {
            return Ok(Some(RecordStoreTarget::Sqlite { path: path.clone() }));
        }
        match &self.mongodb_uri {
            Some(uri) if !uri.is_empty() => {
                RecordStoreTarget::mongo(uri.clone(), self.db_name.clone()).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FieldArgs {
    /// Field holding the canonical asset id
    #[arg(long, env = "IMGID_FIELD", default_value = "imgId")]
    pub external_id_field: String,

    /// Field that receives the locator when none references it
    #[arg(long, env = "FIELD_PATH", default_value = "image")]
    pub primary_field: String,

    /// Fields that may hold a locator
    #[arg(
        long,
        env = "CANDIDATE_FIELDS",
        value_delimiter = ',',
        default_value = "image,images,imgId,photo,photos,gallery"
    )]
    pub candidate_fields: Vec<String>,

    /// Free-text field scanned for references
    #[arg(long, env = "CONTENT_FIELD", default_value = "content")]
    pub content_field: String,
}

impl From<&FieldArgs> for FieldSet {
    fn from(args: &FieldArgs) -> Self {
        FieldSet {
            external_id: args.external_id_field.clone(),
            primary: args.primary_field.clone(),
            candidates: args
                .candidate_fields
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            content: args.content_field.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub credentials: CredentialArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub fields: FieldArgs,

    /// Uploads in flight at once
    #[arg(long, env = "CONCURRENCY", default_value_t = TransferConfig::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Assets per listing page (1-500)
    #[arg(long, env = "PAGE_SIZE", default_value_t = TransferConfig::MAX_PAGE_SIZE)]
    pub page_size: usize,

    /// Resource type to list at the source; run once per type
    #[arg(long, env = "RESOURCE_TYPE", value_enum, default_value = "image")]
    pub resource_type: ResourceTypeArg,

    /// Only migrate the first N assets (0 migrates everything)
    #[arg(long, env = "TEST_COUNT")]
    pub limit: Option<usize>,

    /// Extra upload attempts after the first
    #[arg(long, env = "RETRY_LIMIT", default_value_t = TransferConfig::DEFAULT_RETRY_LIMIT)]
    pub retries: u32,

    /// Base delay between attempts, multiplied by the attempt number
    #[arg(long, env = "RETRY_DELAY_MS", default_value = "1000")]
    pub retry_delay_ms: u64,

    /// Migration ledger to write
    #[arg(long, env = "CSV_FILE", default_value = LedgerConfig::MIGRATION_LEDGER)]
    pub ledger: PathBuf,

    /// Reconciliation ledger to write
    #[arg(long, env = "CSV_OUT", default_value = LedgerConfig::RECONCILIATION_LEDGER)]
    pub reconciliation_ledger: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct PassArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub fields: FieldArgs,

    /// Migration ledger to read
    #[arg(long, env = "CSV_IN", default_value = LedgerConfig::MIGRATION_LEDGER)]
    pub input: PathBuf,

    /// Reconciliation ledger to append to
    #[arg(long, env = "CSV_OUT", default_value = LedgerConfig::RECONCILIATION_LEDGER)]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub pass: PassArgs,

    /// Restore in every collection instead of only --collection
    #[arg(long)]
    pub all_collections: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RewriteArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Host prefix to replace, e.g. `res.cloudinary.com/oldcloud`
    #[arg(long, env = "OLD_HOST")]
    pub old_host: String,

    /// Replacement host prefix
    #[arg(long, env = "NEW_HOST")]
    pub new_host: String,

    /// Collapse `/<folder>/<folder>/` into `/<folder>/`
    #[arg(long, env = "COLLAPSE_FOLDER")]
    pub collapse_folder: Option<String>,

    /// Rewrite every collection instead of only --collection
    #[arg(long)]
    pub all_collections: bool,

    /// Ledger to append rewritten documents to
    #[arg(long, env = "CSV_OUT", default_value = "host-rewrite.csv")]
    pub output: PathBuf,
}

impl Cli {
    pub fn execution_mode(&self) -> ExecutionMode {
        match (self.mode, self.preview_only) {
            (Some(ModeArg::Apply), _) => ExecutionMode::Apply,
            (Some(ModeArg::Preview), _) => ExecutionMode::Preview,
            (None, Some(false)) => ExecutionMode::Apply,
            (None, _) => ExecutionMode::Preview,
        }
    }

    /// Build the immutable run configuration for the selected command.
    pub fn run_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig {
            mode: self.execution_mode(),
            ..RunConfig::default()
        };

        match &self.command {
            Command::Migrate(args) => {
                let creds = &args.credentials;
                config.source = CloudCredentials::new(
                    creds.old_cloud_name.as_str(),
                    creds.old_api_key.as_str(),
                    creds.old_api_secret.as_str(),
                );
                config.destination = CloudCredentials::new(
                    creds.new_cloud_name.as_str(),
                    creds.new_api_key.as_str(),
                    creds.new_api_secret.as_str(),
                );
                apply_store(&mut config, &args.store)?;
                config.fields = FieldSet::from(&args.fields);
                config.concurrency = args.concurrency;
                config.page_size = args.page_size;
                config.source_kind = args.resource_type.into();
                config.limit = args.limit;
                config.retry = RetryPolicy::new()
                    .with_max_retries(args.retries)
                    .with_backoff(Backoff::Linear {
                        base: Duration::from_millis(args.retry_delay_ms),
                    });
                config.migration_ledger = args.ledger.clone();
                config.reconciliation_ledger = args.reconciliation_ledger.clone();
            }
            Command::Reconcile(pass) | Command::Repair(pass) => apply_pass(&mut config, pass)?,
            Command::Restore(args) => {
                apply_pass(&mut config, &args.pass)?;
                config.restore_all_collections = args.all_collections;
            }
            Command::RewriteHosts(args) => {
                apply_store(&mut config, &args.store)?;
                config.reconciliation_ledger = args.output.clone();
                config.host_rewrite = Some(HostRewrite {
                    old_host: args.old_host.clone(),
                    new_host: args.new_host.clone(),
                    collapse_folder: args.collapse_folder.clone(),
                });
            }
        }
        Ok(config)
    }
}

fn apply_store(config: &mut RunConfig, store: &StoreArgs) -> Result<()> {
    config.record_store = store.target()?;
    config.collection = store.collection.clone();
    Ok(())
}

fn apply_pass(config: &mut RunConfig, pass: &PassArgs) -> Result<()> {
    apply_store(config, &pass.store)?;
    config.fields = FieldSet::from(&pass.fields);
    config.migration_ledger = pass.input.clone();
    config.reconciliation_ledger = pass.output.clone();
    Ok(())
}
