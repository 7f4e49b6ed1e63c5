//! Domain types shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource kind of an asset, mirrored on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    #[default]
    Image,
    Video,
    Raw,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Video => "video",
            AssetKind::Raw => "raw",
        }
    }

    /// Parse a provider resource type; unknown types are treated as images.
    pub fn from_provider(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "video" => AssetKind::Video,
            "raw" => AssetKind::Raw,
            _ => AssetKind::Image,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asset listed at the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Stable identifier, preserved at the destination.
    pub id: String,
    /// Where the asset content can be fetched from.
    pub source_locator: String,
    /// Folder the asset lives in (may be empty).
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub kind: AssetKind,
}

impl AssetDescriptor {
    pub fn new(id: impl Into<String>, source_locator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_locator: source_locator.into(),
            folder: String::new(),
            kind: AssetKind::Image,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_kind(mut self, kind: AssetKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Final status of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Ok,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Ok => "ok",
            TransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of transferring one asset. Immutable once written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub id: String,
    pub source_locator: String,
    /// Destination locator; empty when the transfer failed.
    pub dest_locator: String,
    pub status: TransferStatus,
    /// Captured error text; empty on success.
    pub error: String,
    /// Documents updated downstream, `-1` when reconciliation errored.
    pub docs_updated: i64,
    /// Attempts made against the destination store.
    pub attempts: u32,
}

impl TransferOutcome {
    pub fn ok(asset: &AssetDescriptor, dest_locator: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: asset.id.clone(),
            source_locator: asset.source_locator.clone(),
            dest_locator: dest_locator.into(),
            status: TransferStatus::Ok,
            error: String::new(),
            docs_updated: 0,
            attempts,
        }
    }

    pub fn failed(asset: &AssetDescriptor, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: asset.id.clone(),
            source_locator: asset.source_locator.clone(),
            dest_locator: String::new(),
            status: TransferStatus::Failed,
            error: error.into(),
            docs_updated: 0,
            attempts,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TransferStatus::Ok
    }
}

/// Heuristic used to locate a document referencing an asset.
///
/// Variants are declared in priority order; `Ord` follows that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactId,
    ExactUrl,
    SubstringId,
    SubstringFilename,
    ContentScan,
}

impl MatchStrategy {
    /// All strategies in evaluation order.
    pub const ALL: [MatchStrategy; 5] = [
        MatchStrategy::ExactId,
        MatchStrategy::ExactUrl,
        MatchStrategy::SubstringId,
        MatchStrategy::SubstringFilename,
        MatchStrategy::ContentScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ExactId => "exact_id",
            MatchStrategy::ExactUrl => "exact_url",
            MatchStrategy::SubstringId => "substring_id",
            MatchStrategy::SubstringFilename => "substring_filename",
            MatchStrategy::ContentScan => "content_scan",
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dry-run vs. mutating execution of the same matching logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Preview,
    Apply,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Preview => "preview",
            ExecutionMode::Apply => "apply",
        }
    }

    pub fn is_preview(&self) -> bool {
        *self == ExecutionMode::Preview
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preview" => Ok(ExecutionMode::Preview),
            "apply" => Ok(ExecutionMode::Apply),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one asset through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetState {
    Enumerated,
    Transferring,
    Transferred,
    TransferFailedExhausted,
    Reconciled,
    ReconciliationPending,
    Repaired,
}

impl AssetState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssetState::TransferFailedExhausted | AssetState::Reconciled | AssetState::Repaired
        )
    }

    /// State after the migration ledger row was written.
    pub fn after_migration(status: TransferStatus, docs_updated: i64) -> Self {
        match status {
            TransferStatus::Failed => AssetState::TransferFailedExhausted,
            TransferStatus::Ok if docs_updated > 0 => AssetState::Reconciled,
            TransferStatus::Ok => AssetState::ReconciliationPending,
        }
    }

    /// State after a repair pass updated `docs_updated` documents.
    pub fn after_repair(self, docs_updated: u64) -> Self {
        match self {
            AssetState::ReconciliationPending if docs_updated > 0 => AssetState::Repaired,
            other => other,
        }
    }
}

/// Totals of a repair, restore or rewrite pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub rows_considered: usize,
    pub docs_found: u64,
    pub docs_updated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_order_is_priority() {
        let mut shuffled = vec![
            MatchStrategy::ContentScan,
            MatchStrategy::SubstringId,
            MatchStrategy::ExactId,
            MatchStrategy::SubstringFilename,
            MatchStrategy::ExactUrl,
        ];
        shuffled.sort();
        assert_eq!(shuffled, MatchStrategy::ALL.to_vec());
    }

    #[test]
    fn test_asset_kind_fallback() {
        assert_eq!(AssetKind::from_provider("video"), AssetKind::Video);
        assert_eq!(AssetKind::from_provider("VIDEO"), AssetKind::Video);
        assert_eq!(AssetKind::from_provider("something"), AssetKind::Image);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Apply".parse(), Ok(ExecutionMode::Apply));
        assert_eq!("dry".parse::<ExecutionMode>(), Err(()));
        assert!(ExecutionMode::default().is_preview());
    }

    #[test]
    fn test_asset_state_transitions() {
        let pending = AssetState::after_migration(TransferStatus::Ok, 0);
        assert_eq!(pending, AssetState::ReconciliationPending);
        assert!(!pending.is_terminal());
        assert_eq!(pending.after_repair(1), AssetState::Repaired);
        assert_eq!(pending.after_repair(0), AssetState::ReconciliationPending);

        let failed = AssetState::after_migration(TransferStatus::Failed, 0);
        assert!(failed.is_terminal());
        assert_eq!(failed.after_repair(3), AssetState::TransferFailedExhausted);
    }
}
