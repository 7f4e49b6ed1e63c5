//! Store interfaces consumed by the pipeline, plus concrete backends.
//!
//! - `SourceStore` lists assets page by page.
//! - `DestinationStore` uploads one asset under a caller-chosen id.
//! - `RecordStore` is the document store whose references get reconciled.

pub mod cloudinary;
pub mod memory;
#[cfg(feature = "mongo")]
pub mod mongo;
pub mod sqlite;

use crate::error::Result;
use crate::models::{AssetDescriptor, AssetKind};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

pub use cloudinary::{CloudCredentials, CloudinaryStore};
pub use memory::{MemoryDestination, MemoryRecordStore, MemorySource};
#[cfg(feature = "mongo")]
pub use mongo::MongoRecordStore;
pub use sqlite::SqliteRecordStore;

/// One page of a source listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub assets: Vec<AssetDescriptor>,
    /// Continuation cursor; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Options passed to `DestinationStore::upload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub id: String,
    pub folder: String,
    pub kind: AssetKind,
    pub overwrite: bool,
}

impl UploadOptions {
    /// Upload options that mirror a source asset, overwrite disabled.
    pub fn for_asset(asset: &AssetDescriptor) -> Self {
        Self {
            id: asset.id.clone(),
            folder: asset.folder.clone(),
            kind: asset.kind,
            overwrite: false,
        }
    }
}

/// Receipt of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
    pub locator: String,
}

/// Lists assets at the source provider.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn list(&self, cursor: Option<&str>, page_size: usize) -> Result<ListPage>;
}

/// Receives copies of assets.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Copy the content reachable at `content_locator` to the destination.
    ///
    /// Must fail with `RelayError::AssetExists` when `options.id` already
    /// exists and `options.overwrite` is false.
    async fn upload(&self, content_locator: &str, options: &UploadOptions)
        -> Result<UploadReceipt>;
}

/// A document as seen by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Unique document key within its collection.
    pub id: String,
    /// Document fields, always a JSON object.
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Top-level field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Top-level field as a string, if it is one.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }
}

/// `$set`-style patch: field name to new value. Ordered for stable logs.
pub type Patch = BTreeMap<String, Value>;

/// Result of an update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Query predicate over top-level document fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the value.
    Eq(String, Value),
    /// Field is a string containing the needle, or an array with such an element.
    Contains(String, String),
    /// Any of the nested filters matches.
    Any(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains(field.into(), needle.into())
    }

    /// Evaluate the filter against a document body.
    pub fn matches(&self, body: &Value) -> bool {
        match self {
            Filter::Eq(field, expected) => match body.get(field) {
                Some(Value::Array(items)) if !expected.is_array() => {
                    items.iter().any(|item| item == expected)
                }
                Some(actual) => actual == expected,
                None => false,
            },
            Filter::Contains(field, needle) => {
                !needle.is_empty() && body.get(field).is_some_and(|v| value_contains(v, needle))
            }
            Filter::Any(filters) => filters.iter().any(|f| f.matches(body)),
        }
    }
}

/// Whether a string value (or any string element of an array) contains `needle`.
pub fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|s| s.contains(needle))),
        _ => false,
    }
}

/// Document store holding references to assets.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_filter(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn update_by_id(&self, collection: &str, id: &str, patch: &Patch)
        -> Result<UpdateResult>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Every document in a collection, in store order.
    async fn scan(&self, collection: &str) -> Result<Vec<Document>>;
}

/// Apply a `$set` patch to a document body in place, returning whether it changed.
pub(crate) fn apply_patch(body: &mut Value, patch: &Patch) -> bool {
    let Some(object) = body.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    for (field, value) in patch {
        if object.get(field) != Some(value) {
            object.insert(field.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eq_filter_matches_array_element() {
        let body = json!({"images": ["a", "b"], "image": "a"});
        assert!(Filter::eq("image", "a").matches(&body));
        assert!(Filter::eq("images", "b").matches(&body));
        assert!(!Filter::eq("images", "c").matches(&body));
        assert!(!Filter::eq("missing", "a").matches(&body));
    }

    #[test]
    fn test_contains_filter() {
        let body = json!({"image": "https://old/abc123.jpg", "gallery": ["x", "https://old/zz.png"], "n": 5});
        assert!(Filter::contains("image", "abc123").matches(&body));
        assert!(Filter::contains("gallery", "zz.png").matches(&body));
        assert!(!Filter::contains("n", "5").matches(&body));
        assert!(!Filter::contains("image", "").matches(&body));
    }

    #[test]
    fn test_any_filter() {
        let body = json!({"imgId": "folder/abc"});
        let filter = Filter::Any(vec![
            Filter::contains("image", "abc"),
            Filter::eq("imgId", "folder/abc"),
        ]);
        assert!(filter.matches(&body));
        assert!(!Filter::Any(Vec::new()).matches(&body));
    }

    #[test]
    fn test_apply_patch_reports_change() {
        let mut body = json!({"image": "old", "imgId": "x"});
        let mut patch = Patch::new();
        patch.insert("image".into(), json!("new"));
        assert!(apply_patch(&mut body, &patch));
        assert_eq!(body["image"], "new");
        assert!(!apply_patch(&mut body, &patch));
    }
}
