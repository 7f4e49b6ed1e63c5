//! In-memory store backends.
//!
//! Used by the test suites and for rehearsing a run against fixture data.
//! Each store keeps deterministic insertion order and exposes a few knobs to
//! inject failures.

use super::{
    apply_patch, DestinationStore, Document, Filter, ListPage, Patch, RecordStore, SourceStore,
    UpdateResult, UploadOptions, UploadReceipt,
};
use crate::error::{RelayError, Result};
use crate::models::AssetDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RelayError::Other("memory store lock poisoned".to_string()))
}

/// Source store backed by a fixed list of assets.
#[derive(Debug, Default)]
pub struct MemorySource {
    assets: Vec<AssetDescriptor>,
    /// Page index (0-based) whose listing call fails.
    fail_on_page: Option<usize>,
    list_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(assets: Vec<AssetDescriptor>) -> Self {
        Self {
            assets,
            fail_on_page: None,
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Make the listing of the given page fail.
    pub fn failing_on_page(mut self, page: usize) -> Self {
        self.fail_on_page = Some(page);
        self
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list(&self, cursor: Option<&str>, page_size: usize) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let offset = match cursor {
            Some(c) => c.parse::<usize>().map_err(|_| RelayError::Enumeration {
                message: format!("invalid cursor {:?}", c),
            })?,
            None => 0,
        };
        let page_size = page_size.max(1);

        if self.fail_on_page == Some(offset / page_size) {
            return Err(RelayError::Network {
                message: format!("listing failed at offset {}", offset),
                cause: None,
            });
        }

        let end = (offset + page_size).min(self.assets.len());
        let assets = self.assets.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < self.assets.len()).then(|| end.to_string());

        Ok(ListPage {
            assets,
            next_cursor,
        })
    }
}

/// An asset held by `MemoryDestination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub id: String,
    pub folder: String,
    pub kind: String,
    pub locator: String,
    /// Locator the content was copied from.
    pub copied_from: String,
}

#[derive(Debug, Default)]
struct DestinationState {
    assets: BTreeMap<String, StoredAsset>,
    attempts: HashMap<String, u32>,
    /// Remaining forced failures per id.
    failures: HashMap<String, u32>,
}

/// Destination store that keeps uploads in memory.
#[derive(Debug)]
pub struct MemoryDestination {
    base_url: String,
    state: Mutex<DestinationState>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryDestination {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state: Mutex::new(DestinationState::default()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulated upload latency, used to observe the concurrency bound.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` uploads of `id` with a network error.
    pub fn fail_times(&self, id: impl Into<String>, times: u32) -> Result<()> {
        lock(&self.state)?.failures.insert(id.into(), times);
        Ok(())
    }

    /// Fail every upload of `id`.
    pub fn fail_always(&self, id: impl Into<String>) -> Result<()> {
        self.fail_times(id, u32::MAX)
    }

    /// Pre-populate an asset, e.g. to provoke a collision.
    pub fn insert_existing(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        let locator = format!("{}/{}", self.base_url, id);
        lock(&self.state)?.assets.insert(
            id.clone(),
            StoredAsset {
                id,
                folder: String::new(),
                kind: "image".to_string(),
                locator,
                copied_from: String::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<StoredAsset> {
        lock(&self.state).ok()?.assets.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.state)
            .map(|s| s.assets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Upload attempts made for `id`.
    pub fn attempts(&self, id: &str) -> u32 {
        lock(&self.state)
            .ok()
            .and_then(|s| s.attempts.get(id).copied())
            .unwrap_or(0)
    }

    /// Highest number of uploads observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn locator_for(&self, options: &UploadOptions, source: &str) -> String {
        let extension = source
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext))
            .unwrap_or("");
        if extension.is_empty() {
            format!("{}/{}/{}", self.base_url, options.kind, options.id)
        } else {
            format!("{}/{}/{}.{}", self.base_url, options.kind, options.id, extension)
        }
    }

    fn complete_upload(&self, content_locator: &str, options: &UploadOptions) -> Result<UploadReceipt> {
        let mut state = lock(&self.state)?;
        *state.attempts.entry(options.id.clone()).or_insert(0) += 1;

        if let Some(remaining) = state.failures.get_mut(&options.id) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(RelayError::Network {
                    message: format!("simulated upload failure for {}", options.id),
                    cause: None,
                });
            }
        }

        if !options.overwrite && state.assets.contains_key(&options.id) {
            return Err(RelayError::AssetExists {
                id: options.id.clone(),
            });
        }

        let locator = self.locator_for(options, content_locator);
        state.assets.insert(
            options.id.clone(),
            StoredAsset {
                id: options.id.clone(),
                folder: options.folder.clone(),
                kind: options.kind.to_string(),
                locator: locator.clone(),
                copied_from: content_locator.to_string(),
            },
        );

        Ok(UploadReceipt {
            id: options.id.clone(),
            locator,
        })
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn upload(
        &self,
        content_locator: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.complete_upload(content_locator, options);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Record store holding JSON documents per collection.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
    /// Documents whose updates match but never modify (concurrent edit).
    stale: Mutex<HashSet<(String, String)>>,
    update_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document; replaces any document with the same id.
    pub fn insert(&self, collection: &str, id: impl Into<String>, body: Value) -> Result<()> {
        let doc = Document::new(id, body);
        let mut collections = lock(&self.collections)?;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(())
    }

    /// Make updates to this document report `modified_count = 0`.
    pub fn mark_stale(&self, collection: &str, id: &str) -> Result<()> {
        lock(&self.stale)?.insert((collection.to_string(), id.to_string()));
        Ok(())
    }

    /// Full copy of every collection.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Document>> {
        lock(&self.collections)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.collections)
            .ok()?
            .get(collection)?
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Number of `update_by_id` calls received.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_filter(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let collections = lock(&self.collections)?;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| filter.matches(&d.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.get(collection, id))
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<UpdateResult> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        if lock(&self.stale)?.contains(&(collection.to_string(), id.to_string())) {
            return Ok(UpdateResult {
                matched_count: 1,
                modified_count: 0,
            });
        }

        let mut collections = lock(&self.collections)?;
        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
        else {
            return Ok(UpdateResult::default());
        };

        let changed = apply_patch(&mut doc.body, patch);
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: u64::from(changed),
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(lock(&self.collections)?.keys().cloned().collect())
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(lock(&self.collections)?
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}
