//! Lazy enumeration of source assets.

use crate::config::TransferConfig;
use crate::error::{RelayError, Result};
use crate::models::AssetDescriptor;
use crate::store::SourceStore;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

enum PageState {
    Start,
    Next(String),
    Done,
}

/// Walks a source store page by page.
///
/// Each call to [`Enumerator::stream`] starts over from the first page; the
/// continuation cursor only lives inside the stream.
#[derive(Clone)]
pub struct Enumerator {
    source: Arc<dyn SourceStore>,
    page_size: usize,
    limit: Option<usize>,
}

impl Enumerator {
    /// Create an enumerator. `page_size` is clamped into `1..=500`.
    pub fn new(source: Arc<dyn SourceStore>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.clamp(1, TransferConfig::MAX_PAGE_SIZE),
            limit: None,
        }
    }

    /// Only yield the first `limit` assets. A limit of zero means no cap.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.filter(|n| *n > 0);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Finite stream of descriptors.
    ///
    /// A listing failure is yielded once as `RelayError::Enumeration` and
    /// ends the stream.
    pub fn stream(&self) -> BoxStream<'static, Result<AssetDescriptor>> {
        let source = Arc::clone(&self.source);
        let page_size = self.page_size;

        let pages = stream::try_unfold(PageState::Start, move |state| {
            let source = Arc::clone(&source);
            async move {
                let cursor = match state {
                    PageState::Done => return Ok(None),
                    PageState::Start => None,
                    PageState::Next(cursor) => Some(cursor),
                };

                let page = source
                    .list(cursor.as_deref(), page_size)
                    .await
                    .map_err(|e| match e {
                        RelayError::Enumeration { .. } => e,
                        other => RelayError::Enumeration {
                            message: other.to_string(),
                        },
                    })?;
                debug!(
                    "Listed {} assets (cursor: {:?}, more: {})",
                    page.assets.len(),
                    cursor,
                    page.next_cursor.is_some()
                );

                let next = match page.next_cursor {
                    Some(c) if !c.is_empty() => PageState::Next(c),
                    _ => PageState::Done,
                };
                Ok::<_, RelayError>(Some((page.assets, next)))
            }
        });

        let assets = pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, RelayError>)))
            .try_flatten();

        match self.limit {
            Some(limit) => assets.take(limit).boxed(),
            None => assets.boxed(),
        }
    }

    /// Collect every descriptor into memory.
    pub async fn collect_all(&self) -> Result<Vec<AssetDescriptor>> {
        self.stream().try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySource;

    fn source(n: usize) -> Arc<MemorySource> {
        Arc::new(MemorySource::new(
            (0..n)
                .map(|i| AssetDescriptor::new(format!("a{}", i), format!("https://old/a{}.jpg", i)))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_follows_cursor_to_the_end() {
        let src = source(7);
        let enumerator = Enumerator::new(src.clone(), 3);
        let all = enumerator.collect_all().await.unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all[6].id, "a6");
        assert_eq!(src.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_restartable() {
        let enumerator = Enumerator::new(source(4), 2);
        let first = enumerator.collect_all().await.unwrap();
        let second = enumerator.collect_all().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_limit_stops_paging() {
        let src = source(10);
        let enumerator = Enumerator::new(src.clone(), 2).with_limit(Some(3));
        let ids: Vec<String> = enumerator
            .collect_all()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["a0", "a1", "a2"]);
        assert_eq!(src.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_is_uncapped() {
        let enumerator = Enumerator::new(source(5), 2).with_limit(Some(0));
        assert_eq!(enumerator.collect_all().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_listing_error_is_enumeration_error() {
        let src = Arc::new(
            MemorySource::new(vec![
                AssetDescriptor::new("a", "https://old/a.jpg"),
                AssetDescriptor::new("b", "https://old/b.jpg"),
            ])
            .failing_on_page(1),
        );
        let mut stream = Enumerator::new(src, 1).stream();
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Enumeration { .. }));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_page_size_clamped() {
        assert_eq!(Enumerator::new(source(0), 0).page_size(), 1);
        assert_eq!(Enumerator::new(source(0), 10_000).page_size(), 500);
    }
}
