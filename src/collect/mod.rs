//! Exhaustive collection over paginated or virtually-scrolled sources.
//!
//! One [`Collector`] handles both shapes:
//!
//! - [`Collector::paginate`] drives a `fetch_page(cursor)` function until the
//!   server says it is done, the cursor runs out, or paging stops making
//!   progress;
//! - [`Collector::reveal`] drives a [`Revealer`] (scan, scroll, scan again)
//!   until nothing new shows up for a while.
//!
//! Items are de-duplicated by an identity key and returned in first-seen
//! order. Partial results are always returned together with the reason
//! collection stopped; only an authorization failure is an `Err`, so the
//! caller can re-authenticate and start over.

mod cursor;

pub use cursor::Cursor;

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;

use crate::error::SessionError;

/// Limits for a single collection run.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Requested page size. Enables the short-page rule when the server does
    /// not say whether more pages exist.
    pub page_size: Option<usize>,

    /// Hard ceiling on fetches (or reveal steps).
    pub max_pages: usize,

    /// Consecutive reveal steps without new items before stopping.
    pub max_idle_reveals: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: None,
            max_pages: 500,
            max_idle_reveals: 20,
        }
    }
}

impl CollectorConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_max_idle_reveals(mut self, max_idle_reveals: usize) -> Self {
        self.max_idle_reveals = max_idle_reveals;
        self
    }
}

/// One server response.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
    /// Explicit "more pages" flag, when the server sends one.
    pub has_more: Option<bool>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            has_more: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.next_cursor = Some(cursor);
        self
    }

    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = Some(has_more);
        self
    }
}

/// Why a collection finished normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EmptyPage,
    NoMorePages,
    ShortPage,
    CursorExhausted,
    Idle,
}

/// How a collection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectStatus {
    Complete(StopReason),
    /// The cursor stopped moving, or a page brought nothing new.
    Stalled { cursor: Cursor },
    /// The page ceiling was hit before the source was exhausted.
    PageLimit { pages: usize },
    /// A non-authorization failure; items gathered so far are kept.
    Aborted { error: String },
}

impl CollectStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CollectStatus::Complete(_))
    }
}

impl std::fmt::Display for CollectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectStatus::Complete(reason) => write!(f, "complete ({reason:?})"),
            CollectStatus::Stalled { cursor } => write!(f, "stalled at cursor {cursor}"),
            CollectStatus::PageLimit { pages } => write!(f, "stopped at page limit ({pages})"),
            CollectStatus::Aborted { error } => write!(f, "aborted: {error}"),
        }
    }
}

/// Result of a collection run.
#[derive(Debug, Clone)]
pub struct Collected<T> {
    pub items: Vec<T>,
    pub pages: usize,
    pub status: CollectStatus,
}

impl<T> Collected<T> {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Mutable state of one collection run.
#[derive(Debug)]
pub struct CollectionState<T> {
    pub items: Vec<T>,
    seen: HashSet<String>,
    pub cursor: Option<Cursor>,
    /// Steps in a row that added no new items.
    pub consecutive_empty: usize,
    pub pages: usize,
}

impl<T> Default for CollectionState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            cursor: None,
            consecutive_empty: 0,
            pages: 0,
        }
    }
}

impl<T> CollectionState<T> {
    /// Append unseen items. Returns how many were new.
    pub fn absorb(&mut self, items: Vec<T>, key: impl Fn(&T) -> String) -> usize {
        let before = self.items.len();
        for item in items {
            if self.seen.insert(key(&item)) {
                self.items.push(item);
            }
        }
        self.items.len() - before
    }

    fn finish(self, status: CollectStatus) -> Collected<T> {
        Collected {
            items: self.items,
            pages: self.pages,
            status,
        }
    }
}

/// A UI source that renders only part of its items at a time.
#[async_trait]
pub trait Revealer<T>: Send {
    /// Items currently rendered.
    async fn scan(&mut self) -> Result<Vec<T>, SessionError>;

    /// Move the viewport forward by one bounded step.
    async fn advance(&mut self) -> Result<(), SessionError>;
}

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type DeriveFn<T> = Box<dyn Fn(&T) -> Option<Cursor> + Send + Sync>;

/// Generic pagination/reveal engine.
pub struct Collector<T> {
    config: CollectorConfig,
    key: KeyFn<T>,
    derive_cursor: Option<DeriveFn<T>>,
}

impl<T> Collector<T> {
    pub fn new(config: CollectorConfig, key: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        Self {
            config,
            key: Box::new(key),
            derive_cursor: None,
        }
    }

    /// Derive the next cursor from the last item when the server omits one.
    pub fn with_derived_cursor(
        mut self,
        derive: impl Fn(&T) -> Option<Cursor> + Send + Sync + 'static,
    ) -> Self {
        self.derive_cursor = Some(Box::new(derive));
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Fetch pages until one of the stop conditions holds.
    ///
    /// Only [`SessionError::AuthorizationExpired`] is returned as `Err`; every
    /// other outcome is a [`Collected`] carrying whatever was gathered.
    pub async fn paginate<F, Fut>(&self, mut fetch_page: F) -> Result<Collected<T>, SessionError>
    where
        F: FnMut(Option<Cursor>) -> Fut,
        Fut: Future<Output = Result<Page<T>, SessionError>>,
    {
        let mut state = CollectionState::default();

        loop {
            let used = state.cursor.clone();
            let page = match fetch_page(used.clone()).await {
                Ok(page) => page,
                Err(e) if e.is_authorization_expired() => return Err(e),
                Err(e) => {
                    tracing::warn!(pages = state.pages, items = state.items.len(), error = %e, "Page fetch failed");
                    return Ok(state.finish(CollectStatus::Aborted {
                        error: e.to_string(),
                    }));
                }
            };
            state.pages += 1;

            let received = page.items.len();
            let derived = match (&page.next_cursor, &self.derive_cursor) {
                (None, Some(derive)) => page.items.last().and_then(|item| derive(item)),
                _ => None,
            };
            let added = state.absorb(page.items, &self.key);
            tracing::debug!(
                page = state.pages,
                received,
                added,
                total = state.items.len(),
                "Fetched page"
            );

            if received == 0 {
                return Ok(self.complete(state, StopReason::EmptyPage));
            }
            if page.has_more == Some(false) {
                return Ok(self.complete(state, StopReason::NoMorePages));
            }
            if page.has_more.is_none() {
                if let Some(page_size) = self.config.page_size {
                    if received < page_size {
                        return Ok(self.complete(state, StopReason::ShortPage));
                    }
                }
            }

            let Some(next) = page.next_cursor.or(derived) else {
                return Ok(self.complete(state, StopReason::CursorExhausted));
            };
            if used.as_ref() == Some(&next) {
                tracing::warn!(
                    cursor = %next,
                    pages = state.pages,
                    items = state.items.len(),
                    "Pagination cursor did not advance; stopping"
                );
                return Ok(state.finish(CollectStatus::Stalled { cursor: next }));
            }
            // A moving cursor over a page of repeats means the server ignores it.
            if added == 0 {
                state.consecutive_empty += 1;
                tracing::warn!(
                    cursor = %next,
                    pages = state.pages,
                    items = state.items.len(),
                    "Page held only already-seen items; stopping"
                );
                return Ok(state.finish(CollectStatus::Stalled { cursor: next }));
            }
            state.consecutive_empty = 0;

            if state.pages >= self.config.max_pages {
                tracing::warn!(pages = state.pages, "Page limit reached");
                let pages = state.pages;
                return Ok(state.finish(CollectStatus::PageLimit { pages }));
            }
            state.cursor = Some(next);
        }
    }

    /// Scan and advance a [`Revealer`] until it stops producing new items.
    pub async fn reveal<R>(&self, revealer: &mut R) -> Result<Collected<T>, SessionError>
    where
        R: Revealer<T> + ?Sized,
    {
        let mut state = CollectionState::default();

        loop {
            let scanned = match revealer.scan().await {
                Ok(items) => items,
                Err(e) if e.is_authorization_expired() => return Err(e),
                Err(e) => {
                    tracing::warn!(steps = state.pages, error = %e, "Reveal scan failed");
                    return Ok(state.finish(CollectStatus::Aborted {
                        error: e.to_string(),
                    }));
                }
            };
            state.pages += 1;

            let added = state.absorb(scanned, &self.key);
            if added == 0 {
                state.consecutive_empty += 1;
            } else {
                state.consecutive_empty = 0;
            }
            tracing::debug!(
                step = state.pages,
                added,
                total = state.items.len(),
                idle = state.consecutive_empty,
                "Reveal step"
            );

            if state.consecutive_empty >= self.config.max_idle_reveals {
                return Ok(self.complete(state, StopReason::Idle));
            }
            if state.pages >= self.config.max_pages {
                tracing::warn!(steps = state.pages, "Reveal step limit reached");
                let pages = state.pages;
                return Ok(state.finish(CollectStatus::PageLimit { pages }));
            }

            match revealer.advance().await {
                Ok(()) => {}
                Err(e) if e.is_authorization_expired() => return Err(e),
                Err(e) => {
                    tracing::warn!(steps = state.pages, error = %e, "Reveal advance failed");
                    return Ok(state.finish(CollectStatus::Aborted {
                        error: e.to_string(),
                    }));
                }
            }
        }
    }

    fn complete(&self, state: CollectionState<T>, reason: StopReason) -> Collected<T> {
        tracing::info!(
            pages = state.pages,
            items = state.items.len(),
            reason = ?reason,
            "Collection complete"
        );
        state.finish(CollectStatus::Complete(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn ids(collected: &Collected<u32>) -> Vec<u32> {
        collected.items.clone()
    }

    fn collector(config: CollectorConfig) -> Collector<u32> {
        Collector::new(config, |n: &u32| n.to_string())
    }

    async fn run(
        collector: &Collector<u32>,
        pages: Vec<Result<Page<u32>, SessionError>>,
    ) -> (Result<Collected<u32>, SessionError>, Vec<Option<Cursor>>) {
        let mut pages: VecDeque<_> = pages.into();
        let mut calls = Vec::new();
        let result = collector
            .paginate(|cursor| {
                calls.push(cursor);
                let next = pages
                    .pop_front()
                    .unwrap_or_else(|| Ok(Page::new(Vec::new())));
                async move { next }
            })
            .await;
        (result, calls)
    }

    #[tokio::test]
    async fn explicit_has_more_false_stops() {
        let c = collector(CollectorConfig::default());
        let (result, calls) = run(
            &c,
            vec![
                Ok(Page::new(vec![1, 2]).with_cursor(Cursor::new().with("p", 1))),
                Ok(Page::new(vec![2, 3])
                    .with_cursor(Cursor::new().with("p", 2))
                    .with_has_more(false)),
            ],
        )
        .await;
        let collected = result.unwrap();
        assert_eq!(ids(&collected), vec![1, 2, 3]);
        assert_eq!(collected.status, CollectStatus::Complete(StopReason::NoMorePages));
        assert_eq!(calls, vec![None, Some(Cursor::new().with("p", 1))]);
    }

    #[tokio::test]
    async fn short_page_needs_page_size_and_no_flag() {
        let c = collector(CollectorConfig::default().with_page_size(3));
        let (result, _) = run(
            &c,
            vec![
                Ok(Page::new(vec![1, 2, 3]).with_cursor(Cursor::new().with("p", 1))),
                Ok(Page::new(vec![4]).with_cursor(Cursor::new().with("p", 2))),
            ],
        )
        .await;
        let collected = result.unwrap();
        assert_eq!(collected.status, CollectStatus::Complete(StopReason::ShortPage));
        assert_eq!(collected.pages, 2);

        // An explicit flag overrides the short-page rule.
        let (result, calls) = run(
            &c,
            vec![
                Ok(Page::new(vec![1])
                    .with_cursor(Cursor::new().with("p", 1))
                    .with_has_more(true)),
                Ok(Page::new(vec![])),
            ],
        )
        .await;
        assert_eq!(
            result.unwrap().status,
            CollectStatus::Complete(StopReason::EmptyPage)
        );
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn missing_cursor_is_normal_end() {
        let c = collector(CollectorConfig::default());
        let (result, calls) = run(&c, vec![Ok(Page::new(vec![7, 8]))]).await;
        let collected = result.unwrap();
        assert_eq!(
            collected.status,
            CollectStatus::Complete(StopReason::CursorExhausted)
        );
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn derived_cursor_is_fallback_only() {
        let c = collector(CollectorConfig::default())
            .with_derived_cursor(|n: &u32| Some(Cursor::new().with("after", *n)));
        let (result, calls) = run(
            &c,
            vec![
                Ok(Page::new(vec![1, 2])),
                Ok(Page::new(vec![3]).with_cursor(Cursor::new().with("server", "x"))),
                Ok(Page::new(vec![])),
            ],
        )
        .await;
        assert!(result.unwrap().is_success());
        assert_eq!(
            calls,
            vec![
                None,
                Some(Cursor::new().with("after", 2)),
                Some(Cursor::new().with("server", "x")),
            ]
        );
    }

    #[tokio::test]
    async fn page_of_repeats_stalls_despite_moving_cursor() {
        let c = collector(CollectorConfig::default().with_page_size(2));
        let (result, calls) = run(
            &c,
            (0..5)
                .map(|n| Ok(Page::new(vec![1, 2]).with_cursor(Cursor::new().with("skip", n * 2 + 2))))
                .collect(),
        )
        .await;
        let collected = result.unwrap();
        assert_eq!(ids(&collected), vec![1, 2]);
        assert_eq!(
            collected.status,
            CollectStatus::Stalled {
                cursor: Cursor::new().with("skip", 4)
            }
        );
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn aborted_keeps_partial_items() {
        let c = collector(CollectorConfig::default());
        let (result, _) = run(
            &c,
            vec![
                Ok(Page::new(vec![1]).with_cursor(Cursor::new().with("p", 1))),
                Err(SessionError::TransientService("503".to_string())),
            ],
        )
        .await;
        let collected = result.unwrap();
        assert_eq!(ids(&collected), vec![1]);
        assert!(matches!(collected.status, CollectStatus::Aborted { .. }));
        assert!(!collected.is_success());
    }

    #[tokio::test]
    async fn authorization_expired_propagates() {
        let c = collector(CollectorConfig::default());
        let (result, _) = run(
            &c,
            vec![
                Ok(Page::new(vec![1]).with_cursor(Cursor::new().with("p", 1))),
                Err(SessionError::AuthorizationExpired { status: 401 }),
            ],
        )
        .await;
        assert!(result.unwrap_err().is_authorization_expired());
    }

    #[tokio::test]
    async fn page_limit_is_not_success() {
        let c = collector(CollectorConfig::default().with_max_pages(2));
        let (result, calls) = run(
            &c,
            (1..=5)
                .map(|n| Ok(Page::new(vec![n]).with_cursor(Cursor::new().with("p", n))))
                .collect(),
        )
        .await;
        let collected = result.unwrap();
        assert_eq!(collected.status, CollectStatus::PageLimit { pages: 2 });
        assert!(!collected.is_success());
        assert_eq!(calls.len(), 2);
    }

    struct ListRevealer {
        all: Vec<u32>,
        window: usize,
        offset: usize,
        scans: usize,
    }

    #[async_trait]
    impl Revealer<u32> for ListRevealer {
        async fn scan(&mut self) -> Result<Vec<u32>, SessionError> {
            self.scans += 1;
            let end = (self.offset + self.window).min(self.all.len());
            Ok(self.all[self.offset.min(end)..end].to_vec())
        }

        async fn advance(&mut self) -> Result<(), SessionError> {
            self.offset = (self.offset + self.window / 2).min(self.all.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn reveal_collects_everything_then_idles() {
        let c = collector(CollectorConfig::default().with_max_idle_reveals(3));
        let mut revealer = ListRevealer {
            all: (0..25).collect(),
            window: 6,
            offset: 0,
            scans: 0,
        };
        let collected = c.reveal(&mut revealer).await.unwrap();
        assert_eq!(ids(&collected), (0..25).collect::<Vec<_>>());
        assert_eq!(collected.status, CollectStatus::Complete(StopReason::Idle));
        assert_eq!(revealer.scans, collected.pages);
    }
}
