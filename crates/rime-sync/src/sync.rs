use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use rime_client::UpstreamClient;
use rime_stats::Stats;
use rime_store::Store;
use rime_types::{trim, PackageName, Trimmed};

use crate::SeqCursor;

/// Tunables for the synchronizer loop.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Sleep between polls when the feed has no more pages.
    pub poll_interval: Duration,
    /// Cap for the rate-limit backoff.
    pub max_backoff: Duration,
    /// Page size requested from the feed.
    pub page_limit: usize,
    /// Concurrent refetches per batch.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            page_limit: 1000,
            concurrency: 5,
        }
    }
}

/// What a single [`Synchronizer::step`] did, and how long to wait before
/// the next one.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// A page was applied and the cursor advanced. When `full_page` is set
    /// the upstream has more; poll again without sleeping.
    Applied {
        refreshed: usize,
        deleted: usize,
        full_page: bool,
    },
    /// The feed rate-limited us. Sleep this long; the cursor did not move
    /// and the next backoff is doubled (up to the cap).
    RateLimited(Duration),
    /// Some other failure. Sleep the current backoff and retry; the cursor
    /// did not move.
    Failed(Duration),
}

/// Follows the upstream changes feed and keeps cached entries current:
/// edits overwrite the cached document, deletions remove it, everything
/// else is ignored. Only packages already in the store are touched.
#[derive(Debug)]
pub struct Synchronizer {
    client: UpstreamClient,
    store: Arc<Store>,
    stats: Arc<Stats>,
    cursor: SeqCursor,
    options: SyncOptions,
    backoff: Duration,
}

impl Synchronizer {
    pub fn new(
        client: UpstreamClient,
        store: Arc<Store>,
        stats: Arc<Stats>,
        cursor: SeqCursor,
        options: SyncOptions,
    ) -> Self {
        let backoff = options.poll_interval;
        Self {
            client,
            store,
            stats,
            cursor,
            options,
            backoff,
        }
    }

    /// Drive the loop until shutdown. Every failure is absorbed into a
    /// backoff sleep; the task never exits on its own.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let delay = tokio::select! {
                () = shutdown.cancelled() => return,
                outcome = self.step() => match outcome {
                    StepOutcome::Applied { full_page: true, .. } => continue,
                    StepOutcome::Applied { .. } => self.options.poll_interval,
                    StepOutcome::RateLimited(delay) | StepOutcome::Failed(delay) => delay,
                },
            };
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One poll of the feed: fetch a page, apply it, commit the cursor.
    pub async fn step(&mut self) -> StepOutcome {
        match self.poll_once().await {
            Ok(outcome) => {
                self.backoff = self.options.poll_interval;
                outcome
            }
            Err(SyncError::Client(rime_client::Error::RateLimited)) => {
                let delay = self.backoff;
                self.backoff = (self.backoff * 2).min(self.options.max_backoff);
                debug!("Changes feed rate-limited; backing off for {delay:?}");
                StepOutcome::RateLimited(delay)
            }
            Err(err) => {
                warn!("Sync step failed: {err}");
                StepOutcome::Failed(self.backoff)
            }
        }
    }

    async fn poll_once(&mut self) -> Result<StepOutcome, SyncError> {
        let since = self.cursor.load().await?;
        let page = self
            .client
            .changes(&since, self.options.page_limit)
            .await?;
        let total = page.results.len();
        trace!("Fetched {total} changes after {since}");

        let mut deleted = 0;
        let mut queued = FxHashSet::default();
        let mut to_fetch: Vec<PackageName> = Vec::new();
        for change in &page.results {
            let Ok(name) = PackageName::new(change.id.clone()) else {
                trace!("Skipping change with invalid id `{}`", change.id);
                continue;
            };
            // Mixed-case ids collide with their lowercase twins on
            // case-insensitive filesystems.
            if !name.is_lowercase() {
                trace!("Skipping non-lowercase id `{name}`");
                continue;
            }
            // The cache is populated by requests, never by the feed.
            if !self.store.contains(&name).await? {
                continue;
            }
            if change.deleted {
                self.store.delete(&name).await?;
                debug!("Removed `{name}`: deleted upstream");
                deleted += 1;
                // A deletion supersedes any earlier edit in this page.
                if queued.remove(&name) {
                    to_fetch.retain(|queued| queued != &name);
                }
            } else if queued.insert(name.clone()) {
                to_fetch.push(name);
            }
        }

        let refresh_futures: Vec<_> = to_fetch
            .iter()
            .map(|name: &PackageName| {
                Box::pin(self.refresh(name))
                    as std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>>
            })
            .collect();
        let refreshed = futures::stream::iter(refresh_futures)
            .buffer_unordered(self.options.concurrency)
            .filter(|refreshed| std::future::ready(*refreshed))
            .count()
            .await;

        // Only now is the batch durable; commit the position.
        self.cursor.store(&page.last_seq).await?;

        Ok(StepOutcome::Applied {
            refreshed,
            deleted,
            full_page: total >= self.options.page_limit,
        })
    }

    /// Overwrite one cached entry with a freshly fetched, trimmed document.
    /// Failures leave the entry untouched.
    async fn refresh(&self, name: &PackageName) -> bool {
        match self.refresh_inner(name).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to refresh `{name}`: {err}");
                false
            }
        }
    }

    async fn refresh_inner(&self, name: &PackageName) -> Result<(), SyncError> {
        let prev = self.store.size(name).await?.unwrap_or(0);
        let fetched = self.client.packument(name).await?;
        let trimmed = trim(&fetched.doc);
        // A document without the metadata shape would poison the entry.
        let Trimmed::Packument(_) = &trimmed else {
            return Err(SyncError::NotMetadata(name.clone()));
        };
        let bytes = trimmed.to_vec()?;
        self.store.put(name, &bytes).await?;
        self.stats
            .record_sync(name, prev, bytes.len() as u64)
            .await;
        debug!("Refreshed `{name}`: {prev} -> {} bytes", bytes.len());
        Ok(())
    }
}

#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Client(#[from] rime_client::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("upstream returned a non-metadata document for `{0}`")]
    NotMetadata(PackageName),
}
