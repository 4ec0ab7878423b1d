use std::sync::Arc;

use tokio_util::task::TaskTracker;

use rime_client::UpstreamClient;
use rime_stats::Stats;
use rime_store::Store;

use crate::Prefetcher;

/// Everything a request handler needs, shared across connections.
#[derive(Debug)]
pub struct ProxyContext {
    pub store: Arc<Store>,
    pub stats: Arc<Stats>,
    pub client: UpstreamClient,
    /// `None` disables dependency prefetching.
    pub prefetcher: Option<Arc<Prefetcher>>,
    /// Tracks strip and prefetch tasks so shutdown can wait for their writes.
    pub tasks: TaskTracker,
}

impl ProxyContext {
    pub fn new(
        store: Arc<Store>,
        stats: Arc<Stats>,
        client: UpstreamClient,
        prefetcher: Option<Arc<Prefetcher>>,
    ) -> Self {
        Self {
            store,
            stats,
            client,
            prefetcher,
            tasks: TaskTracker::new(),
        }
    }
}
