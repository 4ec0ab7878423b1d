use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rustc_hash::FxHashSet;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use rime_client::UpstreamClient;
use rime_stats::Stats;
use rime_store::Store;
use rime_types::{trim, PackageName};

/// Walks the dependency closure of a freshly fetched document to warm the
/// cache: breadth-first, bounded in fan-out and in total size.
///
/// One prefetcher exists per process. Concurrent walks share the fetch
/// semaphore and an in-flight set, so a package reached by two overlapping
/// walks is fetched once.
#[derive(Debug)]
pub struct Prefetcher {
    client: UpstreamClient,
    store: Arc<Store>,
    stats: Arc<Stats>,
    /// Bounds concurrent upstream fetches across all walks.
    fetches: Semaphore,
    /// Packages some walk is currently fetching.
    inflight: Mutex<FxHashSet<PackageName>>,
    /// Most packages fetched per walk.
    limit: usize,
}

impl Prefetcher {
    pub fn new(
        client: UpstreamClient,
        store: Arc<Store>,
        stats: Arc<Stats>,
        concurrency: usize,
        limit: usize,
    ) -> Self {
        Self {
            client,
            store,
            stats,
            fetches: Semaphore::new(concurrency),
            inflight: Mutex::new(FxHashSet::default()),
            limit,
        }
    }

    /// Walk the dependency graph breadth-first from `doc`'s `latest`
    /// version. Returns how many packages were fetched and cached.
    ///
    /// The visited set is what terminates cyclic graphs; the budget only
    /// guards against runaway closures.
    pub async fn walk(&self, doc: &Value) -> usize {
        let mut visited = FxHashSet::default();
        let mut queue: VecDeque<PackageName> = VecDeque::new();
        for dependency in latest_dependencies(doc) {
            if visited.insert(dependency.clone()) {
                queue.push_back(dependency);
            }
        }

        let mut budget = self.limit;
        let mut warmed = 0;
        let mut pending = FuturesUnordered::new();
        loop {
            while budget > 0 {
                let Some(name) = queue.pop_front() else { break };
                budget -= 1;
                pending.push(self.fetch(name));
            }
            let Some(outcome) = pending.next().await else {
                break;
            };
            if let Some(dependencies) = outcome {
                warmed += 1;
                for dependency in dependencies {
                    if visited.insert(dependency.clone()) {
                        queue.push_back(dependency);
                    }
                }
            }
        }
        if budget == 0 && !queue.is_empty() {
            debug!(
                "Prefetch budget exhausted with {} packages still queued",
                queue.len()
            );
        }
        warmed
    }

    /// One package: skipped when cached or being fetched by another walk,
    /// otherwise fetched, trimmed, and stored. A failure aborts this branch
    /// only; the walk continues elsewhere.
    async fn fetch(&self, name: PackageName) -> Option<Vec<PackageName>> {
        if !self.register(&name) {
            return None;
        }
        let outcome = self.fetch_inner(&name).await;
        self.finish(&name);
        match outcome {
            Ok(dependencies) => dependencies,
            Err(err) => {
                debug!("Prefetch of {name} failed: {err}");
                None
            }
        }
    }

    async fn fetch_inner(
        &self,
        name: &PackageName,
    ) -> Result<Option<Vec<PackageName>>, PrefetchError> {
        if self.store.contains(name).await? {
            return Ok(None);
        }
        let Ok(_permit) = self.fetches.acquire().await else {
            return Ok(None);
        };
        let fetched = self.client.packument(name).await?;
        let bytes = trim(&fetched.doc).to_vec()?;
        self.store.put(name, &bytes).await?;
        self.stats
            .record_prefetch(name, fetched.raw_len, bytes.len() as u64)
            .await;
        Ok(Some(latest_dependencies(&fetched.doc)))
    }

    /// Claim `name` for this walk; `false` means another walk got there
    /// first and this one must not fetch in parallel.
    fn register(&self, name: &PackageName) -> bool {
        self.inflight.lock().unwrap().insert(name.clone())
    }

    fn finish(&self, name: &PackageName) {
        self.inflight.lock().unwrap().remove(name);
    }
}

#[derive(Debug, Error)]
enum PrefetchError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Client(#[from] rime_client::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The dependency names of the document's `latest` version: the union of
/// `dependencies`, `optionalDependencies`, and `peerDependencies`.
fn latest_dependencies(doc: &Value) -> Vec<PackageName> {
    fn latest_entry(doc: &Value) -> Option<&Value> {
        let latest = doc.get("dist-tags")?.get("latest")?.as_str()?;
        doc.get("versions")?.get(latest)
    }

    let Some(entry) = latest_entry(doc) else {
        return Vec::new();
    };
    let mut seen = FxHashSet::default();
    let mut dependencies = Vec::new();
    for field in ["dependencies", "optionalDependencies", "peerDependencies"] {
        let Some(map) = entry.get(field).and_then(Value::as_object) else {
            continue;
        };
        for dependency in map.keys() {
            let Ok(name) = PackageName::new(dependency.clone()) else {
                continue;
            };
            if seen.insert(name.clone()) {
                dependencies.push(name);
            }
        }
    }
    dependencies
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use rime_types::PackageName;

    use super::{latest_dependencies, Prefetcher};

    #[test]
    fn unions_the_latest_dependency_fields() {
        let doc = json!({
            "name": "root",
            "dist-tags": { "latest": "2.0.0" },
            "versions": {
                "1.0.0": { "dependencies": { "old-only": "1.0.0" } },
                "2.0.0": {
                    "dependencies": { "accepts": "~1.3.8", "depd": "2.0.0" },
                    "optionalDependencies": { "fsevents": "^2.3.2" },
                    "peerDependencies": { "accepts": "*", "@types/node": "*" }
                }
            }
        });
        let names: Vec<String> = latest_dependencies(&doc)
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, ["accepts", "depd", "fsevents", "@types/node"]);
    }

    #[test]
    fn tolerates_absent_shapes() {
        assert!(latest_dependencies(&json!({})).is_empty());
        assert!(latest_dependencies(&json!({ "dist-tags": {} })).is_empty());
        assert!(latest_dependencies(&json!({
            "dist-tags": { "latest": "1.0.0" },
            "versions": {}
        }))
        .is_empty());
        // Invalid dependency names are skipped, not fatal.
        assert!(latest_dependencies(&json!({
            "dist-tags": { "latest": "1.0.0" },
            "versions": { "1.0.0": { "dependencies": { "..": "*" } } }
        }))
        .is_empty());
    }

    #[test]
    fn inflight_registration_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let prefetcher = Prefetcher::new(
            rime_client::UpstreamClientBuilder::new().build(),
            std::sync::Arc::new(rime_store::Store::init(dir.path().join("cache")).unwrap()),
            std::sync::Arc::new(rime_stats::Stats::in_memory()),
            5,
            200,
        );
        let name = PackageName::new("express").unwrap();

        assert!(prefetcher.register(&name));
        // A second walk reaching the same package must not fetch in parallel.
        assert!(!prefetcher.register(&name));
        prefetcher.finish(&name);
        assert!(prefetcher.register(&name));
    }
}
