//! Bandwidth accounting for the proxy core.
//!
//! The core reports every hit, miss, strip, sync, prefetch, and passthrough
//! here. Events are appended to a JSON-lines log that external dashboards
//! read; the sink itself only remembers what it needs to credit cache hits
//! with bandwidth savings: the last observed pre-trim size of each package.
//! That memory is rebuilt from the log on startup, so losing it only skews
//! reported savings, never correctness.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use rime_types::PackageName;

/// A single entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Hit {
        package: PackageName,
        served_bytes: u64,
        saved_bytes: u64,
    },
    Miss {
        package: PackageName,
        compressed_bytes: u64,
        elapsed_ms: u64,
    },
    Strip {
        package: PackageName,
        raw_bytes: u64,
        stripped_bytes: u64,
    },
    Sync {
        package: PackageName,
        prev_bytes: u64,
        new_bytes: u64,
    },
    Prefetch {
        package: PackageName,
        raw_bytes: u64,
        stripped_bytes: u64,
    },
    Passthrough {
        path: String,
        elapsed_ms: u64,
    },
}

/// Aggregate counters, maintained alongside the log.
#[derive(Debug, Default)]
struct Totals {
    hits: AtomicU64,
    misses: AtomicU64,
    served_bytes: AtomicU64,
    saved_bytes: AtomicU64,
}

/// A point-in-time copy of the aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub served_bytes: u64,
    pub saved_bytes: u64,
}

enum Backing {
    /// Appends go to the durable event log.
    File(tokio::sync::Mutex<fs_err::tokio::File>),
    /// Appends are captured in memory; used by tests.
    Memory(Mutex<Vec<Event>>),
}

/// The stats sink. One per process, shared by `Arc`; tests construct the
/// in-memory variant instead of touching disk.
pub struct Stats {
    backing: Backing,
    raw_sizes: Mutex<FxHashMap<PackageName, u64>>,
    totals: Totals,
}

impl Stats {
    /// Open the file-backed sink at `path`, replaying any existing log to
    /// rebuild the raw-size memory and counters.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }

        let stats = Self {
            backing: Backing::Memory(Mutex::new(Vec::new())),
            raw_sizes: Mutex::new(FxHashMap::default()),
            totals: Totals::default(),
        };
        match fs_err::tokio::read_to_string(&path).await {
            Ok(log) => {
                for line in log.lines().filter(|line| !line.trim().is_empty()) {
                    match serde_json::from_str::<Event>(line) {
                        Ok(event) => stats.apply(&event),
                        Err(err) => warn!("Skipping malformed event log line: {err}"),
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let file = fs_err::tokio::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            backing: Backing::File(tokio::sync::Mutex::new(file)),
            ..stats
        })
    }

    /// A sink that keeps events in memory. Intended for tests.
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(Vec::new())),
            raw_sizes: Mutex::new(FxHashMap::default()),
            totals: Totals::default(),
        }
    }

    /// A cache hit served `served_bytes` from disk. Savings are credited
    /// against the last observed pre-trim size, when one is known.
    pub async fn record_hit(&self, package: &PackageName, served_bytes: u64) {
        let saved_bytes = self
            .raw_size(package)
            .map_or(0, |raw| raw.saturating_sub(served_bytes));
        self.record(Event::Hit {
            package: package.clone(),
            served_bytes,
            saved_bytes,
        })
        .await;
    }

    /// A cache miss streamed `compressed_bytes` through from upstream.
    pub async fn record_miss(&self, package: &PackageName, compressed_bytes: u64, elapsed_ms: u64) {
        self.record(Event::Miss {
            package: package.clone(),
            compressed_bytes,
            elapsed_ms,
        })
        .await;
    }

    /// The strip pipeline reduced `raw_bytes` to `stripped_bytes`.
    pub async fn record_strip(&self, package: &PackageName, raw_bytes: u64, stripped_bytes: u64) {
        self.record(Event::Strip {
            package: package.clone(),
            raw_bytes,
            stripped_bytes,
        })
        .await;
    }

    /// The synchronizer refreshed an entry of `prev_bytes` to `new_bytes`.
    pub async fn record_sync(&self, package: &PackageName, prev_bytes: u64, new_bytes: u64) {
        self.record(Event::Sync {
            package: package.clone(),
            prev_bytes,
            new_bytes,
        })
        .await;
    }

    /// The prefetcher warmed an entry, reducing `raw_bytes` to
    /// `stripped_bytes`.
    pub async fn record_prefetch(&self, package: &PackageName, raw_bytes: u64, stripped_bytes: u64) {
        self.record(Event::Prefetch {
            package: package.clone(),
            raw_bytes,
            stripped_bytes,
        })
        .await;
    }

    /// A request was forwarded verbatim.
    pub async fn record_passthrough(&self, path: &str, elapsed_ms: u64) {
        self.record(Event::Passthrough {
            path: path.to_string(),
            elapsed_ms,
        })
        .await;
    }

    /// The last observed pre-trim size for `package`, if any.
    pub fn raw_size(&self, package: &PackageName) -> Option<u64> {
        self.raw_sizes.lock().unwrap().get(package).copied()
    }

    pub fn totals(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            hits: self.totals.hits.load(Ordering::Relaxed),
            misses: self.totals.misses.load(Ordering::Relaxed),
            served_bytes: self.totals.served_bytes.load(Ordering::Relaxed),
            saved_bytes: self.totals.saved_bytes.load(Ordering::Relaxed),
        }
    }

    /// Events captured by the in-memory variant; empty for the file-backed
    /// sink.
    pub fn recorded(&self) -> Vec<Event> {
        match &self.backing {
            Backing::Memory(events) => events.lock().unwrap().clone(),
            Backing::File(_) => Vec::new(),
        }
    }

    async fn record(&self, event: Event) {
        self.apply(&event);
        match &self.backing {
            Backing::Memory(events) => events.lock().unwrap().push(event),
            Backing::File(file) => {
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("Failed to serialize stats event: {err}");
                        return;
                    }
                };
                line.push(b'\n');
                let mut file = file.lock().await;
                // Append failures cost an event, never a request.
                if let Err(err) = file.write_all(&line).await {
                    warn!("Failed to append stats event: {err}");
                }
            }
        }
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::Hit {
                served_bytes,
                saved_bytes,
                ..
            } => {
                self.totals.hits.fetch_add(1, Ordering::Relaxed);
                self.totals
                    .served_bytes
                    .fetch_add(*served_bytes, Ordering::Relaxed);
                self.totals
                    .saved_bytes
                    .fetch_add(*saved_bytes, Ordering::Relaxed);
            }
            Event::Miss { .. } => {
                self.totals.misses.fetch_add(1, Ordering::Relaxed);
            }
            Event::Strip {
                package, raw_bytes, ..
            }
            | Event::Prefetch {
                package, raw_bytes, ..
            } => {
                self.raw_sizes
                    .lock()
                    .unwrap()
                    .insert(package.clone(), *raw_bytes);
            }
            Event::Sync {
                package,
                prev_bytes,
                ..
            } => {
                self.raw_sizes
                    .lock()
                    .unwrap()
                    .insert(package.clone(), *prev_bytes);
            }
            Event::Passthrough { .. } => {}
        }
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats")
            .field("totals", &self.totals)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rime_types::PackageName;

    use super::{Event, Stats};

    fn name(raw: &str) -> PackageName {
        PackageName::new(raw).unwrap()
    }

    #[tokio::test]
    async fn strip_feeds_hit_savings() {
        let stats = Stats::in_memory();
        let express = name("express");

        // A hit before any strip has unknown savings.
        stats.record_hit(&express, 1_000).await;
        stats.record_strip(&express, 2_800_000, 900_000).await;
        stats.record_hit(&express, 900_000).await;

        assert_eq!(stats.raw_size(&express), Some(2_800_000));
        let events = stats.recorded();
        assert_eq!(
            events[0],
            Event::Hit {
                package: express.clone(),
                served_bytes: 1_000,
                saved_bytes: 0,
            }
        );
        assert_eq!(
            events[2],
            Event::Hit {
                package: express,
                served_bytes: 900_000,
                saved_bytes: 1_900_000,
            }
        );

        let totals = stats.totals();
        assert_eq!(totals.hits, 2);
        assert_eq!(totals.served_bytes, 901_000);
        assert_eq!(totals.saved_bytes, 1_900_000);
    }

    #[tokio::test]
    async fn sync_and_prefetch_update_raw_sizes() {
        let stats = Stats::in_memory();
        let express = name("express");
        let lodash = name("lodash");

        stats.record_sync(&express, 2_000_000, 700_000).await;
        stats.record_prefetch(&lodash, 500_000, 100_000).await;

        assert_eq!(stats.raw_size(&express), Some(2_000_000));
        assert_eq!(stats.raw_size(&lodash), Some(500_000));
        assert_eq!(stats.raw_size(&name("left-pad")), None);
    }

    #[tokio::test]
    async fn log_replay_restores_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");

        {
            let stats = Stats::open(&path).await.unwrap();
            stats.record_miss(&name("express"), 1_200_000, 80).await;
            stats.record_strip(&name("express"), 2_800_000, 900_000).await;
            stats.record_hit(&name("express"), 900_000).await;
            stats.record_passthrough("/-/v1/search", 12).await;
        }

        let stats = Stats::open(&path).await.unwrap();
        assert_eq!(stats.raw_size(&name("express")), Some(2_800_000));
        let totals = stats.totals();
        assert_eq!(totals.hits, 1);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.saved_bytes, 1_900_000);
    }

    #[tokio::test]
    async fn malformed_log_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        fs_err::tokio::write(
            &path,
            concat!(
                r#"{"event":"strip","package":"express","raw_bytes":100,"stripped_bytes":40}"#,
                "\n",
                "garbage line\n",
            ),
        )
        .await
        .unwrap();

        let stats = Stats::open(&path).await.unwrap();
        assert_eq!(stats.raw_size(&name("express")), Some(100));
    }
}
