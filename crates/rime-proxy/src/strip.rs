use std::io;
use std::sync::Arc;

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use rime_types::{trim, PackageName, Trimmed};

use crate::ProxyContext;

#[derive(Debug, Error)]
pub(crate) enum StripError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("the upstream body is not valid JSON; leaving the staged copy in place")]
    Parse(#[source] serde_json::Error),

    #[error("refusing to cache a document named `{actual}` under `{expected}`")]
    NameMismatch {
        expected: PackageName,
        actual: String,
    },

    #[error("failed to serialize the trimmed document")]
    Serialize(#[source] serde_json::Error),
}

/// Queue the post-response work for a completed metadata miss. Failures are
/// logged and never reach the client; the next miss simply retries.
pub(crate) fn enqueue(
    context: &Arc<ProxyContext>,
    name: PackageName,
    body: Vec<u8>,
    encoding: Option<String>,
) {
    let tracker = context.tasks.clone();
    let context = Arc::clone(context);
    tracker.spawn(async move {
        if let Err(err) = run(&context, &name, body, encoding.as_deref()).await {
            warn!("Strip of {name} failed: {err}");
        }
    });
}

/// The pipeline itself: stage the compressed body, decompress it once,
/// parse, trim, publish to the cache, drop the staging file, and account
/// for the savings. Replaying the same input lands the same cache file.
pub(crate) async fn run(
    context: &ProxyContext,
    name: &PackageName,
    body: Vec<u8>,
    encoding: Option<&str>,
) -> Result<(), StripError> {
    context.store.raw_put(name, &body).await?;

    let raw = decompress(body, encoding).await?;
    let raw_len = raw.len() as u64;

    // Parsing and trimming a multi-megabyte document is CPU work; keep it
    // off the request threads.
    let expected = name.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<(Value, Vec<u8>), StripError> {
        let doc: Value = serde_json::from_slice(&raw).map_err(StripError::Parse)?;
        let trimmed = trim(&doc);
        if let Trimmed::Packument(packument) = &trimmed {
            if let Some(Value::String(actual)) = &packument.name {
                if actual != expected.as_str() {
                    return Err(StripError::NameMismatch {
                        expected,
                        actual: actual.clone(),
                    });
                }
            }
        }
        let bytes = trimmed.to_vec().map_err(StripError::Serialize)?;
        Ok((doc, bytes))
    })
    .await
    .expect("Tokio executor failed, was there a panic?");
    let (doc, bytes) = outcome?;

    context.store.put(name, &bytes).await?;
    context.store.raw_delete(name).await?;
    context
        .stats
        .record_strip(name, raw_len, bytes.len() as u64)
        .await;
    debug!("Stripped {name}: {raw_len} -> {} bytes", bytes.len());

    if let Some(prefetcher) = &context.prefetcher {
        let prefetcher = Arc::clone(prefetcher);
        context.tasks.spawn(async move {
            let warmed = prefetcher.walk(&doc).await;
            if warmed > 0 {
                debug!("Prefetched {warmed} dependencies");
            }
        });
    }
    Ok(())
}

/// Undo the upstream's `content-encoding`. Unknown or absent encodings are
/// treated as identity; `deflate` means the zlib-wrapped form.
async fn decompress(body: Vec<u8>, encoding: Option<&str>) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        Some("br") => {
            BrotliDecoder::new(&body[..]).read_to_end(&mut decoded).await?;
        }
        Some("gzip" | "x-gzip") => {
            GzipDecoder::new(&body[..]).read_to_end(&mut decoded).await?;
        }
        Some("deflate") => {
            ZlibDecoder::new(&body[..]).read_to_end(&mut decoded).await?;
        }
        _ => return Ok(body),
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use serde_json::json;

    use rime_client::UpstreamClientBuilder;
    use rime_stats::{Event, Stats};
    use rime_store::Store;
    use rime_types::PackageName;

    use super::{decompress, run, StripError};
    use crate::ProxyContext;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn context() -> (tempfile::TempDir, Arc<ProxyContext>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::init(dir.path().join("cache")).unwrap());
        let stats = Arc::new(Stats::in_memory());
        let client = UpstreamClientBuilder::new().build();
        let context = Arc::new(ProxyContext::new(store, stats, client, None));
        (dir, context)
    }

    #[tokio::test]
    async fn decompress_by_encoding() {
        let body = br#"{"hello":"world"}"#;

        assert_eq!(decompress(body.to_vec(), None).await.unwrap(), body);
        assert_eq!(
            decompress(body.to_vec(), Some("unknown")).await.unwrap(),
            body
        );
        assert_eq!(decompress(gzip(body), Some("gzip")).await.unwrap(), body);
        assert_eq!(decompress(gzip(body), Some("GZIP")).await.unwrap(), body);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        let deflated = encoder.finish().unwrap();
        assert_eq!(decompress(deflated, Some("deflate")).await.unwrap(), body);
    }

    #[tokio::test]
    async fn strip_populates_the_cache_and_clears_staging() {
        let (_dir, context) = context();
        let express = PackageName::new("express").unwrap();
        let doc = json!({
            "name": "express",
            "dist-tags": { "latest": "4.18.2" },
            "versions": {
                "4.18.2": {
                    "version": "4.18.2",
                    "description": "dropped by the trim",
                    "dist": { "tarball": "https://example.invalid/e.tgz", "unpackedSize": 9 }
                }
            },
            "readme": "dropped"
        });
        let raw = serde_json::to_vec(&doc).unwrap();
        let body = gzip(&raw);

        run(&context, &express, body, Some("gzip")).await.unwrap();

        let cached = context.store.get(&express).await.unwrap().unwrap();
        assert_eq!(cached, rime_types::trim(&doc).to_vec().unwrap());
        assert_eq!(context.store.raw_get(&express).await.unwrap(), None);

        let events = context.stats.recorded();
        assert_eq!(
            events,
            [Event::Strip {
                package: express.clone(),
                raw_bytes: raw.len() as u64,
                stripped_bytes: cached.len() as u64,
            }]
        );
        assert_eq!(context.stats.raw_size(&express), Some(raw.len() as u64));
    }

    #[tokio::test]
    async fn unparseable_bodies_leave_staging_in_place() {
        let (_dir, context) = context();
        let express = PackageName::new("express").unwrap();

        let outcome = run(&context, &express, b"{ not json".to_vec(), None).await;
        assert!(matches!(outcome, Err(StripError::Parse(_))));

        assert_eq!(context.store.get(&express).await.unwrap(), None);
        assert_eq!(
            context.store.raw_get(&express).await.unwrap().as_deref(),
            Some(b"{ not json".as_slice())
        );
        assert!(context.stats.recorded().is_empty());
    }

    #[tokio::test]
    async fn mismatched_names_are_not_cached() {
        let (_dir, context) = context();
        let express = PackageName::new("express").unwrap();
        let doc = json!({
            "name": "not-express",
            "dist-tags": { "latest": "1.0.0" },
            "versions": { "1.0.0": { "version": "1.0.0" } }
        });

        let outcome = run(
            &context,
            &express,
            serde_json::to_vec(&doc).unwrap(),
            None,
        )
        .await;
        assert!(matches!(outcome, Err(StripError::NameMismatch { .. })));
        assert_eq!(context.store.get(&express).await.unwrap(), None);
    }

    #[tokio::test]
    async fn replaying_the_pipeline_is_idempotent() {
        let (_dir, context) = context();
        let express = PackageName::new("express").unwrap();
        let doc = json!({
            "name": "express",
            "dist-tags": { "latest": "4.18.2" },
            "versions": { "4.18.2": { "version": "4.18.2" } }
        });
        let body = serde_json::to_vec(&doc).unwrap();

        run(&context, &express, body.clone(), None).await.unwrap();
        let first = context.store.get(&express).await.unwrap().unwrap();
        run(&context, &express, body, None).await.unwrap();
        let second = context.store.get(&express).await.unwrap().unwrap();
        assert_eq!(first, second);
    }
}
