use std::time::Duration;

use http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde_json::Value;
use tracing::trace;
use url::Url;

use rime_types::{ChangesPage, PackageName, Seq};

use crate::Error;

/// A builder for an [`UpstreamClient`].
#[derive(Debug, Clone)]
pub struct UpstreamClientBuilder {
    registry: Url,
    changes: Url,
    retries: u32,
    timeout: Duration,
    passthrough_timeout: Duration,
}

impl Default for UpstreamClientBuilder {
    fn default() -> Self {
        Self {
            registry: Url::parse("https://registry.npmjs.org").unwrap(),
            changes: Url::parse("https://replicate.npmjs.com/_changes").unwrap(),
            retries: 3,
            timeout: Duration::from_secs(30),
            passthrough_timeout: Duration::from_secs(300),
        }
    }
}

impl UpstreamClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn registry(mut self, registry: Url) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn changes(mut self, changes: Url) -> Self {
        self.changes = changes;
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn passthrough_timeout(mut self, passthrough_timeout: Duration) -> Self {
        self.passthrough_timeout = passthrough_timeout;
        self
    }

    pub fn build(self) -> UpstreamClient {
        let client_raw = ClientBuilder::new()
            .user_agent("rime")
            .pool_max_idle_per_host(20)
            .timeout(self.timeout)
            .build()
            .expect("Failed to build the HTTP client.");

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(self.retries);
        let retry_strategy = RetryTransientMiddleware::new_with_policy(retry_policy);
        let client = reqwest_middleware::ClientBuilder::new(client_raw.clone())
            .with(retry_strategy)
            .build();

        UpstreamClient {
            registry: self.registry,
            changes: self.changes,
            client,
            client_raw,
            passthrough_timeout: self.passthrough_timeout,
        }
    }
}

/// A full metadata document as fetched by the background paths, together
/// with its decompressed (pre-trim) length.
#[derive(Debug, Clone)]
pub struct FetchedPackument {
    pub doc: Value,
    pub raw_len: u64,
}

/// A client for the upstream registry and its changes feed.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    registry: Url,
    changes: Url,
    /// Retries transient failures; used by the synchronizer and prefetcher.
    client: ClientWithMiddleware,
    /// No middleware: the proxy data path replays upstream responses
    /// verbatim (including 5xx) and streams request bodies, which the retry
    /// layer cannot replay.
    client_raw: Client,
    passthrough_timeout: Duration,
}

impl UpstreamClient {
    /// Fetch the full metadata document for `name`, decompressed and parsed.
    pub async fn packument(&self, name: &PackageName) -> Result<FetchedPackument, Error> {
        let url = packument_url(&self.registry, name);
        trace!("Fetching metadata for {name} from {url}");
        let response = self.client.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::PackageNotFound(name.to_string()));
        }
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        let doc: Value = serde_json::from_slice(&bytes)
            .map_err(|err| Error::from_json_err(err, url.to_string()))?;
        Ok(FetchedPackument {
            doc,
            raw_len: bytes.len() as u64,
        })
    }

    /// Open a streaming request for the metadata document of `name`,
    /// carrying over the client's request headers.
    ///
    /// The response body arrives exactly as the upstream sends it: the
    /// conditional-request headers are removed so the upstream always
    /// returns a body, and an `accept-encoding` is supplied when the client
    /// sent none so the bytes stay compressed end to end. The status is not
    /// checked; callers replay it.
    pub async fn packument_stream(
        &self,
        name: &PackageName,
        headers: &HeaderMap,
    ) -> Result<Response, Error> {
        let url = packument_url(&self.registry, name);
        let mut headers = sanitized(headers);
        headers.remove(IF_NONE_MATCH);
        headers.remove(IF_MODIFIED_SINCE);
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        trace!("Streaming metadata for {name} from {url}");
        Ok(self.client_raw.get(url).headers(headers).send().await?)
    }

    /// Forward an arbitrary request to the upstream registry, streaming the
    /// body in both directions. No retries; the caller replays the response.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<Response, Error> {
        let url = self.registry.join(path_and_query)?;
        let mut builder = self
            .client_raw
            .request(method, url)
            .headers(sanitized(headers))
            .timeout(self.passthrough_timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder.send().await?)
    }

    /// Fetch one page of the changes feed starting after `since`.
    ///
    /// Rate limiting surfaces as [`Error::RateLimited`] so the synchronizer
    /// can run its own backoff; no middleware retries happen underneath.
    pub async fn changes(&self, since: &Seq, limit: usize) -> Result<ChangesPage, Error> {
        let url = changes_url(&self.changes, since, limit);
        trace!("Fetching changes from {url}");
        let response = self.client_raw.get(url.clone()).send().await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(Error::RateLimited),
            status => return Err(Error::UnexpectedStatus(status)),
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| Error::from_json_err(err, url.to_string()))
    }
}

/// Drop the headers the proxy must own: `host` tracks the upstream, and the
/// framing headers are reqwest's to set.
fn sanitized(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers
}

fn packument_url(registry: &Url, name: &PackageName) -> Url {
    let mut url = registry.clone();
    url.path_segments_mut()
        .unwrap()
        .pop_if_empty()
        .push(name.as_str());
    url
}

fn changes_url(changes: &Url, since: &Seq, limit: usize) -> Url {
    let mut url = changes.clone();
    url.query_pairs_mut()
        .append_pair("since", since.as_str())
        .append_pair("limit", &limit.to_string());
    url
}

#[cfg(test)]
mod tests {
    use url::Url;

    use rime_types::{PackageName, Seq};

    use super::{changes_url, packument_url};

    #[test]
    fn packument_urls() {
        let registry = Url::parse("https://registry.npmjs.org").unwrap();
        assert_eq!(
            packument_url(&registry, &PackageName::new("express").unwrap()).as_str(),
            "https://registry.npmjs.org/express"
        );
        // The scope separator stays a single path segment.
        assert_eq!(
            packument_url(&registry, &PackageName::new("@types/node").unwrap()).as_str(),
            "https://registry.npmjs.org/@types%2Fnode"
        );
    }

    #[test]
    fn changes_urls() {
        let changes = Url::parse("https://replicate.npmjs.com/_changes").unwrap();
        assert_eq!(
            changes_url(&changes, &Seq::new("42"), 1000).as_str(),
            "https://replicate.npmjs.com/_changes?since=42&limit=1000"
        );
    }
}
