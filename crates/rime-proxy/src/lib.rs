//! The HTTP front door of the proxy.
//!
//! Requests are classified into health probes, verbatim passthroughs, and
//! metadata lookups. Metadata hits are served straight from the cache store;
//! misses stream through from the upstream registry while a copy is buffered
//! for the asynchronous strip pipeline, which trims the document and
//! populates the cache. Fresh misses can also kick off a bounded
//! breadth-first prefetch of the package's dependency closure.

pub use context::ProxyContext;
pub use prefetch::Prefetcher;
pub use server::serve;

mod classify;
mod context;
mod prefetch;
mod server;
mod strip;
