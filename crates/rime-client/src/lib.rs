pub use client::{FetchedPackument, UpstreamClient, UpstreamClientBuilder};
pub use error::Error;

mod client;
mod error;
