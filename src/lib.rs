//! Time-bounded cache of signed image URLs for wardrobe items.
//!
//! Signed URLs expire, so each one is reused for a bounded TTL and then
//! fetched again. Concurrent requests for the same item share one upstream
//! fetch, and lookups expose which items are still loading.

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod inflight;
pub mod lookup;
pub mod middleware;
pub mod models;
pub mod resolver;
pub mod routes;
pub mod source;


pub use cache::SignedUrlCache;
pub use error::SourceError;
pub use lookup::{BatchLookup, BatchSnapshot, ImageLookup, ImageState, SingleLookup};
pub use models::ItemId;
pub use resolver::{Resolution, SignedUrlResolver, UpstreamMode};
pub use source::{HttpImageSource, HttpSourceOptions, ImageUrlSource};
