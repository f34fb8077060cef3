//! HTTP response caching engine.
//!
//! A [`filter::CacheFilter`] drives each request through a shared
//! [`cache::SharedCache`]: concurrent requests for one key are coordinated by
//! a single [`entry::ActiveEntry`], so one origin fetch populates the cache
//! while the other requests stream from it.

pub mod arena;
pub mod backend;
pub mod cache;
pub mod entry;
pub mod error;
pub mod file;
pub mod filter;
pub mod headers;
pub mod key;
pub mod lookup;
pub mod range;
pub mod registry;
pub mod sharded;
pub mod status;
pub mod store;
pub mod tasks;
pub mod time;
pub mod upstream;
pub mod validation;

pub use backend::{HttpCache, InsertContext, LookupBody, LookupContext};
pub use cache::SharedCache;
pub use error::{CacheError, OriginError, StreamClosed};
pub use filter::{CacheFilter, Downstream, FilterConfig, FilterHeadersStatus, FilterState, StreamInfo};
pub use headers::{RequestHeaders, ResponseHeaders, VaryAllowList};
pub use status::{CacheFilterLoggingInfo, InsertStatus, LookupStatus};
pub use store::{EntryStore, MemoryStore, StoreStats};
pub use tasks::TaskRegistry;
pub use upstream::{Origin, OriginEvent, OriginStream};
