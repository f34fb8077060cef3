//! The seam between the request filter and a cache implementation.
//!
//! Every operation that may wait is an `async fn` whose future is awaited by
//! the requesting stream's own task, so results always arrive on that task
//! and never re-enter the caller. Dropping a lookup or insert context is the
//! cancellation signal.

use crate::error::CacheError;
use crate::headers::ResponseHeaders;
use crate::lookup::{LookupRequest, LookupResult, ResponseMetadata};
use crate::range::AdjustedByteRange;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::any::Any;

/// A chunk of cached body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupBody {
    /// `None` when nothing is left at the requested offset.
    pub data: Option<Bytes>,
    /// No more body and no trailers follow.
    pub end_stream: bool,
}

#[async_trait]
pub trait HttpCache: Send + Sync {
    fn make_lookup_context(&self, request: LookupRequest) -> Box<dyn LookupContext>;

    /// Turn a lookup into an insert. `None` means the cache declines.
    fn make_insert_context(&self, lookup: Box<dyn LookupContext>) -> Option<Box<dyn InsertContext>>;

    /// Refresh the stored headers of a validated entry.
    async fn update_headers(
        &self,
        lookup: &dyn LookupContext,
        headers: &ResponseHeaders,
        metadata: ResponseMetadata,
    ) -> bool;
}

#[async_trait]
pub trait LookupContext: Send + Sync {
    fn request(&self) -> &LookupRequest;

    /// Resolve the lookup. The flag is `true` when the response has neither
    /// body nor trailers.
    async fn get_headers(&mut self) -> (LookupResult, bool);

    async fn get_body(&mut self, range: AdjustedByteRange) -> Result<LookupBody, CacheError>;

    async fn get_trailers(&mut self) -> Result<HeaderMap, CacheError>;

    /// The origin response for this lookup's key cannot be stored.
    fn response_not_cacheable(&mut self) {}

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Streams one origin response into the cache. An `Err` means the cache
/// aborted the insert; no further calls should be made.
#[async_trait]
pub trait InsertContext: Send {
    async fn insert_headers(
        &mut self,
        headers: &ResponseHeaders,
        metadata: ResponseMetadata,
        end_stream: bool,
    ) -> Result<(), CacheError>;

    async fn insert_body(&mut self, chunk: Bytes, end_stream: bool) -> Result<(), CacheError>;

    async fn insert_trailers(&mut self, trailers: HeaderMap) -> Result<(), CacheError>;
}
